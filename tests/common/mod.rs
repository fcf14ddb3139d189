//! Shared fixtures for the integration suite.
#![allow(dead_code)]

pub mod agents;
pub mod fixtures;

pub use agents::{Script, ScriptedPort};
pub use fixtures::{
    collect_until_terminal, happy_port, state_changes, two_warning_validators, wait_for_phase,
};
