//! Per-destination circuit breakers.
//!
//! One breaker guards each `(agent role, worker instance)` pair. Consecutive
//! failures reaching the threshold open the circuit for a cooldown; after
//! the cooldown a single probe is admitted (half-open). A successful probe
//! closes the circuit, a failed one re-opens it. Open-circuit dispatches
//! fail immediately with `CircuitOpen` and never reach the worker.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Breaker tuning shared by every destination.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// The circuit opens on the Nth consecutive failure.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before admitting a probe.
    #[serde(with = "super::duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Admitted,
    /// Proceed as the single half-open probe.
    Probe,
    /// Rejected; the caller fails fast with `CircuitOpen`.
    Rejected,
}

/// Failure-counting state machine for one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
            probing: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.config.cooldown || self.probing => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    /// Decide whether a dispatch may proceed right now.
    pub fn try_admit(&mut self) -> Admission {
        match self.opened_at {
            None => Admission::Admitted,
            Some(opened) => {
                if self.probing {
                    // A probe is already in flight; everyone else waits.
                    Admission::Rejected
                } else if opened.elapsed() >= self.config.cooldown {
                    self.probing = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful worker interaction.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probing = false;
    }

    /// Record a failed worker interaction (timeout, transient, permanent).
    pub fn on_failure(&mut self) {
        if self.probing {
            // Failed probe re-opens for a fresh cooldown.
            self.probing = false;
            self.opened_at = Some(Instant::now());
            return;
        }
        self.consecutive_failures += 1;
        if self.opened_at.is_none() && self.consecutive_failures >= self.config.failure_threshold {
            self.opened_at = Some(Instant::now());
        }
    }
}
