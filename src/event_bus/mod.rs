//! Per-session event streaming: ordered logs, replay, and backpressure.
//!
//! Every session owns an ordered event log with monotone sequence numbers.
//! Subscribers declare a starting sequence (`Seq(0)` for full replay,
//! `Latest` for live-only) and then receive events through a bounded
//! per-subscriber buffer. When a subscriber falls behind, lossy
//! `StepProgress` events are shed first; critical events are never dropped
//! for an attached subscriber -- one that cannot accept them is detached
//! and its stream ends with [`SubscriptionEnd::Overflowed`].
//!
//! Ordering guarantee: within one session, all subscribers observe the
//! critical events in publication order; checkpoint persistence happens
//! before the corresponding `StepCompleted` is published (enforced by the
//! engine's call ordering).

mod bus;
mod event;
mod log;

pub use bus::{EventBus, EventSubscription, SubscribeFrom, SubscriptionEnd};
pub use event::{
    CompletionSummary, EventClass, EventSeverity, SequencedEvent, WorkflowEvent,
};
pub use log::SessionEventLog;
