//! Fan-out event bus with replay and per-subscriber backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ConfigHandle;
use crate::types::SessionId;

use super::event::{SequencedEvent, WorkflowEvent};
use super::log::SessionEventLog;

/// Where a subscription starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// Replay retained events from this sequence number, then go live.
    /// `Seq(0)` is a full replay.
    Seq(u64),
    /// Live-only: skip everything already in the log.
    Latest,
}

/// Why a subscription stopped yielding events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The session's channel was closed (session purged or bus dropped).
    Closed,
    /// This subscriber fell behind on critical events and was detached.
    Overflowed,
}

/// Receiving side of one subscription.
///
/// Backpressure contract: lossy events (`StepProgress`) are shed silently
/// when this subscriber's buffer is full; a full buffer on a critical
/// event detaches the subscriber, and `recv` reports
/// [`SubscriptionEnd::Overflowed`] once the buffered backlog drains.
#[derive(Debug)]
pub struct EventSubscription {
    rx: flume::Receiver<SequencedEvent>,
    overflowed: Arc<AtomicBool>,
}

impl EventSubscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<SequencedEvent, SubscriptionEnd> {
        match self.rx.recv_async().await {
            Ok(event) => Ok(event),
            Err(_) => Err(self.end_reason()),
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<SequencedEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event with a deadline; `None` on timeout.
    pub async fn next_timeout(
        &mut self,
        duration: Duration,
    ) -> Option<Result<SequencedEvent, SubscriptionEnd>> {
        match tokio::time::timeout(duration, self.recv()).await {
            Ok(result) => Some(result),
            Err(_) => None,
        }
    }

    fn end_reason(&self) -> SubscriptionEnd {
        if self.overflowed.load(Ordering::Relaxed) {
            SubscriptionEnd::Overflowed
        } else {
            SubscriptionEnd::Closed
        }
    }
}

struct SubscriberHandle {
    tx: flume::Sender<SequencedEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct SessionChannel {
    log: SessionEventLog,
    subscribers: Vec<SubscriberHandle>,
}

struct BusInner {
    sessions: RwLock<FxHashMap<SessionId, SessionChannel>>,
    config: ConfigHandle,
    dropped_lossy: AtomicUsize,
}

/// Per-session ordered event fan-out.
///
/// One bus serves the whole orchestrator. Publication appends to the
/// session's retained log (so late subscribers can replay) and forwards to
/// every live subscriber through a bounded buffer. Within a session,
/// subscribers observe events in exactly the order they were published.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    #[must_use]
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sessions: RwLock::new(FxHashMap::default()),
                config,
                dropped_lossy: AtomicUsize::new(0),
            }),
        }
    }

    /// Create the session's channel if it does not exist yet.
    pub fn ensure_session(&self, session_id: &SessionId) {
        self.inner
            .sessions
            .write()
            .entry(session_id.clone())
            .or_default();
    }

    /// Publish one event, returning its sequence number.
    pub fn publish(&self, session_id: &SessionId, event: WorkflowEvent) -> u64 {
        let events_config = self.inner.config.current().events.clone();
        let mut sessions = self.inner.sessions.write();
        let channel = sessions.entry(session_id.clone()).or_default();
        let sequenced = channel.log.append(session_id, event);
        channel.log.enforce_retention(&events_config, Utc::now());

        let lossy = sequenced.event.is_lossy();
        let mut dropped = 0usize;
        channel.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(sequenced.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    if lossy {
                        dropped += 1;
                        true
                    } else {
                        // Critical overflow: detach this subscriber only.
                        subscriber.overflowed.store(true, Ordering::Relaxed);
                        false
                    }
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
        if dropped > 0 {
            let total = self
                .inner
                .dropped_lossy
                .fetch_add(dropped, Ordering::Relaxed)
                + dropped;
            tracing::debug!(
                session = %session_id,
                dropped,
                total_dropped = total,
                "shed lossy events for slow subscribers"
            );
        }
        sequenced.seq
    }

    /// Subscribe to a session's events.
    ///
    /// Returns `None` when the session has no channel (unknown session).
    /// Replayed events pass through the same bounded buffer as live ones,
    /// with identical shed/overflow rules.
    #[must_use]
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        from: SubscribeFrom,
    ) -> Option<EventSubscription> {
        let buffer = self.inner.config.current().events.subscriber_buffer.max(1);
        let mut sessions = self.inner.sessions.write();
        let channel = sessions.get_mut(session_id)?;

        let (tx, rx) = flume::bounded(buffer);
        let overflowed = Arc::new(AtomicBool::new(false));

        let start = match from {
            SubscribeFrom::Seq(seq) => Some(seq),
            SubscribeFrom::Latest => None,
        };
        let mut keep = true;
        if let Some(start_seq) = start {
            for event in channel.log.replay_from(start_seq) {
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(ev)) => {
                        if ev.event.is_lossy() {
                            continue;
                        }
                        overflowed.store(true, Ordering::Relaxed);
                        keep = false;
                        break;
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        keep = false;
                        break;
                    }
                }
            }
        }

        if keep {
            channel.subscribers.push(SubscriberHandle {
                tx,
                overflowed: overflowed.clone(),
            });
        }
        Some(EventSubscription { rx, overflowed })
    }

    /// Highest sequence published for a session (0 when none).
    #[must_use]
    pub fn latest_seq(&self, session_id: &SessionId) -> u64 {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|c| c.log.latest_seq())
            .unwrap_or(0)
    }

    /// Retained events from a sequence number, without subscribing.
    #[must_use]
    pub fn replay(&self, session_id: &SessionId, from: u64) -> Vec<SequencedEvent> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|c| c.log.replay_from(from))
            .unwrap_or_default()
    }

    /// Drop a purged session's log and disconnect its subscribers.
    pub fn purge_session(&self, session_id: &SessionId) {
        self.inner.sessions.write().remove(session_id);
    }

    /// Total lossy events shed across all sessions.
    #[must_use]
    pub fn dropped_lossy(&self) -> usize {
        self.inner.dropped_lossy.load(Ordering::Relaxed)
    }
}
