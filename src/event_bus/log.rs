//! Per-session ordered event log with bounded retention.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::EventsConfig;

use super::event::{SequencedEvent, WorkflowEvent};
use crate::types::SessionId;

/// Append-only log of one session's events.
///
/// Sequence numbers start at 1 and never repeat. Retention is driven by
/// both a size and an age bound; terminal `Completed` events are pinned
/// and survive eviction until the session itself is purged.
#[derive(Debug)]
pub struct SessionEventLog {
    events: Vec<SequencedEvent>,
    next_seq: u64,
}

impl Default for SessionEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_seq: 1,
        }
    }

    /// Stamp and append an event, returning the stored copy.
    pub fn append(&mut self, session_id: &SessionId, event: WorkflowEvent) -> SequencedEvent {
        let sequenced = SequencedEvent {
            session_id: session_id.clone(),
            seq: self.next_seq,
            at: Utc::now(),
            event,
        };
        self.next_seq += 1;
        self.events.push(sequenced.clone());
        sequenced
    }

    /// Highest sequence number assigned so far (0 before any event).
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Events with `seq >= from`, oldest first.
    #[must_use]
    pub fn replay_from(&self, from: u64) -> Vec<SequencedEvent> {
        self.events
            .iter()
            .filter(|e| e.seq >= from)
            .cloned()
            .collect()
    }

    /// Apply size and age bounds, keeping pinned terminal events.
    pub fn enforce_retention(&mut self, config: &EventsConfig, now: DateTime<Utc>) {
        let max_age = ChronoDuration::from_std(config.retention_time_ms)
            .unwrap_or_else(|_| ChronoDuration::days(1));
        let cutoff = now - max_age;
        self.events
            .retain(|e| e.event.is_terminal() || e.at >= cutoff);

        if self.events.len() > config.retention_size {
            let mut excess = self.events.len() - config.retention_size;
            self.events.retain(|e| {
                if excess == 0 || e.event.is_terminal() {
                    true
                } else {
                    excess -= 1;
                    false
                }
            });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::CompletionSummary;
    use crate::session::SessionPhase;
    use crate::types::StepId;

    fn progress(log: &mut SessionEventLog, id: &SessionId, n: usize) {
        for i in 0..n {
            log.append(
                id,
                WorkflowEvent::StepProgress {
                    step: StepId::new("convert"),
                    fraction: i as f64 / n as f64,
                    message: format!("tick {i}"),
                },
            );
        }
    }

    #[test]
    fn sequence_numbers_are_gapless_and_monotone() {
        let id = SessionId::new("s1");
        let mut log = SessionEventLog::new();
        progress(&mut log, &id, 5);
        let seqs: Vec<u64> = log.replay_from(0).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.latest_seq(), 5);
    }

    #[test]
    fn default_construction_numbers_from_one() {
        // The bus builds channels through `or_default`, so Default must
        // agree with `new()` on the starting sequence.
        let id = SessionId::new("s1");
        let mut log = SessionEventLog::default();
        assert_eq!(log.latest_seq(), 0);
        let first = log.append(
            &id,
            WorkflowEvent::StepStarted {
                step: StepId::new("convert"),
            },
        );
        assert_eq!(first.seq, 1);
    }

    #[test]
    fn replay_from_skips_older_events() {
        let id = SessionId::new("s1");
        let mut log = SessionEventLog::new();
        progress(&mut log, &id, 5);
        let tail = log.replay_from(4);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
    }

    #[test]
    fn size_eviction_keeps_terminal_events() {
        let id = SessionId::new("s1");
        let mut log = SessionEventLog::new();
        log.append(
            &id,
            WorkflowEvent::Completed {
                summary: CompletionSummary {
                    outcome: SessionPhase::Completed,
                    quality_score: Some(100),
                    validation_status: None,
                    error: None,
                },
            },
        );
        progress(&mut log, &id, 20);

        let config = EventsConfig {
            retention_size: 5,
            ..EventsConfig::default()
        };
        log.enforce_retention(&config, Utc::now());

        assert!(log.len() <= 6);
        let replayed = log.replay_from(0);
        assert!(replayed.iter().any(|e| e.seq == 1), "terminal event pinned");
        // Seq numbering survives eviction.
        assert_eq!(log.latest_seq(), 21);
    }
}
