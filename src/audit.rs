//! Best-effort audit dispatch.
//!
//! Modeled as a bounded channel with drop-on-full and a drain worker,
//! separating a cheap non-blocking enqueue from a background consumer.
//! Never blocks the decision path: `AuditSink::record` uses `try_send`
//! and increments a counter on failure rather than waiting for channel
//! capacity.

use crate::execution::limits::DropCounter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub realm_name: String,
    pub resource_type_name: String,
    pub action_name: String,
    pub decision: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditSink {
    sender: tokio::sync::mpsc::Sender<AuditRecord>,
    dropped: DropCounter,
}

impl AuditSink {
    /// Creates a bounded channel of `capacity` records and returns the
    /// sink half plus the receiver for the caller to drain.
    pub fn new(capacity: usize) -> (AuditSink, tokio::sync::mpsc::Receiver<AuditRecord>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (
            AuditSink {
                sender,
                dropped: DropCounter::new(),
            },
            receiver,
        )
    }

    /// Enqueues `record`, or drops it and increments the counter if the
    /// channel is full. Never blocks the caller.
    pub fn record(&self, record: AuditRecord) {
        if self.sender.try_send(record).is_err() {
            self.dropped.record_drop();
            tracing::warn!(realm = %record.realm_name, dropped = self.dropped.dropped(), "audit_queue_full");
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.dropped()
    }
}

/// Drains `receiver` until the sink side is dropped, applying `handler` to
/// each record. Intended to be spawned once as a background task; a
/// cancelled or failed request never reaches here because the runner
/// skips `record` entirely when its deadline already fired, since on
/// cancellation the runner yields without emitting an audit entry.
pub async fn drain<F>(mut receiver: tokio::sync::mpsc::Receiver<AuditRecord>, mut handler: F)
where
    F: FnMut(AuditRecord),
{
    while let Some(record) = receiver.recv().await {
        handler(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_drain_round_trip() {
        let (sink, receiver) = AuditSink::new(4);
        sink.record(AuditRecord {
            realm_name: "r1".to_string(),
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            decision: "granted_all".to_string(),
            at: Utc::now(),
        });
        drop(sink);

        let mut seen = Vec::new();
        drain(receiver, |rec| seen.push(rec)).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action_name, "view");
    }

    #[test]
    fn full_channel_increments_drop_counter_not_blocks() {
        let (sink, _receiver) = AuditSink::new(1);
        let make = || AuditRecord {
            realm_name: "r1".to_string(),
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            decision: "denied_all".to_string(),
            at: Utc::now(),
        };
        sink.record(make());
        sink.record(make());
        sink.record(make());
        assert_eq!(sink.dropped_count(), 2);
    }
}
