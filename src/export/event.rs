//! Transfer events and the channel that carries them
//!
//! Every step of an export reports through a single [`EventSender`]. The
//! receiving end is drained by exactly one consumer: the progress
//! broadcaster in server mode, or the console tracker in CLI mode.

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

/// One meaningful step of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TransferEvent {
    /// Totals computed before the cursor is consumed
    #[serde(rename_all = "camelCase")]
    Count {
        total_records: u64,
        total_binaries: u64,
    },

    /// Counting failed or was skipped
    #[serde(rename = "no-count")]
    CountUnavailable,

    /// One record was written to the bulk upload
    #[serde(rename = "record")]
    RecordProgress { processed: u64 },

    /// Intermediate byte progress of one binary upload
    #[serde(rename = "binary-bytes")]
    BinaryBytes {
        key: String,
        loaded: u64,
        total: Option<u64>,
    },

    /// One binary object was relayed
    #[serde(rename = "binary", rename_all = "camelCase")]
    BinaryProgress {
        key: String,
        destination_key: String,
        content_type: String,
        bytes: u64,
    },

    /// One binary object could not be relayed
    BinaryFailure { key: String, reason: String },

    /// The export finished
    #[serde(rename_all = "camelCase")]
    Complete {
        records: u64,
        binaries: u64,
        failures: u64,
        elapsed_ms: u64,
    },

    /// The export was aborted
    #[serde(rename = "fatal")]
    FatalError { reason: String },
}

impl TransferEvent {
    /// Event tag used for SSE framing
    pub fn tag(&self) -> &'static str {
        match self {
            TransferEvent::Count { .. } => "count",
            TransferEvent::CountUnavailable => "no-count",
            TransferEvent::RecordProgress { .. } => "record",
            TransferEvent::BinaryBytes { .. } => "binary-bytes",
            TransferEvent::BinaryProgress { .. } => "binary",
            TransferEvent::BinaryFailure { .. } => "binary-failure",
            TransferEvent::Complete { .. } => "complete",
            TransferEvent::FatalError { .. } => "fatal",
        }
    }

    /// JSON payload without the tag
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.shift_remove("event");
                serde_json::Value::Object(map)
            }
            _ => json!({}),
        }
    }

    /// Whether this event ends the export
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Complete { .. } | TransferEvent::FatalError { .. }
        )
    }

    /// Whether this event settles one binary relay
    pub fn settles_binary(&self) -> bool {
        matches!(
            self,
            TransferEvent::BinaryProgress { .. } | TransferEvent::BinaryFailure { .. }
        )
    }
}

/// Sending half of an export's event channel
///
/// Emitting never blocks and never fails: once the consumer is gone,
/// events are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

/// Receiving half of an export's event channel
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Create a new event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Emit one event
    pub fn emit(&self, event: TransferEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event consumer gone, dropping event");
        }
    }

    /// A sender whose events go nowhere
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shapes() {
        let count = TransferEvent::Count {
            total_records: 3,
            total_binaries: 2,
        };
        assert_eq!(count.tag(), "count");
        assert_eq!(count.payload(), json!({"totalRecords": 3, "totalBinaries": 2}));

        let failure = TransferEvent::BinaryFailure {
            key: "abc".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(failure.tag(), "binary-failure");
        assert_eq!(failure.payload(), json!({"key": "abc", "reason": "not found"}));

        assert_eq!(TransferEvent::CountUnavailable.payload(), json!({}));
    }

    #[test]
    fn test_payload_keeps_field_order() {
        let relayed = TransferEvent::BinaryProgress {
            key: "k1".into(),
            destination_key: "k1.png".into(),
            content_type: "image/png".into(),
            bytes: 42,
        };
        assert_eq!(
            relayed.payload().to_string(),
            r#"{"key":"k1","destinationKey":"k1.png","contentType":"image/png","bytes":42}"#
        );

        let failure = TransferEvent::BinaryFailure {
            key: "k1".into(),
            reason: "not found".into(),
        };
        assert_eq!(
            failure.payload().to_string(),
            r#"{"key":"k1","reason":"not found"}"#
        );
    }

    #[test]
    fn test_tag_matches_serde_name() {
        let events = vec![
            TransferEvent::CountUnavailable,
            TransferEvent::RecordProgress { processed: 1 },
            TransferEvent::BinaryBytes {
                key: "k".into(),
                loaded: 1,
                total: None,
            },
            TransferEvent::FatalError { reason: "x".into() },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.tag());
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(TransferEvent::FatalError { reason: "x".into() }.is_terminal());
        assert!(!TransferEvent::RecordProgress { processed: 1 }.is_terminal());
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (tx, rx) = event_channel();
        drop(rx);
        tx.emit(TransferEvent::CountUnavailable);
        EventSender::detached().emit(TransferEvent::CountUnavailable);
    }
}
