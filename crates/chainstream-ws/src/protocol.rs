//! Frame format: every text frame is `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainstream_core::TransactionEntry;

/// Client request carrying a subscription; server batches use the same name.
pub const TRANSACTIONS_HISTORY: &str = "transactions_history";
/// Server-sent validation failure.
pub const ERROR: &str = "error";

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct Frame<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Subscription arguments, still unvalidated.
    Subscribe(Value),
    /// Any other event name.
    Ignored(String),
}

/// Decode a client text frame.
///
/// A frame that is not a JSON envelope becomes a subscription with a `null`
/// payload, which the engine rejects as invalid arguments.
pub fn parse_inbound(text: &str) -> Inbound {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) if envelope.event == TRANSACTIONS_HISTORY => Inbound::Subscribe(envelope.data),
        Ok(envelope) => Inbound::Ignored(envelope.event),
        Err(_) => Inbound::Subscribe(Value::Null),
    }
}

pub fn encode_batch(entries: &[TransactionEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Frame { event: TRANSACTIONS_HISTORY, data: entries })
}

pub fn encode_error(reason: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Frame { event: ERROR, data: reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::RecordKind;
    use serde_json::json;

    #[test]
    fn subscription_frame() {
        let text = r#"{"event":"transactions_history","data":{"accounts":["alice"],"start_block":5}}"#;
        assert_eq!(
            parse_inbound(text),
            Inbound::Subscribe(json!({"accounts": ["alice"], "start_block": 5}))
        );
    }

    #[test]
    fn missing_data_is_null() {
        assert_eq!(
            parse_inbound(r#"{"event":"transactions_history"}"#),
            Inbound::Subscribe(Value::Null)
        );
    }

    #[test]
    fn garbage_becomes_invalid_subscription() {
        assert_eq!(parse_inbound("not json"), Inbound::Subscribe(Value::Null));
        assert_eq!(parse_inbound(r#"{"data":{}}"#), Inbound::Subscribe(Value::Null));
    }

    #[test]
    fn other_events_ignored() {
        assert_eq!(parse_inbound(r#"{"event":"ping","data":1}"#), Inbound::Ignored("ping".into()));
    }

    #[test]
    fn batch_frame_shape() {
        let entries = vec![TransactionEntry {
            block_number: 42,
            kind: RecordKind::Fork,
            data: json!({"trace": {}}),
            id: Some(7),
        }];
        let frame: Value = serde_json::from_str(&encode_batch(&entries).unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"event": "transactions_history",
                   "data": [{"blockNumber": 42, "type": "fork", "data": {"trace": {}}, "id": 7}]})
        );
    }

    #[test]
    fn error_frame_shape() {
        let frame: Value = serde_json::from_str(&encode_error("Invalid accounts").unwrap()).unwrap();
        assert_eq!(frame, json!({"event": "error", "data": "Invalid accounts"}));
    }
}
