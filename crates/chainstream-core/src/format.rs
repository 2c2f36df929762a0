//! Decoding stored records into client-facing entries.

use serde_json::Value;
use tracing::warn;

use crate::error::StreamError;
use crate::types::{ForkRecord, RecordKind, Subscription, TraceRecord, TransactionEntry};

fn decode(block_number: u64, payload: &[u8]) -> Result<Value, StreamError> {
    serde_json::from_slice(payload).map_err(|e| StreamError::Decode {
        block_number,
        reason: e.to_string(),
    })
}

/// Decode trace records as-is; the store already filtered them by account.
/// Rows that do not decode are logged and skipped.
pub fn format_traces(records: &[TraceRecord]) -> Vec<TransactionEntry> {
    records
        .iter()
        .filter_map(|r| match decode(r.block_number, &r.payload) {
            Ok(data) => Some(TransactionEntry {
                block_number: r.block_number,
                kind: RecordKind::Trace,
                data,
                id: None,
            }),
            Err(e) => {
                warn!(block_number = r.block_number, error = %e, "skipping undecodable trace");
                None
            }
        })
        .collect()
}

/// Decode fork records and keep only those referencing an account `subscription`
/// watches. Rows that do not decode are logged and skipped.
pub fn format_forks(records: &[ForkRecord], subscription: &Subscription) -> Vec<TransactionEntry> {
    let mut entries = Vec::new();
    for record in records {
        let data = match decode(record.block_number, &record.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    id = record.id,
                    block_number = record.block_number,
                    error = %e,
                    "skipping undecodable fork record"
                );
                continue;
            }
        };
        if references_any(&data, subscription) {
            entries.push(TransactionEntry {
                block_number: record.block_number,
                kind: RecordKind::Fork,
                data,
                id: Some(record.id),
            });
        }
    }
    entries
}

/// Returns `true` if any action in `data.trace.action_traces` was received by
/// an account `subscription` watches.
pub fn references_any(data: &Value, subscription: &Subscription) -> bool {
    data.pointer("/trace/action_traces")
        .and_then(Value::as_array)
        .map(|actions| {
            actions.iter().any(|action| {
                action
                    .get("receiver")
                    .and_then(Value::as_str)
                    .is_some_and(|receiver| subscription.watches(receiver))
            })
        })
        .unwrap_or(false)
}
