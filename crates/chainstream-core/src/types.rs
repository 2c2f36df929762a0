//! Shared types for the streaming engine.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── ConnectionId ─────────────────────────────────────────────────────────────

/// Opaque identifier of a live client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Mode ─────────────────────────────────────────────────────────────────────

/// Retrieval strategy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Read the immutable, already-confirmed transaction source.
    Trace,
    /// Read the shared cache of recent, potentially-reversible transactions.
    Fork,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Fork => write!(f, "fork"),
        }
    }
}

// ─── Subscription ─────────────────────────────────────────────────────────────

/// A validated subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Accounts whose transactions are streamed (non-empty, no duplicates).
    pub accounts: Vec<String>,
    /// Block to start streaming from; `None` = follow the head.
    pub start_block: Option<u64>,
    /// Only stream data at or below the irreversible block.
    pub irreversible: bool,
}

impl Subscription {
    pub fn new(accounts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            accounts: accounts.into_iter().map(Into::into).collect(),
            start_block: None,
            irreversible: false,
        }
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    pub fn irreversible_only(mut self) -> Self {
        self.irreversible = true;
        self
    }

    /// Returns `true` if `account` is one of the subscribed accounts.
    pub fn watches(&self, account: &str) -> bool {
        self.accounts.iter().any(|a| a == account)
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

/// A confirmed transaction trace from the append-only source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub block_number: u64,
    /// Raw JSON trace bytes as stored.
    pub payload: Vec<u8>,
}

/// A potentially-reversible record from the fork source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkRecord {
    /// Monotonic record id assigned by the store.
    pub id: u64,
    pub block_number: u64,
    /// Raw JSON trace bytes as stored.
    pub payload: Vec<u8>,
}

// ─── TransactionEntry ─────────────────────────────────────────────────────────

/// Where an emitted entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Trace,
    Fork,
}

/// One element of a `transactions_history` emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub block_number: u64,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// Decoded trace payload.
    pub data: serde_json::Value,
    /// Fork record id; absent for trace entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wire_shape() {
        let entry = TransactionEntry {
            block_number: 42,
            kind: RecordKind::Fork,
            data: serde_json::json!({"trace": {}}),
            id: Some(7),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["blockNumber"], 42);
        assert_eq!(json["type"], "fork");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn trace_entry_omits_id() {
        let entry = TransactionEntry {
            block_number: 1,
            kind: RecordKind::Trace,
            data: serde_json::Value::Null,
            id: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["type"], "trace");
    }

    #[test]
    fn subscription_builder() {
        let sub = Subscription::new(["eosio"]).from_block(10).irreversible_only();
        assert_eq!(sub.start_block, Some(10));
        assert!(sub.irreversible);
        assert!(sub.watches("eosio"));
        assert!(!sub.watches("eosio.token"));
    }
}
