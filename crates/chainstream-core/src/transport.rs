//! Outbound side of the client transport.

use std::sync::Mutex;

use crate::lock;
use crate::types::{ConnectionId, TransactionEntry};

/// Primitives the engine uses to talk back to clients.
///
/// Implementations must not block: they are called from tick tasks.
pub trait Outbound: Send + Sync {
    /// Deliver a `transactions_history` batch.
    fn emit_data(&self, connection: &ConnectionId, entries: Vec<TransactionEntry>);

    /// Deliver an error event with a stable, human-readable reason.
    fn emit_error(&self, connection: &ConnectionId, reason: &str);

    /// Close the connection from the server side.
    fn disconnect(&self, connection: &ConnectionId);
}

// ─── Recording outbound (for testing) ─────────────────────────────────────────

/// Something the engine sent to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Data { connection: ConnectionId, entries: Vec<TransactionEntry> },
    Error { connection: ConnectionId, reason: String },
    Disconnect { connection: ConnectionId },
}

/// Outbound that records every call, for tests.
#[derive(Debug, Default)]
pub struct RecordingOutbound {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        lock(&self.events).clone()
    }

    /// Data batches delivered to `connection`, in order.
    pub fn data_for(&self, connection: &ConnectionId) -> Vec<Vec<TransactionEntry>> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::Data { connection: c, entries } if c == connection => {
                    Some(entries.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl Outbound for RecordingOutbound {
    fn emit_data(&self, connection: &ConnectionId, entries: Vec<TransactionEntry>) {
        lock(&self.events).push(OutboundEvent::Data { connection: connection.clone(), entries });
    }

    fn emit_error(&self, connection: &ConnectionId, reason: &str) {
        lock(&self.events).push(OutboundEvent::Error {
            connection: connection.clone(),
            reason: reason.to_string(),
        });
    }

    fn disconnect(&self, connection: &ConnectionId) {
        lock(&self.events).push(OutboundEvent::Disconnect { connection: connection.clone() });
    }
}
