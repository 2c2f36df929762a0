//! Per-connection outgoing queues.
//!
//! The engine calls [`Outbound`] from tick tasks, which must not block on a
//! socket. Each connection owns a bounded queue; its connection task is the
//! only writer to the socket. A peer whose queue is full is dropped, which
//! makes its connection task flush what is queued and close.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use chainstream_core::{ConnectionId, Outbound, TransactionEntry};

use crate::protocol::{encode_batch, encode_error};

/// Something queued for a connection task to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    /// Send a close frame and end the connection.
    Close,
}

/// Frames a connection may have queued before it is treated as stalled.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// [`Outbound`] implementation over per-connection channels.
#[derive(Debug)]
pub struct WsOutbound {
    peers: Mutex<HashMap<ConnectionId, mpsc::Sender<Outgoing>>>,
    capacity: usize,
}

impl Default for WsOutbound {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl WsOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues hold at most `capacity` frames (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self { peers: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<Outgoing>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a queue for `connection`, replacing any previous one.
    pub fn register(&self, connection: ConnectionId) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers().insert(connection, tx);
        rx
    }

    pub fn unregister(&self, connection: &ConnectionId) {
        self.peers().remove(connection);
    }

    pub fn connection_count(&self) -> usize {
        self.peers().len()
    }

    /// Ask every connection task to close.
    pub fn close_all(&self) {
        self.peers().retain(|connection, tx| match tx.try_send(Outgoing::Close) {
            Err(TrySendError::Full(_)) => {
                debug!(connection = %connection, "queue full, dropping peer on shutdown");
                false
            }
            _ => true,
        });
    }

    fn send(&self, connection: &ConnectionId, message: Outgoing) {
        let mut peers = self.peers();
        let Some(tx) = peers.get(connection) else {
            debug!(connection = %connection, "no such connection, dropping frame");
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection = %connection,
                    capacity = self.capacity,
                    "outgoing queue full, disconnecting slow client"
                );
                peers.remove(connection);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %connection, "connection task gone, dropping frame");
            }
        }
    }
}

impl Outbound for WsOutbound {
    fn emit_data(&self, connection: &ConnectionId, entries: Vec<TransactionEntry>) {
        match encode_batch(&entries) {
            Ok(text) => self.send(connection, Outgoing::Text(text)),
            Err(e) => warn!(connection = %connection, error = %e, "failed to encode batch"),
        }
    }

    fn emit_error(&self, connection: &ConnectionId, reason: &str) {
        match encode_error(reason) {
            Ok(text) => self.send(connection, Outgoing::Text(text)),
            Err(e) => warn!(connection = %connection, error = %e, "failed to encode error"),
        }
    }

    fn disconnect(&self, connection: &ConnectionId) {
        self.send(connection, Outgoing::Close);
    }
}
