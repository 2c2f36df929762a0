//! The adaptive transaction-history streaming engine.
//!
//! # Architecture
//!
//! ```text
//! transport ──subscribe/disconnect──▶ StreamEngine
//!                                        ├── validate_subscription (argument checks)
//!                                        ├── SessionRegistry       (sessions + scanner lifecycle)
//!                                        │      └── per-session tick task ──▶ SessionTicker
//!                                        │                                      ├── trace: estimate_window → QueryExecutor
//!                                        │                                      └── fork:  ForkCache snapshot
//!                                        └── ForkScanner ──▶ ForkCache (shared, replaced per page)
//! ```
//!
//! Storage access goes through the [`QueryExecutor`] trait; outbound client
//! messages go through the [`Outbound`] trait.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fork;
pub mod format;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;
pub mod validate;
pub mod window;

pub use config::StreamConfig;
pub use engine::StreamEngine;
pub use error::{StreamError, ValidationError};
pub use executor::{MemoryExecutor, QueryExecutor};
pub use fork::{ForkCache, ForkScanner, ForkSnapshot, ScanOutcome};
pub use registry::{Session, SessionHandle, SessionRegistry, SessionUpdate};
pub use session::{SessionTicker, TickOutcome};
pub use transport::{Outbound, OutboundEvent, RecordingOutbound};
pub use types::{ConnectionId, ForkRecord, Mode, RecordKind, Subscription, TraceRecord, TransactionEntry};
pub use validate::validate_subscription;
pub use window::estimate_window;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
