//! Error types for the streaming engine.

use thiserror::Error;

/// Errors raised while serving a session tick or a fork scan cycle.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("query error: {0}")]
    Query(String),

    #[error("payload decode error at block {block_number}: {reason}")]
    Decode { block_number: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid subscription: {0}")]
    Validation(#[from] ValidationError),
}

impl StreamError {
    /// Returns `true` if the failing cycle can simply be retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

/// Reasons a subscription payload is rejected.
///
/// The `Display` text is what the client receives on the error event, so it
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid arguments")]
    InvalidArguments,

    #[error("Invalid accounts")]
    InvalidAccounts,

    #[error("Invalid start_block")]
    InvalidStartBlock,

    #[error("Invalid irreversible")]
    InvalidIrreversible,

    #[error("start_block is behind the last irreversible block")]
    MissingStartBlock,
}
