//! WebSocket transport for [`chainstream_core::StreamEngine`].
//!
//! Each accepted socket gets a UUID connection id and a dedicated task that
//! forwards inbound `transactions_history` requests to the engine and drains
//! the connection's outgoing queue filled by [`WsOutbound`].

pub mod outbound;
pub mod protocol;
pub mod server;

pub use outbound::{Outgoing, WsOutbound, DEFAULT_QUEUE_CAPACITY};
pub use protocol::{parse_inbound, Inbound};
pub use server::{ServerError, WsServer};
