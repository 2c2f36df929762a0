//! SQL-backed [`QueryExecutor`] implementations.
//!
//! Every executor reads the history tables written by the chain sync process:
//!
//! | table          | columns used                 |
//! |----------------|------------------------------|
//! | `SYNC`         | `block_num`, `irreversible`  |
//! | `RECEIPTS`     | `seq`, `block_num`, `receiver` |
//! | `TRANSACTIONS` | `seq`, `trace`               |
//! | `EVENT_LOG`    | `id`, `block_num`, `data`    |
//!
//! Features: `postgres` (default), `mysql`, `sqlite` (default; file or
//! in-memory, used for local runs and tests).
//!
//! [`QueryExecutor`]: chainstream_core::QueryExecutor

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::MySqlExecutor;
#[cfg(feature = "postgres")]
pub use postgres::{PgExecutor, PostgresOptions};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;

#[allow(dead_code)]
mod convert {
    use chainstream_core::StreamError;

    /// Map any driver error into a transient query failure.
    pub(crate) fn query_err(e: impl std::fmt::Display) -> StreamError {
        StreamError::Query(e.to_string())
    }

    /// Block numbers and ids are stored as signed 64-bit columns.
    pub(crate) fn to_db(value: u64) -> Result<i64, StreamError> {
        i64::try_from(value).map_err(|_| StreamError::Query(format!("{value} exceeds BIGINT range")))
    }

    pub(crate) fn from_db(value: i64, column: &str) -> Result<u64, StreamError> {
        u64::try_from(value).map_err(|_| StreamError::Query(format!("negative {column}: {value}")))
    }

    /// `MAX(..)` over an empty `SYNC` table yields NULL; the store is not ready yet.
    pub(crate) fn require_synced(value: Option<i64>, column: &str) -> Result<u64, StreamError> {
        match value {
            Some(v) => from_db(v, column),
            None => Err(StreamError::Query(format!("SYNC.{column} is empty"))),
        }
    }

}
