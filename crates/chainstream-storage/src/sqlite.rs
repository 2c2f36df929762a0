//! SQLite query executor.
//!
//! Reads the same four tables as the server backends. [`SqliteExecutor::init_schema`]
//! and the `insert_*` helpers let a local file (or an in-memory database) be
//! seeded without a sync process.
//!
//! # Usage
//! ```rust,no_run
//! use chainstream_storage::sqlite::SqliteExecutor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = SqliteExecutor::in_memory().await?;
//! executor.insert_sync(120, 100).await?;
//! executor.insert_trace(1, 101, &["eosio.token"], br#"{"id":"a"}"#).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use chainstream_core::{ForkRecord, QueryExecutor, StreamError, TraceRecord};

use crate::convert::{from_db, query_err, require_synced, to_db};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS SYNC (
        block_num    INTEGER NOT NULL,
        irreversible INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS RECEIPTS (
        seq       INTEGER NOT NULL,
        block_num INTEGER NOT NULL,
        receiver  TEXT    NOT NULL,
        PRIMARY KEY (seq, receiver)
    )",
    "CREATE INDEX IF NOT EXISTS idx_receipts_receiver_block ON RECEIPTS (receiver, block_num)",
    "CREATE TABLE IF NOT EXISTS TRANSACTIONS (
        seq       INTEGER PRIMARY KEY,
        block_num INTEGER NOT NULL,
        trace     BLOB    NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS EVENT_LOG (
        id        INTEGER PRIMARY KEY,
        block_num INTEGER NOT NULL,
        data      BLOB    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_event_log_block ON EVENT_LOG (block_num)",
];

/// History reader over a SQLite pool.
#[derive(Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
}

impl SqliteExecutor {
    /// Open (or create) a database file. Accepts a plain path or a `sqlite:` URL.
    pub async fn open(path: &str) -> Result<Self, StreamError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StreamError::Query(format!("sqlite open: {e}")))?;
        Ok(Self { pool })
    }

    /// Fresh in-memory database with the schema created.
    ///
    /// Pinned to one long-lived connection: every SQLite connection to
    /// `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, StreamError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StreamError::Query(format!("sqlite open: {e}")))?;
        let executor = Self { pool };
        executor.init_schema().await?;
        Ok(executor)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the history tables if they don't exist.
    pub async fn init_schema(&self) -> Result<(), StreamError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(query_err)?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }

    /// Record sync progress.
    pub async fn insert_sync(&self, head: u64, irreversible: u64) -> Result<(), StreamError> {
        sqlx::query("INSERT INTO SYNC (block_num, irreversible) VALUES (?, ?)")
            .bind(to_db(head)?)
            .bind(to_db(irreversible)?)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Store a confirmed trace and one receipt per receiver.
    pub async fn insert_trace(
        &self,
        seq: u64,
        block_number: u64,
        receivers: &[&str],
        trace: &[u8],
    ) -> Result<(), StreamError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        sqlx::query("INSERT INTO TRANSACTIONS (seq, block_num, trace) VALUES (?, ?, ?)")
            .bind(to_db(seq)?)
            .bind(to_db(block_number)?)
            .bind(trace)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        for receiver in receivers {
            sqlx::query("INSERT OR IGNORE INTO RECEIPTS (seq, block_num, receiver) VALUES (?, ?, ?)")
                .bind(to_db(seq)?)
                .bind(to_db(block_number)?)
                .bind(*receiver)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)
    }

    /// Store a fork event log row.
    pub async fn insert_event(&self, id: u64, block_number: u64, data: &[u8]) -> Result<(), StreamError> {
        sqlx::query("INSERT INTO EVENT_LOG (id, block_num, data) VALUES (?, ?, ?)")
            .bind(to_db(id)?)
            .bind(to_db(block_number)?)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

fn push_receipt_filter<'a>(
    qb: &mut QueryBuilder<'a, Sqlite>,
    accounts: &'a [String],
    from_block: i64,
    to_block: i64,
) {
    qb.push("receiver IN (");
    let mut list = qb.separated(", ");
    for account in accounts {
        list.push_bind(account.as_str());
    }
    list.push_unseparated(") AND block_num >= ");
    qb.push_bind(from_block).push(" AND block_num < ").push_bind(to_block);
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn head_block(&self) -> Result<u64, StreamError> {
        let row = sqlx::query("SELECT MAX(block_num) AS head FROM SYNC")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        require_synced(row.try_get("head").map_err(query_err)?, "block_num")
    }

    async fn irreversible_block(&self) -> Result<u64, StreamError> {
        let row = sqlx::query("SELECT MAX(irreversible) AS irreversible FROM SYNC")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        require_synced(row.try_get("irreversible").map_err(query_err)?, "irreversible")
    }

    async fn trace_records(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TraceRecord>, StreamError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT R.block_num AS block_num, T.trace AS trace FROM (\
             SELECT DISTINCT seq, block_num FROM RECEIPTS WHERE ",
        );
        push_receipt_filter(&mut qb, accounts, to_db(from_block)?, to_db(to_block)?);
        qb.push(") AS R INNER JOIN TRANSACTIONS AS T ON R.seq = T.seq ORDER BY R.block_num DESC");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(query_err)?;
        debug!(from = from_block, to = to_block, rows = rows.len(), "trace query");
        rows.iter()
            .map(|row| {
                Ok(TraceRecord {
                    block_number: from_db(row.try_get("block_num").map_err(query_err)?, "block_num")?,
                    payload: row.try_get("trace").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn count_trace_matches(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<u64, StreamError> {
        if accounts.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT seq) AS matches FROM RECEIPTS WHERE ");
        push_receipt_filter(&mut qb, accounts, to_db(from_block)?, to_db(to_block)?);

        let row = qb.build().fetch_one(&self.pool).await.map_err(query_err)?;
        from_db(row.try_get("matches").map_err(query_err)?, "count")
    }

    async fn fork_records_by_id(
        &self,
        from_id: u64,
        to_id: u64,
    ) -> Result<Vec<ForkRecord>, StreamError> {
        let rows = sqlx::query(
            "SELECT id, block_num, data FROM EVENT_LOG
             WHERE id > ? AND id <= ?
             ORDER BY id DESC",
        )
        .bind(to_db(from_id)?)
        .bind(to_db(to_id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(ForkRecord {
                    id: from_db(row.try_get("id").map_err(query_err)?, "id")?,
                    block_number: from_db(row.try_get("block_num").map_err(query_err)?, "block_num")?,
                    payload: row.try_get("data").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn max_fork_id_at_block(&self, block_number: u64) -> Result<Option<u64>, StreamError> {
        let row = sqlx::query("SELECT MAX(id) AS id FROM EVENT_LOG WHERE block_num = ?")
            .bind(to_db(block_number)?)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        let id: Option<i64> = row.try_get("id").map_err(query_err)?;
        id.map(|id| from_db(id, "id")).transpose()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accounts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn trace(id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"id": id})).unwrap()
    }

    async fn seeded() -> SqliteExecutor {
        let exec = SqliteExecutor::in_memory().await.unwrap();
        exec.insert_sync(210, 200).await.unwrap();
        exec.insert_trace(1, 100, &["alice"], &trace("t1")).await.unwrap();
        exec.insert_trace(2, 150, &["alice", "bob"], &trace("t2")).await.unwrap();
        exec.insert_trace(3, 150, &["bob"], &trace("t3")).await.unwrap();
        exec.insert_trace(4, 199, &["carol"], &trace("t4")).await.unwrap();
        exec
    }

    #[tokio::test]
    async fn chain_positions_from_sync_table() {
        let exec = seeded().await;
        exec.insert_sync(215, 205).await.unwrap();
        assert_eq!(exec.head_block().await.unwrap(), 215);
        assert_eq!(exec.irreversible_block().await.unwrap(), 205);
    }

    #[tokio::test]
    async fn empty_sync_table_is_a_transient_error() {
        let exec = SqliteExecutor::in_memory().await.unwrap();
        let err = exec.head_block().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn trace_records_newest_first_and_distinct() {
        let exec = seeded().await;
        let records = exec.trace_records(&accounts(&["alice", "bob"]), 100, 200).await.unwrap();
        let blocks: Vec<u64> = records.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![150, 150, 100], "seq 2 touches both accounts but appears once");
    }

    #[tokio::test]
    async fn trace_range_is_half_open() {
        let exec = seeded().await;
        let records = exec.trace_records(&accounts(&["alice"]), 100, 150).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_number, 100);
        let payload: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(payload["id"], "t1");
    }

    #[tokio::test]
    async fn count_matches_counts_distinct_traces() {
        let exec = seeded().await;
        assert_eq!(exec.count_trace_matches(&accounts(&["alice", "bob"]), 0, 1_000).await.unwrap(), 3);
        assert_eq!(exec.count_trace_matches(&accounts(&["carol"]), 0, 199).await.unwrap(), 0);
        assert_eq!(exec.count_trace_matches(&accounts(&["nobody"]), 0, 1_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fork_records_by_id_window() {
        let exec = seeded().await;
        for (id, block) in [(10, 200), (11, 200), (12, 201), (13, 202)] {
            exec.insert_event(id, block, br#"{"trace":{}}"#).await.unwrap();
        }
        let ids: Vec<u64> = exec.fork_records_by_id(10, 12).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![12, 11]);

        assert_eq!(exec.max_fork_id_at_block(200).await.unwrap(), Some(11));
        assert_eq!(exec.max_fork_id_at_block(199).await.unwrap(), None);
    }
}
