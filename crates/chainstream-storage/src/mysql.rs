//! MySQL query executor.
//!
//! MySQL has no array binding, so the account list is expanded into one
//! placeholder per account with [`QueryBuilder`]. Unsigned id and block
//! columns are cast to `SIGNED` so every backend decodes the same types.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use tracing::{debug, info};

use chainstream_core::{ForkRecord, QueryExecutor, StreamError, TraceRecord};

use crate::convert::{from_db, query_err, require_synced, to_db};

/// History reader over a MySQL pool. Cheap to clone.
#[derive(Clone)]
pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StreamError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StreamError::Query(format!("mysql connect: {e}")))?;
        info!(max_connections, "MySqlExecutor connected");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// `receiver IN (?, ?, ..) AND block_num >= ? AND block_num < ?`
fn push_receipt_filter<'a>(
    qb: &mut QueryBuilder<'a, MySql>,
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
impl QueryExecutor for MySqlExecutor {
    async fn head_block(&self) -> Result<u64, StreamError> {
        let row = sqlx::query("SELECT CAST(MAX(block_num) AS SIGNED) AS head FROM SYNC")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        require_synced(row.try_get("head").map_err(query_err)?, "block_num")
    }

    async fn irreversible_block(&self) -> Result<u64, StreamError> {
        let row = sqlx::query("SELECT CAST(MAX(irreversible) AS SIGNED) AS irreversible FROM SYNC")
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
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(R.block_num AS SIGNED) AS block_num, T.trace FROM (\
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
        let mut qb = QueryBuilder::<MySql>::new("SELECT COUNT(DISTINCT seq) AS matches FROM RECEIPTS WHERE ");
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
            "SELECT CAST(id AS SIGNED) AS id, CAST(block_num AS SIGNED) AS block_num, data
             FROM EVENT_LOG
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
        let row = sqlx::query("SELECT CAST(MAX(id) AS SIGNED) AS id FROM EVENT_LOG WHERE block_num = ?")
            .bind(to_db(block_number)?)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;
        let id: Option<i64> = row.try_get("id").map_err(query_err)?;
        id.map(|id| from_db(id, "id")).transpose()
    }
}
