//! Query executor boundary.
//!
//! The engine never builds query text. It hands structured criteria (accounts,
//! block bounds, id bounds) to a [`QueryExecutor`] and receives typed rows.
//! Column mapping and SQL dialect are private to each implementation; see the
//! `chainstream-storage` crate for the Postgres and MySQL executors.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::lock;
use crate::types::{ForkRecord, TraceRecord};

/// Read access to the transaction history store.
///
/// Block ranges are half-open: `from_block <= block_number < to_block`.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Most recently synced block.
    async fn head_block(&self) -> Result<u64, StreamError>;

    /// Highest block the chain guarantees will not be reverted.
    async fn irreversible_block(&self) -> Result<u64, StreamError>;

    /// Confirmed traces touching any of `accounts` in `[from_block, to_block)`,
    /// newest block first.
    async fn trace_records(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TraceRecord>, StreamError>;

    /// Number of distinct traces touching any of `accounts` in `[from_block, to_block)`.
    async fn count_trace_matches(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<u64, StreamError>;

    /// Fork records with `from_id < id <= to_id`, highest id first.
    async fn fork_records_by_id(
        &self,
        from_id: u64,
        to_id: u64,
    ) -> Result<Vec<ForkRecord>, StreamError>;

    /// Highest fork record id at `block_number`, if any record exists there.
    async fn max_fork_id_at_block(&self, block_number: u64) -> Result<Option<u64>, StreamError>;
}

// ─── In-memory executor (for testing) ─────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredTrace {
    receivers: Vec<String>,
    record: TraceRecord,
}

#[derive(Debug, Default)]
struct MemoryChain {
    head: u64,
    irreversible: u64,
    traces: Vec<StoredTrace>,
    forks: Vec<ForkRecord>,
    failing: bool,
    latency: Duration,
    trace_queries: Vec<(u64, u64)>,
    head_calls: Vec<Instant>,
    heads_in_flight: usize,
    max_heads_in_flight: usize,
}

/// In-memory executor for tests and local development.
///
/// Can be switched into a failing state to exercise transient error handling,
/// or slowed down to exercise tick scheduling.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    chain: Mutex<MemoryChain>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the head and irreversible block numbers.
    pub fn set_chain(&self, head: u64, irreversible: u64) {
        let mut chain = lock(&self.chain);
        chain.head = head;
        chain.irreversible = irreversible;
    }

    /// Add a confirmed trace whose actions were received by `receivers`.
    pub fn push_trace(&self, block_number: u64, receivers: &[&str], payload: serde_json::Value) {
        self.push_trace_bytes(block_number, receivers, payload.to_string().into_bytes());
    }

    /// Add a confirmed trace with a raw, possibly undecodable, payload.
    pub fn push_trace_bytes(&self, block_number: u64, receivers: &[&str], payload: Vec<u8>) {
        lock(&self.chain).traces.push(StoredTrace {
            receivers: receivers.iter().map(|r| r.to_string()).collect(),
            record: TraceRecord { block_number, payload },
        });
    }

    /// Add a raw fork record.
    pub fn push_fork(&self, id: u64, block_number: u64, payload: serde_json::Value) {
        lock(&self.chain).forks.push(ForkRecord {
            id,
            block_number,
            payload: payload.to_string().into_bytes(),
        });
    }

    /// While `true`, every query returns [`StreamError::Query`].
    pub fn set_failing(&self, failing: bool) {
        lock(&self.chain).failing = failing;
    }

    /// Delay every query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.chain).latency = latency;
    }

    /// Start times of [`QueryExecutor::head_block`] calls, in call order.
    pub fn head_calls(&self) -> Vec<Instant> {
        lock(&self.chain).head_calls.clone()
    }

    /// Highest number of `head_block` calls that were in progress at once.
    pub fn max_concurrent_head_calls(&self) -> usize {
        lock(&self.chain).max_heads_in_flight
    }

    async fn delay(&self) {
        let latency = lock(&self.chain).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Ranges passed to [`QueryExecutor::trace_records`], in call order.
    pub fn trace_queries(&self) -> Vec<(u64, u64)> {
        lock(&self.chain).trace_queries.clone()
    }

    fn check(chain: &MemoryChain) -> Result<(), StreamError> {
        if chain.failing {
            return Err(StreamError::Query("memory executor is failing".into()));
        }
        Ok(())
    }

    fn matching<'a>(
        chain: &'a MemoryChain,
        accounts: &'a [String],
        from_block: u64,
        to_block: u64,
    ) -> impl Iterator<Item = &'a StoredTrace> + 'a {
        chain.traces.iter().filter(move |t| {
            (from_block..to_block).contains(&t.record.block_number)
                && t.receivers.iter().any(|r| accounts.contains(r))
        })
    }
}

/// Tracks one in-progress `head_block` call; leaving covers cancellation too.
struct HeadCall<'a> {
    chain: &'a Mutex<MemoryChain>,
}

impl<'a> HeadCall<'a> {
    fn enter(chain: &'a Mutex<MemoryChain>) -> Self {
        let mut state = lock(chain);
        state.head_calls.push(Instant::now());
        state.heads_in_flight += 1;
        state.max_heads_in_flight = state.max_heads_in_flight.max(state.heads_in_flight);
        Self { chain }
    }
}

impl Drop for HeadCall<'_> {
    fn drop(&mut self) {
        lock(self.chain).heads_in_flight -= 1;
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn head_block(&self) -> Result<u64, StreamError> {
        let _call = HeadCall::enter(&self.chain);
        self.delay().await;
        let chain = lock(&self.chain);
        Self::check(&chain)?;
        Ok(chain.head)
    }

    async fn irreversible_block(&self) -> Result<u64, StreamError> {
        self.delay().await;
        let chain = lock(&self.chain);
        Self::check(&chain)?;
        Ok(chain.irreversible)
    }

    async fn trace_records(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TraceRecord>, StreamError> {
        self.delay().await;
        let mut chain = lock(&self.chain);
        Self::check(&chain)?;
        chain.trace_queries.push((from_block, to_block));
        let mut records: Vec<TraceRecord> = Self::matching(&chain, accounts, from_block, to_block)
            .map(|t| t.record.clone())
            .collect();
        records.sort_by(|a, b| b.block_number.cmp(&a.block_number));
        Ok(records)
    }

    async fn count_trace_matches(
        &self,
        accounts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<u64, StreamError> {
        self.delay().await;
        let chain = lock(&self.chain);
        Self::check(&chain)?;
        Ok(Self::matching(&chain, accounts, from_block, to_block).count() as u64)
    }

    async fn fork_records_by_id(
        &self,
        from_id: u64,
        to_id: u64,
    ) -> Result<Vec<ForkRecord>, StreamError> {
        self.delay().await;
        let chain = lock(&self.chain);
        Self::check(&chain)?;
        let mut records: Vec<ForkRecord> = chain
            .forks
            .iter()
            .filter(|f| f.id > from_id && f.id <= to_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    async fn max_fork_id_at_block(&self, block_number: u64) -> Result<Option<u64>, StreamError> {
        self.delay().await;
        let chain = lock(&self.chain);
        Self::check(&chain)?;
        Ok(chain
            .forks
            .iter()
            .filter(|f| f.block_number == block_number)
            .map(|f| f.id)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accounts(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn trace_range_is_half_open() {
        let exec = MemoryExecutor::new();
        exec.push_trace(100, &["alice"], json!({}));
        exec.push_trace(109, &["alice"], json!({}));
        exec.push_trace(110, &["alice"], json!({}));

        let records = exec.trace_records(&accounts(&["alice"]), 100, 110).await.unwrap();
        let blocks: Vec<u64> = records.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![109, 100]); // newest first, 110 excluded
        assert_eq!(exec.count_trace_matches(&accounts(&["alice"]), 100, 110).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn traces_filtered_by_receiver() {
        let exec = MemoryExecutor::new();
        exec.push_trace(5, &["alice"], json!({}));
        exec.push_trace(6, &["bob"], json!({}));
        let count = exec.count_trace_matches(&accounts(&["bob"]), 0, 10).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn fork_page_bounds_and_order() {
        let exec = MemoryExecutor::new();
        for id in 1..=5 {
            exec.push_fork(id, 100 + id, json!({}));
        }
        let page = exec.fork_records_by_id(2, 4).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[tokio::test]
    async fn max_fork_id_at_block() {
        let exec = MemoryExecutor::new();
        exec.push_fork(10, 500, json!({}));
        exec.push_fork(11, 500, json!({}));
        exec.push_fork(12, 501, json!({}));
        assert_eq!(exec.max_fork_id_at_block(500).await.unwrap(), Some(11));
        assert_eq!(exec.max_fork_id_at_block(499).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_executor_returns_query_errors() {
        let exec = MemoryExecutor::new();
        exec.set_failing(true);
        assert!(exec.head_block().await.unwrap_err().is_transient());
        exec.set_failing(false);
        assert!(exec.head_block().await.is_ok());
    }
}
