//! Shared fork cache and its background scanner.
//!
//! One scanner feeds every fork-mode session. Each cycle pulls the next page
//! of fork records past the cache cursor and, when the page is non-empty,
//! swaps in a whole new snapshot. Readers hold an `Arc` to whichever snapshot
//! was current when they looked, so they never see a half-written page.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::executor::QueryExecutor;
use crate::types::ForkRecord;

// ─── ForkCache ────────────────────────────────────────────────────────────────

/// An immutable view of the fork cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkSnapshot {
    /// Latest scanned page, highest id first.
    pub records: Vec<ForkRecord>,
    /// Highest record id observed; `None` until the first non-empty page.
    pub cursor: Option<u64>,
    /// Bumped on every reset so that scans started before a reset are discarded.
    pub generation: u64,
}

/// Process-wide cache of recently scanned fork records.
pub struct ForkCache {
    tx: watch::Sender<Arc<ForkSnapshot>>,
}

impl Default for ForkCache {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ForkSnapshot::default()));
        Self { tx }
    }
}

impl ForkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current complete snapshot.
    pub fn snapshot(&self) -> Arc<ForkSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn cursor(&self) -> Option<u64> {
        self.tx.borrow().cursor
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Replace the record set with `records` and advance the cursor to the
    /// highest id among them.
    ///
    /// No-op (returns `false`) when `records` is empty or when the cache was
    /// reset after `generation` was read. The cursor never moves backwards.
    pub fn replace(&self, generation: u64, records: Vec<ForkRecord>) -> bool {
        let Some(batch_max) = records.iter().map(|r| r.id).max() else {
            return false;
        };
        self.tx.send_if_modified(|current| {
            if current.generation != generation {
                return false;
            }
            let cursor = current.cursor.map_or(batch_max, |c| c.max(batch_max));
            *current = Arc::new(ForkSnapshot { records, cursor: Some(cursor), generation });
            true
        })
    }

    /// Clear records and cursor.
    pub fn reset(&self) {
        self.tx.send_modify(|current| {
            *current = Arc::new(ForkSnapshot {
                records: Vec::new(),
                cursor: None,
                generation: current.generation + 1,
            });
        });
    }
}

// ─── ForkScanner ──────────────────────────────────────────────────────────────

/// Result of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No cursor yet and no fork record at the irreversible block to seed from.
    Unseeded,
    /// The page past `cursor` was empty; cache untouched.
    Empty { cursor: u64 },
    /// A new page of `records` was stored; the cursor is now `cursor`.
    Updated { records: usize, cursor: u64 },
}

/// Background scanner that keeps a [`ForkCache`] fresh.
pub struct ForkScanner {
    executor: Arc<dyn QueryExecutor>,
    cache: Arc<ForkCache>,
    page_size: u64,
    interval: Duration,
}

impl ForkScanner {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        cache: Arc<ForkCache>,
        page_size: u64,
        interval: Duration,
    ) -> Self {
        Self { executor, cache, page_size, interval }
    }

    pub fn cache(&self) -> &Arc<ForkCache> {
        &self.cache
    }

    /// Run a single scan cycle.
    pub async fn scan_once(&self) -> Result<ScanOutcome, StreamError> {
        let generation = self.cache.generation();

        let from_id = match self.cache.cursor() {
            Some(cursor) => cursor,
            None => {
                let irreversible = self.executor.irreversible_block().await?;
                match self.executor.max_fork_id_at_block(irreversible).await? {
                    Some(id) => id,
                    None => {
                        debug!(irreversible, "no fork record at irreversible block yet");
                        return Ok(ScanOutcome::Unseeded);
                    }
                }
            }
        };
        let to_id = from_id.saturating_add(self.page_size);

        let records = self.executor.fork_records_by_id(from_id, to_id).await?;
        let count = records.len();
        if !self.cache.replace(generation, records) {
            return Ok(ScanOutcome::Empty { cursor: self.cache.cursor().unwrap_or(from_id) });
        }

        let cursor = self.cache.cursor().unwrap_or(from_id);
        debug!(from_id, to_id, records = count, cursor, "fork cache updated");
        Ok(ScanOutcome::Updated { records: count, cursor })
    }

    /// Spawn the periodic scan loop. Stop it by aborting the returned handle.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + scanner.interval, scanner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = scanner.scan_once().await {
                    warn!(error = %e, "fork scan cycle failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use serde_json::json;

    fn scanner(exec: &Arc<MemoryExecutor>, page_size: u64) -> ForkScanner {
        ForkScanner::new(
            exec.clone(),
            Arc::new(ForkCache::new()),
            page_size,
            Duration::from_millis(500),
        )
    }

    fn record(id: u64) -> ForkRecord {
        ForkRecord { id, block_number: id, payload: b"{}".to_vec() }
    }

    #[test]
    fn replace_advances_cursor_to_batch_max() {
        let cache = ForkCache::new();
        assert!(cache.replace(0, vec![record(12), record(11)]));
        assert_eq!(cache.cursor(), Some(12));
        assert_eq!(cache.snapshot().records.len(), 2);
    }

    #[test]
    fn empty_replace_keeps_previous_snapshot() {
        let cache = ForkCache::new();
        cache.replace(0, vec![record(5)]);
        let before = cache.snapshot();
        assert!(!cache.replace(0, Vec::new()));
        assert_eq!(*cache.snapshot(), *before);
    }

    #[test]
    fn cursor_never_regresses() {
        let cache = ForkCache::new();
        cache.replace(0, vec![record(20)]);
        cache.replace(0, vec![record(3)]);
        assert_eq!(cache.cursor(), Some(20));
    }

    #[test]
    fn stale_generation_is_discarded() {
        let cache = ForkCache::new();
        let generation = cache.generation();
        cache.reset();
        assert!(!cache.replace(generation, vec![record(1)]));
        assert_eq!(cache.cursor(), None);
    }

    #[test]
    fn snapshot_held_by_reader_survives_replace() {
        let cache = ForkCache::new();
        cache.replace(0, vec![record(1)]);
        let held = cache.snapshot();
        cache.replace(0, vec![record(2), record(3)]);
        assert_eq!(held.records.len(), 1);
        assert_eq!(cache.snapshot().records.len(), 2);
    }

    #[tokio::test]
    async fn first_scan_seeds_from_irreversible_block() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(510, 500);
        exec.push_fork(40, 500, json!({}));
        exec.push_fork(41, 501, json!({}));
        exec.push_fork(42, 502, json!({}));

        let scanner = scanner(&exec, 100);
        let outcome = scanner.scan_once().await.unwrap();
        assert_eq!(outcome, ScanOutcome::Updated { records: 2, cursor: 42 });

        let snap = scanner.cache().snapshot();
        let ids: Vec<u64> = snap.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![42, 41]);
    }

    #[tokio::test]
    async fn unseeded_when_irreversible_block_has_no_records() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(510, 500);
        exec.push_fork(41, 501, json!({}));

        let scanner = scanner(&exec, 100);
        assert_eq!(scanner.scan_once().await.unwrap(), ScanOutcome::Unseeded);
        assert_eq!(scanner.cache().cursor(), None);
    }

    #[tokio::test]
    async fn page_size_bounds_each_cycle() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(600, 500);
        exec.push_fork(10, 500, json!({}));
        for id in 11..=20 {
            exec.push_fork(id, 500 + id, json!({}));
        }

        let scanner = scanner(&exec, 4);
        assert_eq!(
            scanner.scan_once().await.unwrap(),
            ScanOutcome::Updated { records: 4, cursor: 14 }
        );
        assert_eq!(
            scanner.scan_once().await.unwrap(),
            ScanOutcome::Updated { records: 4, cursor: 18 }
        );
        // Page replaced, not accumulated.
        assert_eq!(scanner.cache().snapshot().records.len(), 4);
    }

    #[tokio::test]
    async fn empty_cycle_leaves_cache_unchanged() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(600, 500);
        exec.push_fork(10, 500, json!({}));
        exec.push_fork(11, 501, json!({}));

        let scanner = scanner(&exec, 100);
        scanner.scan_once().await.unwrap();
        let before = scanner.cache().snapshot();

        assert_eq!(scanner.scan_once().await.unwrap(), ScanOutcome::Empty { cursor: 11 });
        assert_eq!(*scanner.cache().snapshot(), *before);
    }

    #[tokio::test]
    async fn failed_cycle_leaves_cache_unchanged() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(600, 500);
        exec.push_fork(10, 500, json!({}));
        exec.push_fork(11, 501, json!({}));

        let scanner = scanner(&exec, 100);
        scanner.scan_once().await.unwrap();
        let before = scanner.cache().snapshot();

        exec.push_fork(12, 502, json!({}));
        exec.set_failing(true);
        assert!(scanner.scan_once().await.is_err());
        assert_eq!(*scanner.cache().snapshot(), *before);

        exec.set_failing(false);
        assert_eq!(
            scanner.scan_once().await.unwrap(),
            ScanOutcome::Updated { records: 1, cursor: 12 }
        );
    }
}
