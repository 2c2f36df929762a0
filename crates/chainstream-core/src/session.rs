//! Per-session tick logic: mode switching and trace/fork retrieval.
//!
//! # Modes
//!
//! ```text
//!            start_block behind irreversible, or irreversible-only
//!   Fork ───────────────────────────────────────────────────────▶ Trace
//!        ◀───────────────────────────────────────────────────────
//!            caught up to irreversible (or following head),
//!            and not irreversible-only
//! ```
//!
//! A tick that switches mode emits nothing; retrieval under the new mode
//! starts on the next tick.

use std::sync::Arc;

use tracing::debug;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::executor::QueryExecutor;
use crate::fork::ForkCache;
use crate::format::{format_forks, format_traces};
use crate::registry::{Session, SessionHandle};
use crate::types::{Mode, TransactionEntry};
use crate::window::estimate_window;

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The session changed mode; nothing was emitted.
    Switched { from: Mode, to: Mode },
    /// Entries to deliver to the client (possibly empty).
    Emit(Vec<TransactionEntry>),
    /// Nothing to query this tick (empty window or horizon reached).
    Idle,
}

/// Chain position and session-derived start used by the switch rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    pub head_block: u64,
    pub irreversible_block: u64,
    /// `max(start_block.unwrap_or(head_block), last_seen_block)`.
    pub effective_start: u64,
}

impl TickContext {
    pub fn new(session: &Session, head_block: u64, irreversible_block: u64) -> Self {
        let requested = session.subscription.start_block.unwrap_or(head_block);
        Self {
            head_block,
            irreversible_block,
            effective_start: requested.max(session.last_seen_block),
        }
    }
}

/// The session must read confirmed history.
pub fn should_switch_to_trace(session: &Session, ctx: &TickContext) -> bool {
    let sub = &session.subscription;
    let behind_horizon = sub.start_block.is_some() && ctx.effective_start < ctx.irreversible_block;
    (behind_horizon || sub.irreversible) && session.mode != Mode::Trace
}

/// The session can follow the reorg-aware fork cache.
pub fn should_switch_to_fork(session: &Session, ctx: &TickContext) -> bool {
    let sub = &session.subscription;
    let caught_up =
        session.last_seen_block >= ctx.irreversible_block || sub.start_block.is_none();
    caught_up && !sub.irreversible && session.mode != Mode::Fork
}

/// Mode the session should move to this tick, if any. Trace wins ties.
pub fn next_mode(session: &Session, ctx: &TickContext) -> Option<Mode> {
    if should_switch_to_trace(session, ctx) {
        Some(Mode::Trace)
    } else if should_switch_to_fork(session, ctx) {
        Some(Mode::Fork)
    } else {
        None
    }
}

/// Block range `[from, to)` a trace tick will query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceWindow {
    pub from: u64,
    pub to: u64,
    /// Matches counted in the probe window.
    pub probe_matches: u64,
}

/// Runs ticks for any session against the shared executor and fork cache.
pub struct SessionTicker {
    executor: Arc<dyn QueryExecutor>,
    cache: Arc<ForkCache>,
    probe_window: u64,
    match_target: u64,
}

impl SessionTicker {
    pub fn new(executor: Arc<dyn QueryExecutor>, cache: Arc<ForkCache>, config: &StreamConfig) -> Self {
        Self {
            executor,
            cache,
            probe_window: config.probe_window_blocks,
            match_target: config.match_target,
        }
    }

    /// Run one tick for `handle`.
    ///
    /// On error the session state is left exactly as it was.
    pub async fn tick(&self, handle: &SessionHandle) -> Result<TickOutcome, StreamError> {
        let session = handle.snapshot();
        let head_block = self.executor.head_block().await?;
        let irreversible_block = self.executor.irreversible_block().await?;
        let ctx = TickContext::new(&session, head_block, irreversible_block);

        if let Some(to) = next_mode(&session, &ctx) {
            handle.set_mode(to);
            debug!(
                connection = %handle.id(),
                from = %session.mode,
                to = %to,
                effective_start = ctx.effective_start,
                irreversible = irreversible_block,
                "session switched mode"
            );
            return Ok(TickOutcome::Switched { from: session.mode, to });
        }

        match session.mode {
            Mode::Trace => self.trace_tick(handle, &session, &ctx).await,
            Mode::Fork => Ok(self.fork_tick(&session)),
        }
    }

    /// Size the next trace window, or `None` when there is nothing to query.
    pub async fn trace_window(
        &self,
        session: &Session,
        ctx: &TickContext,
    ) -> Result<Option<TraceWindow>, StreamError> {
        let from = ctx.effective_start;
        if from == ctx.irreversible_block {
            return Ok(None);
        }

        let accounts = &session.subscription.accounts;
        let probe_end = from.saturating_add(self.probe_window);
        let probe_matches = self.executor.count_trace_matches(accounts, from, probe_end).await?;
        let window = estimate_window(probe_matches, self.match_target, self.probe_window);

        let mut to = from.saturating_add(window);
        if session.subscription.irreversible {
            to = to.min(ctx.irreversible_block);
        }
        if to <= from {
            debug!(
                connection = %session.connection_id,
                from,
                to,
                probe_matches,
                irreversible = ctx.irreversible_block,
                "empty trace window, skipping"
            );
            return Ok(None);
        }
        Ok(Some(TraceWindow { from, to, probe_matches }))
    }

    async fn trace_tick(
        &self,
        handle: &SessionHandle,
        session: &Session,
        ctx: &TickContext,
    ) -> Result<TickOutcome, StreamError> {
        let Some(window) = self.trace_window(session, ctx).await? else {
            return Ok(TickOutcome::Idle);
        };

        let records = self
            .executor
            .trace_records(&session.subscription.accounts, window.from, window.to)
            .await?;
        let last_seen = match records.iter().map(|r| r.block_number).max() {
            Some(highest) => handle.advance_last_seen(highest),
            None => session.last_seen_block,
        };
        let entries = format_traces(&records);
        debug!(
            connection = %handle.id(),
            from = window.from,
            to = window.to,
            probe_matches = window.probe_matches,
            records = entries.len(),
            last_seen,
            "trace tick"
        );
        Ok(TickOutcome::Emit(entries))
    }

    fn fork_tick(&self, session: &Session) -> TickOutcome {
        let snapshot = self.cache.snapshot();
        let entries = format_forks(&snapshot.records, &session.subscription);
        debug!(
            connection = %session.connection_id,
            cached = snapshot.records.len(),
            records = entries.len(),
            "fork tick"
        );
        TickOutcome::Emit(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use crate::types::{ConnectionId, Subscription};
    use serde_json::json;

    fn session(mode: Mode, last_seen: u64, sub: Subscription) -> Session {
        Session {
            connection_id: ConnectionId::from("c"),
            mode,
            last_seen_block: last_seen,
            subscription: sub,
        }
    }

    #[test]
    fn effective_start_prefers_progress() {
        let s = session(Mode::Trace, 250, Subscription::new(["a"]).from_block(100));
        assert_eq!(TickContext::new(&s, 900, 500).effective_start, 250);

        let s = session(Mode::Fork, 0, Subscription::new(["a"]));
        assert_eq!(TickContext::new(&s, 900, 500).effective_start, 900);
    }

    #[test]
    fn switch_rules_are_mutually_exclusive() {
        let subs = [
            Subscription::new(["a"]),
            Subscription::new(["a"]).from_block(0),
            Subscription::new(["a"]).from_block(5),
            Subscription::new(["a"]).from_block(12),
            Subscription::new(["a"]).from_block(5).irreversible_only(),
            Subscription::new(["a"]).from_block(12).irreversible_only(),
        ];
        for sub in &subs {
            for mode in [Mode::Trace, Mode::Fork] {
                for last_seen in [0, 5, 9, 10, 11, 20] {
                    for irreversible in [0, 5, 10, 15] {
                        for head in [irreversible, irreversible + 3] {
                            let s = session(mode, last_seen, sub.clone());
                            let ctx = TickContext::new(&s, head, irreversible);
                            assert!(
                                !(should_switch_to_trace(&s, &ctx) && should_switch_to_fork(&s, &ctx)),
                                "both rules fired for {s:?} {ctx:?}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn no_tick_stays_put_while_other_mode_is_due() {
        // Fork session behind the horizon must move to trace.
        let s = session(Mode::Fork, 0, Subscription::new(["a"]).from_block(100));
        assert_eq!(next_mode(&s, &TickContext::new(&s, 500, 500)), Some(Mode::Trace));

        // Trace session caught up must move back to fork.
        let s = session(Mode::Trace, 500, Subscription::new(["a"]).from_block(100));
        assert_eq!(next_mode(&s, &TickContext::new(&s, 520, 500)), Some(Mode::Fork));

        // Irreversible-only sessions never leave trace.
        let s = session(Mode::Trace, 500, Subscription::new(["a"]).from_block(100).irreversible_only());
        assert_eq!(next_mode(&s, &TickContext::new(&s, 520, 500)), None);
    }

    fn ticker(exec: &Arc<MemoryExecutor>, cache: &Arc<ForkCache>) -> SessionTicker {
        SessionTicker::new(exec.clone(), cache.clone(), &StreamConfig::default())
    }

    fn action(receiver: &str) -> serde_json::Value {
        json!({"trace": {"action_traces": [{"receiver": receiver}]}})
    }

    #[tokio::test]
    async fn dense_probe_narrows_trace_window() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(1_000, 900);
        for i in 0..400 {
            exec.push_trace(100 + i / 4, &["acct1"], action("acct1"));
        }
        let cache = Arc::new(ForkCache::new());
        let t = ticker(&exec, &cache);

        let s = session(Mode::Trace, 0, Subscription::new(["acct1"]).from_block(100));
        let ctx = TickContext::new(&s, 1_000, 900);
        let window = t.trace_window(&s, &ctx).await.unwrap().unwrap();
        assert_eq!(window.probe_matches, 400);
        assert_eq!((window.from, window.to), (100, 125));
    }

    #[tokio::test]
    async fn irreversible_only_window_is_clamped() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(200, 150);
        let cache = Arc::new(ForkCache::new());
        let t = ticker(&exec, &cache);

        let s = session(Mode::Trace, 0, Subscription::new(["a"]).from_block(100).irreversible_only());
        let window = t.trace_window(&s, &TickContext::new(&s, 200, 150)).await.unwrap().unwrap();
        assert_eq!((window.from, window.to), (100, 150));

        let s = session(Mode::Trace, 150, Subscription::new(["a"]).from_block(100).irreversible_only());
        assert_eq!(t.trace_window(&s, &TickContext::new(&s, 200, 150)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn trace_tick_advances_last_seen_to_highest_block() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(1_000, 900);
        exec.push_trace(130, &["acct1"], action("acct1"));
        exec.push_trace(110, &["acct1"], action("acct1"));
        exec.push_trace(120, &["other"], action("other"));
        let cache = Arc::new(ForkCache::new());
        let t = ticker(&exec, &cache);

        let registry_less = SessionHandleFixture::new(Subscription::new(["acct1"]).from_block(100));
        registry_less.handle.set_mode(Mode::Trace);
        match t.tick(&registry_less.handle).await.unwrap() {
            TickOutcome::Emit(entries) => {
                let blocks: Vec<u64> = entries.iter().map(|e| e.block_number).collect();
                assert_eq!(blocks, vec![130, 110]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(registry_less.handle.snapshot().last_seen_block, 130);
        assert_eq!(exec.trace_queries(), vec![(100, 200)]);
    }

    #[tokio::test]
    async fn failed_tick_leaves_session_untouched() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(1_000, 900);
        let cache = Arc::new(ForkCache::new());
        let t = ticker(&exec, &cache);

        let fixture = SessionHandleFixture::new(Subscription::new(["acct1"]).from_block(100));
        let before = fixture.handle.snapshot();
        exec.set_failing(true);
        assert!(t.tick(&fixture.handle).await.is_err());
        assert_eq!(fixture.handle.snapshot(), before);
    }

    #[tokio::test]
    async fn fork_tick_filters_cache_by_account() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(500, 500);
        let cache = Arc::new(ForkCache::new());
        cache.replace(
            0,
            vec![
                crate::types::ForkRecord {
                    id: 2,
                    block_number: 501,
                    payload: action("acct1").to_string().into_bytes(),
                },
                crate::types::ForkRecord {
                    id: 1,
                    block_number: 501,
                    payload: action("bob").to_string().into_bytes(),
                },
            ],
        );
        let t = ticker(&exec, &cache);

        let fixture = SessionHandleFixture::new(Subscription::new(["acct1"]));
        match t.tick(&fixture.handle).await.unwrap() {
            TickOutcome::Emit(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].id, Some(2));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fixture.handle.snapshot().last_seen_block, 0);
    }

    #[tokio::test]
    async fn extreme_density_walks_single_blocks() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(1_000, 900);
        for _ in 0..20 {
            exec.push_trace(100, &["acct1"], action("acct1"));
        }
        let cache = Arc::new(ForkCache::new());
        let config = StreamConfig { match_target: 1, probe_window_blocks: 10, ..StreamConfig::default() };
        let t = SessionTicker::new(exec.clone(), cache, &config);

        let s = session(Mode::Trace, 0, Subscription::new(["acct1"]).from_block(100));
        let window = t.trace_window(&s, &TickContext::new(&s, 1_000, 900)).await.unwrap().unwrap();
        assert_eq!((window.from, window.to), (100, 101));
    }

    #[tokio::test]
    async fn undecodable_trace_row_does_not_stall_session() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(1_000, 900);
        exec.push_trace(150, &["acct1"], action("acct1"));
        exec.push_trace_bytes(120, &["acct1"], b"\xff\xfe".to_vec());
        let cache = Arc::new(ForkCache::new());
        let t = ticker(&exec, &cache);

        let fixture = SessionHandleFixture::new(Subscription::new(["acct1"]).from_block(100));
        fixture.handle.set_mode(Mode::Trace);
        match t.tick(&fixture.handle).await.unwrap() {
            TickOutcome::Emit(entries) => {
                let blocks: Vec<u64> = entries.iter().map(|e| e.block_number).collect();
                assert_eq!(blocks, vec![150]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fixture.handle.snapshot().last_seen_block, 150);

        t.tick(&fixture.handle).await.unwrap();
        assert_eq!(exec.trace_queries(), vec![(100, 200), (150, 250)]);
    }

    #[tokio::test]
    async fn corrupt_cached_fork_record_is_skipped() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_chain(500, 500);
        let cache = Arc::new(ForkCache::new());
        cache.replace(
            0,
            vec![
                crate::types::ForkRecord {
                    id: 4,
                    block_number: 502,
                    payload: action("acct1").to_string().into_bytes(),
                },
                crate::types::ForkRecord { id: 3, block_number: 501, payload: b"{\"trace\":".to_vec() },
            ],
        );
        let t = ticker(&exec, &cache);

        let fixture = SessionHandleFixture::new(Subscription::new(["acct1"]));
        match t.tick(&fixture.handle).await.unwrap() {
            TickOutcome::Emit(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].id, Some(4));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    /// A session handle obtained through a throwaway registry.
    struct SessionHandleFixture {
        handle: SessionHandle,
        _registry: crate::registry::SessionRegistry,
    }

    impl SessionHandleFixture {
        fn new(sub: Subscription) -> Self {
            let exec = Arc::new(MemoryExecutor::new());
            let scanner = crate::fork::ForkScanner::new(
                exec,
                Arc::new(ForkCache::new()),
                100,
                std::time::Duration::from_secs(3600),
            );
            let registry = crate::registry::SessionRegistry::new(Arc::new(scanner));
            let handle = registry.register(ConnectionId::from("c"), sub);
            Self { handle, _registry: registry }
        }
    }
}
