//! `StreamEngine`: the entry point a client transport drives.
//!
//! # Usage
//! ```no_run
//! # use std::sync::Arc;
//! # use chainstream_core::{MemoryExecutor, RecordingOutbound, StreamConfig, StreamEngine};
//! # async fn example() -> Result<(), chainstream_core::StreamError> {
//! let engine = StreamEngine::new(
//!     StreamConfig::default(),
//!     Arc::new(MemoryExecutor::new()),
//!     Arc::new(RecordingOutbound::new()),
//! )?;
//! let conn = "socket-1".into();
//! engine.subscribe(&conn, &serde_json::json!({"accounts": ["eosio.token"]}));
//! // ... later, when the socket closes:
//! engine.disconnect(&conn);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{StreamError, ValidationError};
use crate::executor::QueryExecutor;
use crate::fork::{ForkCache, ForkScanner};
use crate::registry::{Session, SessionHandle, SessionRegistry};
use crate::session::{SessionTicker, TickOutcome};
use crate::transport::Outbound;
use crate::types::ConnectionId;
use crate::validate::validate_subscription;

/// The streaming engine. One per process.
pub struct StreamEngine {
    config: StreamConfig,
    registry: SessionRegistry,
    cache: Arc<ForkCache>,
    ticker: Arc<SessionTicker>,
    outbound: Arc<dyn Outbound>,
}

impl StreamEngine {
    pub fn new(
        config: StreamConfig,
        executor: Arc<dyn QueryExecutor>,
        outbound: Arc<dyn Outbound>,
    ) -> Result<Arc<Self>, StreamError> {
        config.validate()?;
        let cache = Arc::new(ForkCache::new());
        let scanner = Arc::new(ForkScanner::new(
            Arc::clone(&executor),
            Arc::clone(&cache),
            config.fork_page_size,
            config.fork_scan_interval(),
        ));
        let ticker = Arc::new(SessionTicker::new(executor, Arc::clone(&cache), &config));
        Ok(Arc::new(Self {
            registry: SessionRegistry::new(scanner),
            cache,
            ticker,
            outbound,
            config,
        }))
    }

    /// Handle a `transactions_history` request from `connection`.
    ///
    /// Valid requests create (or re-target) the session and (re)start its tick
    /// task. Invalid ones tear down any existing session, report the reason,
    /// and close the connection after the grace delay.
    pub fn subscribe(&self, connection: &ConnectionId, payload: &Value) -> Result<(), ValidationError> {
        let subscription = match validate_subscription(payload) {
            Ok(subscription) => subscription,
            Err(reason) => {
                warn!(connection = %connection, %reason, "rejected subscription");
                self.registry.remove(connection);
                self.outbound.emit_error(connection, &reason.to_string());
                self.schedule_disconnect(connection.clone());
                return Err(reason);
            }
        };

        info!(
            connection = %connection,
            accounts = subscription.accounts.len(),
            start_block = ?subscription.start_block,
            irreversible = subscription.irreversible,
            "subscribed"
        );
        let handle = self.registry.register(connection.clone(), subscription);
        let task = self.spawn_session(handle);
        self.registry.attach_task(connection, task);
        Ok(())
    }

    /// Tear down the session of a closed connection. Returns `false` if it
    /// had none.
    pub fn disconnect(&self, connection: &ConnectionId) -> bool {
        let removed = self.registry.remove(connection);
        if removed {
            debug!(connection = %connection, "session closed");
        }
        removed
    }

    pub fn session(&self, connection: &ConnectionId) -> Option<Session> {
        self.registry.get(connection)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ForkCache> {
        &self.cache
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn spawn_session(&self, handle: SessionHandle) -> JoinHandle<()> {
        let ticker = Arc::clone(&self.ticker);
        let outbound = Arc::clone(&self.outbound);
        let period = self.config.tick_interval();
        tokio::spawn(run_session(ticker, outbound, handle, period))
    }

    fn schedule_disconnect(&self, connection: ConnectionId) {
        let outbound = Arc::clone(&self.outbound);
        let grace = self.config.invalid_args_grace();
        tokio::spawn(async move {
            time::sleep(grace).await;
            outbound.disconnect(&connection);
        });
    }
}

/// Tick loop of one session. Each tick runs to completion before the next
/// one is awaited; ticks that fall due meanwhile are skipped.
async fn run_session(
    ticker: Arc<SessionTicker>,
    outbound: Arc<dyn Outbound>,
    handle: SessionHandle,
    period: Duration,
) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match ticker.tick(&handle).await {
            Ok(TickOutcome::Emit(entries)) => outbound.emit_data(handle.id(), entries),
            Ok(TickOutcome::Switched { .. } | TickOutcome::Idle) => {}
            Err(e) => warn!(connection = %handle.id(), error = %e, "session tick failed"),
        }
    }
}
