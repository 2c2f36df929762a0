//! Session registry: per-connection state and the fork scanner lifecycle.
//!
//! The session map and the scanner task sit behind one mutex. Every insert or
//! removal that changes the registry between empty and non-empty starts or
//! stops the scanner while that mutex is held, so the scanner runs exactly
//! when at least one session exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::fork::ForkScanner;
use crate::lock;
use crate::types::{ConnectionId, Mode, Subscription};

// ─── Session ──────────────────────────────────────────────────────────────────

/// Per-connection streaming state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub mode: Mode,
    /// Highest block delivered in trace mode; never decreases.
    pub last_seen_block: u64,
    pub subscription: Subscription,
}

/// Partial update applied with [`SessionRegistry::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub mode: Option<Mode>,
    /// Merged with `max`, so an older value can never move the session back.
    pub last_seen_block: Option<u64>,
}

/// Shared handle to one session's state.
///
/// Only the session's own tick task writes through it. The lock is never
/// held across an await.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    state: Arc<Mutex<Session>>,
}

impl SessionHandle {
    fn new(id: ConnectionId, subscription: Subscription) -> Self {
        let session = Session {
            connection_id: id.clone(),
            mode: Mode::Fork,
            last_seen_block: 0,
            subscription,
        };
        Self { id, state: Arc::new(Mutex::new(session)) }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn snapshot(&self) -> Session {
        lock(&self.state).clone()
    }

    pub fn set_mode(&self, mode: Mode) {
        lock(&self.state).mode = mode;
    }

    /// Raise `last_seen_block` to `block` if higher; returns the resulting value.
    pub fn advance_last_seen(&self, block: u64) -> u64 {
        let mut state = lock(&self.state);
        state.last_seen_block = state.last_seen_block.max(block);
        state.last_seen_block
    }

    pub fn apply(&self, update: SessionUpdate) {
        let mut state = lock(&self.state);
        if let Some(mode) = update.mode {
            state.mode = mode;
        }
        if let Some(block) = update.last_seen_block {
            state.last_seen_block = state.last_seen_block.max(block);
        }
    }

    fn set_subscription(&self, subscription: Subscription) {
        lock(&self.state).subscription = subscription;
    }
}

// ─── SessionRegistry ──────────────────────────────────────────────────────────

struct SessionEntry {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<ConnectionId, SessionEntry>,
    scan_task: Option<JoinHandle<()>>,
    scanner_starts: u64,
}

/// Maps connections to sessions and drives the shared fork scanner.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    scanner: Arc<ForkScanner>,
}

impl SessionRegistry {
    pub fn new(scanner: Arc<ForkScanner>) -> Self {
        Self { inner: Mutex::new(RegistryInner::default()), scanner }
    }

    /// Create a session for `id`, or replace the subscription of its existing
    /// session (mode and progress are kept).
    ///
    /// Must be called from within a Tokio runtime: the first session spawns
    /// the fork scanner.
    pub fn register(&self, id: ConnectionId, subscription: Subscription) -> SessionHandle {
        let mut inner = lock(&self.inner);

        if let Some(entry) = inner.sessions.get(&id) {
            debug!(connection = %id, "re-subscription on existing session");
            entry.handle.set_subscription(subscription);
            return entry.handle.clone();
        }

        let handle = SessionHandle::new(id.clone(), subscription);
        inner.sessions.insert(id.clone(), SessionEntry { handle: handle.clone(), task: None });
        debug!(connection = %id, sessions = inner.sessions.len(), "session registered");

        if inner.sessions.len() == 1 {
            self.start_scanner(&mut inner);
        }
        handle
    }

    /// Hand the session's tick task to the registry.
    ///
    /// A previously attached task is aborted. If the session is already gone
    /// the task is aborted and `false` is returned.
    pub fn attach_task(&self, id: &ConnectionId, task: JoinHandle<()>) -> bool {
        let mut inner = lock(&self.inner);
        match inner.sessions.get_mut(id) {
            Some(entry) => {
                if let Some(previous) = entry.task.replace(task) {
                    previous.abort();
                }
                true
            }
            None => {
                task.abort();
                false
            }
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Session> {
        let inner = lock(&self.inner);
        inner.sessions.get(id).map(|e| e.handle.snapshot())
    }

    /// Apply a partial update; returns `false` if there is no such session.
    pub fn update(&self, id: &ConnectionId, update: SessionUpdate) -> bool {
        let inner = lock(&self.inner);
        match inner.sessions.get(id) {
            Some(entry) => {
                entry.handle.apply(update);
                true
            }
            None => false,
        }
    }

    /// Abort the session's task and drop it. Stops the scanner when the last
    /// session goes away. Returns `false` if there was no session.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.sessions.remove(id) else {
            return false;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        debug!(connection = %id, sessions = inner.sessions.len(), "session removed");

        if inner.sessions.is_empty() {
            self.stop_scanner(&mut inner);
        }
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` while the fork scan loop is running.
    pub fn scanner_running(&self) -> bool {
        lock(&self.inner).scan_task.is_some()
    }

    /// How many times the scan loop has been started.
    pub fn scanner_starts(&self) -> u64 {
        lock(&self.inner).scanner_starts
    }

    fn start_scanner(&self, inner: &mut RegistryInner) {
        if inner.scan_task.is_none() {
            inner.scan_task = Some(self.scanner.spawn());
            inner.scanner_starts += 1;
            info!("fork scanner started");
        }
    }

    fn stop_scanner(&self, inner: &mut RegistryInner) {
        if let Some(task) = inner.scan_task.take() {
            task.abort();
            self.scanner.cache().reset();
            info!("fork scanner stopped");
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for entry in inner.sessions.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        if let Some(task) = inner.scan_task.take() {
            task.abort();
        }
    }
}
