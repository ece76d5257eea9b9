//! In-memory routing state of the gateway.
//!
//! The [`PendingStore`] remembers which caller submitted each outstanding
//! query, buffers results per caller until they are streamed, and keeps
//! results nobody is waiting for in an orphan table until they expire.
//!
//! All state sits behind one mutex that is never held across an await.
//! Each caller has a [`Notify`] that is signalled whenever a result is
//! routed to it.

use askq_core::{AppError, AppResult, QueryId, QueryResult, SessionId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Expiry settings for the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Idle time after which a caller's routing state is dropped
    pub session_ttl: Duration,

    /// How long unclaimed and already-seen results are remembered
    pub result_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(600),
            result_ttl: Duration::from_secs(3600),
        }
    }
}

/// What happened to a result handed to [`PendingStore::store_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Queued for the caller that submitted the query
    Routed,
    /// No caller is waiting for it; kept until claimed or expired
    Orphaned,
    /// A result for this query was already stored; this one was dropped
    Duplicate,
}

/// Counters reported by `/v1/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub pending: usize,
    pub ready: usize,
    pub orphans: usize,
}

/// Counts of what a reap pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub sessions: usize,
    pub orphans_expired: usize,
    pub orphans_created: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct Session {
    /// Submitted queries still waiting for a result, in submission order
    pending: Vec<QueryId>,
    /// Results ready to be streamed, in arrival order
    ready: VecDeque<QueryResult>,
    last_seen: Instant,
    notify: Arc<Notify>,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            pending: Vec::new(),
            ready: VecDeque::new(),
            last_seen: now,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Orphan {
    result: QueryResult,
    stored_at: Instant,
}

#[derive(Default)]
struct Tables {
    /// query id -> caller that submitted it
    owners: HashMap<QueryId, SessionId>,
    sessions: HashMap<SessionId, Session>,
    orphans: HashMap<QueryId, Orphan>,
    /// Ids whose result has been stored; later results for them are duplicates
    seen: HashMap<QueryId, Instant>,
}

/// Pending index and per-caller result buffers.
pub struct PendingStore {
    tables: Mutex<Tables>,
    config: StoreConfig,
}

impl PendingStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            config,
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `session` is waiting for the result of `query_id`.
    ///
    /// Fails if the id is already outstanding or has been answered.
    pub fn register(&self, query_id: QueryId, session: &SessionId) -> AppResult<()> {
        let now = Instant::now();
        let mut tables = self.lock();

        if tables.owners.contains_key(&query_id)
            || tables.seen.contains_key(&query_id)
            || tables.orphans.contains_key(&query_id)
        {
            return Err(AppError::Dispatch(format!(
                "Query id {} is already in use",
                query_id
            )));
        }

        tables.owners.insert(query_id, session.clone());
        let entry = tables
            .sessions
            .entry(session.clone())
            .or_insert_with(|| Session::new(now));
        entry.pending.push(query_id);
        entry.last_seen = now;
        Ok(())
    }

    /// Undo a [`register`](Self::register) whose publish failed.
    pub fn unregister(&self, query_id: QueryId) {
        let mut tables = self.lock();
        if let Some(session) = tables.owners.remove(&query_id) {
            if let Some(entry) = tables.sessions.get_mut(&session) {
                entry.pending.retain(|id| *id != query_id);
            }
        }
    }

    /// Route a result to its caller.
    ///
    /// The first result stored for a query wins. Later ones are reported as
    /// [`StoreOutcome::Duplicate`] and dropped.
    pub fn store_result(&self, result: QueryResult) -> StoreOutcome {
        let now = Instant::now();
        let mut tables = self.lock();
        let tables = &mut *tables;

        if tables.seen.contains_key(&result.query_id) {
            return StoreOutcome::Duplicate;
        }
        tables.seen.insert(result.query_id, now);

        let session = tables
            .owners
            .get(&result.query_id)
            .and_then(|owner| tables.sessions.get_mut(owner));

        match session {
            Some(session) => {
                session.ready.push_back(result);
                session.notify.notify_waiters();
                StoreOutcome::Routed
            }
            None => {
                tables.orphans.insert(
                    result.query_id,
                    Orphan {
                        result,
                        stored_at: now,
                    },
                );
                StoreOutcome::Orphaned
            }
        }
    }

    /// Mark `session` as active and return its wake-up handle.
    ///
    /// Creates the routing entry when the caller has none yet, so a stream
    /// may be opened before the first submission.
    pub fn subscribe(&self, session: &SessionId) -> Arc<Notify> {
        let now = Instant::now();
        let mut tables = self.lock();
        let entry = tables
            .sessions
            .entry(session.clone())
            .or_insert_with(|| Session::new(now));
        entry.last_seen = now;
        Arc::clone(&entry.notify)
    }

    /// Pop the oldest ready result for `session`.
    pub fn take_next(&self, session: &SessionId) -> Option<QueryResult> {
        let mut tables = self.lock();
        let tables = &mut *tables;

        let entry = tables.sessions.get_mut(session)?;
        entry.last_seen = Instant::now();
        let result = entry.ready.pop_front()?;
        entry.pending.retain(|id| *id != result.query_id);
        tables.owners.remove(&result.query_id);
        Some(result)
    }

    /// Pop every ready result for `session`.
    pub fn take_all(&self, session: &SessionId) -> Vec<QueryResult> {
        let mut taken = Vec::new();
        while let Some(result) = self.take_next(session) {
            taken.push(result);
        }
        taken
    }

    /// Claim a single result by id, from the orphan table or from whichever
    /// caller's buffer holds it.
    pub fn claim(&self, query_id: QueryId) -> Option<QueryResult> {
        let mut tables = self.lock();
        let tables = &mut *tables;

        if let Some(orphan) = tables.orphans.remove(&query_id) {
            return Some(orphan.result);
        }

        let owner = tables.owners.get(&query_id)?.clone();
        let entry = tables.sessions.get_mut(&owner)?;
        let position = entry.ready.iter().position(|r| r.query_id == query_id)?;
        let result = entry.ready.remove(position)?;
        entry.pending.retain(|id| *id != query_id);
        tables.owners.remove(&query_id);
        Some(result)
    }

    /// Whether `query_id` is outstanding for some caller.
    pub fn is_pending(&self, query_id: QueryId) -> bool {
        self.lock().owners.contains_key(&query_id)
    }

    /// Drop idle callers and expired results.
    ///
    /// Ready results of an idle caller become orphans, and its outstanding
    /// ids stop being routed so late results are orphaned too. Orphans and
    /// the duplicate window expire after the result TTL.
    pub fn reap(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();
        let mut tables = self.lock();
        let tables = &mut *tables;

        let idle: Vec<SessionId> = tables
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) > self.config.session_ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in idle {
            let Some(session) = tables.sessions.remove(&session_id) else {
                continue;
            };
            report.sessions += 1;

            for query_id in &session.pending {
                tables.owners.remove(query_id);
            }
            for result in session.ready {
                report.orphans_created += 1;
                tables.orphans.insert(
                    result.query_id,
                    Orphan {
                        result,
                        stored_at: now,
                    },
                );
            }
        }

        let ttl = self.config.result_ttl;
        let before = tables.orphans.len();
        tables
            .orphans
            .retain(|_, orphan| now.saturating_duration_since(orphan.stored_at) <= ttl);
        report.orphans_expired = before - tables.orphans.len();

        let owners = &tables.owners;
        let orphans = &tables.orphans;
        tables.seen.retain(|id, stored_at| {
            now.saturating_duration_since(*stored_at) <= ttl
                || owners.contains_key(id)
                || orphans.contains_key(id)
        });

        report
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.lock();
        StoreStats {
            sessions: tables.sessions.len(),
            pending: tables.owners.len(),
            ready: tables.sessions.values().map(|s| s.ready.len()).sum(),
            orphans: tables.orphans.len(),
        }
    }

    /// Wait until `session` has a ready result or `timeout` elapses.
    ///
    /// Returns immediately when something is already buffered.
    pub async fn wait_ready(&self, session: &SessionId, timeout: Duration) {
        let notify = self.subscribe(session);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.has_ready(session) {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    fn has_ready(&self, session: &SessionId) -> bool {
        self.lock()
            .sessions
            .get(session)
            .is_some_and(|s| !s.ready.is_empty())
    }
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
