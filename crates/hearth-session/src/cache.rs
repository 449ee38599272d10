//! The authoritative in-memory session table.
//!
//! [`SessionCache`] serves resident sessions from memory and falls back to
//! the [`SessionDataStore`] on a miss. The table lock only guards key
//! insertion and removal and is never held across a store round trip;
//! per-id load locks keep two tasks from loading the same snapshot twice,
//! and each session's lifecycle lock serializes its saves, renames and
//! invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EvictionPolicy, SavePolicy};
use crate::error::{Error, Result};
use crate::listener::{Listeners, SessionEvent};
use crate::session::{Completion, Session, now_millis};
use crate::store::SessionDataStore;

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Resident sessions, tombstones included.
    pub size: usize,
    /// Configured maximum before LRU eviction starts.
    pub capacity: usize,
    /// Resident sessions with at least one active request.
    pub in_use: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-id load locks
// ─────────────────────────────────────────────────────────────────────────────

type IdLockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Async locks keyed by session id, created on demand and dropped with
/// their last holder.
#[derive(Default)]
struct IdLocks {
    locks: IdLockMap,
}

impl IdLocks {
    async fn lock(&self, id: &str) -> IdGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(guard),
        }
    }
}

struct IdGuard<'a> {
    locks: &'a IdLockMap,
    id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map and this guard hold the only references: nobody is waiting.
        if let Some(lock) = locks.get(&self.id)
            && Arc::strong_count(lock) == 2
        {
            locks.remove(&self.id);
        }
        self.guard.take();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionCache
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session table in front of a [`SessionDataStore`].
pub struct SessionCache {
    table: Mutex<LruCache<String, Arc<Session>>>,
    load_locks: IdLocks,
    store: Arc<dyn SessionDataStore>,
    listeners: Arc<Listeners>,
    eviction: EvictionPolicy,
    save: SavePolicy,
    max_sessions: usize,
    closed: AtomicBool,
}

impl SessionCache {
    pub fn new(
        store: Arc<dyn SessionDataStore>,
        listeners: Arc<Listeners>,
        eviction: EvictionPolicy,
        save: SavePolicy,
        max_sessions: usize,
    ) -> Self {
        Self {
            // Capacity is enforced by hand so in-use sessions are never pushed out.
            table: Mutex::new(LruCache::unbounded()),
            load_locks: IdLocks::default(),
            store,
            listeners,
            eviction,
            save,
            max_sessions: max_sessions.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionDataStore> {
        &self.store
    }

    pub fn eviction(&self) -> EvictionPolicy {
        self.eviction
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Whether `id` is resident (tombstones included).
    pub fn contains(&self, id: &str) -> bool {
        self.table.lock().contains(id)
    }

    /// Ids of every resident session.
    pub fn resident_ids(&self) -> Vec<String> {
        self.table.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        CacheStats {
            size: table.len(),
            capacity: self.max_sessions,
            in_use: table.iter().filter(|(_, s)| !s.is_idle()).count(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn resident(&self, id: &str) -> Option<Arc<Session>> {
        self.table.lock().peek(id).cloned()
    }

    /// Access a resident session under the table lock, so eviction can't
    /// remove it between the lookup and the access.
    fn access_resident(&self, id: &str, now: i64) -> Result<Option<Arc<Session>>> {
        let mut table = self.table.lock();
        let Some(session) = table.get(id) else {
            return Ok(None);
        };
        match session.access(now) {
            Ok(()) => Ok(Some(Arc::clone(session))),
            Err(Error::InvalidState(_)) => Err(Error::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let id = session.id();
        let mut table = self.table.lock();
        if table.peek(&id).is_some_and(|current| Arc::ptr_eq(current, session)) {
            table.pop(&id);
            return true;
        }
        false
    }

    // ── Request path ────────────────────────────────────────────────────────

    /// Begin a request on session `id`, loading it from the store on a miss.
    ///
    /// Each successful call must be paired with [`release`](Self::release).
    /// Unknown and invalidated ids fail with `NotFound`, expired ones with
    /// `Expired`.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.ensure_open()?;
        let now = now_millis();
        if let Some(session) = self.access_resident(id, now)? {
            return Ok(session);
        }

        let _load = self.load_locks.lock(id).await;
        if let Some(session) = self.access_resident(id, now)? {
            return Ok(session);
        }
        let Some(snapshot) = self.store.load(id).await? else {
            return Err(Error::NotFound(id.to_string()));
        };
        if snapshot.is_expired(now) {
            debug!(session_id = %id, "Loaded snapshot already expired");
            return Err(Error::Expired(id.to_string()));
        }

        let session = Arc::new(Session::from_snapshot(snapshot));
        session.access(now)?;
        self.table.lock().put(id.to_string(), Arc::clone(&session));
        debug!(session_id = %id, "Session loaded from store");
        self.enforce_capacity().await;
        Ok(session)
    }

    /// Insert a newly created session and schedule its initial save.
    pub async fn add(&self, session: Arc<Session>) -> Result<()> {
        self.ensure_open()?;
        let id = session.id();
        {
            let mut table = self.table.lock();
            if table.contains(&id) {
                return Err(Error::InvalidState(format!("session {id} already exists")));
            }
            table.put(id.clone(), Arc::clone(&session));
        }

        if self.save.save_on_create {
            let store = Arc::clone(&self.store);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                if let Err(e) = persist(store.as_ref(), &session).await {
                    warn!(session_id = %session.id(), error = %e, "Initial session save failed; will retry on release");
                }
            });
        }

        self.enforce_capacity().await;
        Ok(())
    }

    /// End a request on `session`.
    ///
    /// The last release saves a session whose stored copy is out of date,
    /// per the save policy, and applies on-release eviction. A store
    /// failure is returned; the session stays resident and dirty.
    pub async fn release(&self, session: &Arc<Session>) -> Result<()> {
        match session.complete() {
            Completion::Active(_) => Ok(()),
            Completion::IdleInvalidated => {
                let _lifecycle = session.lock_lifecycle().await;
                // A pending invalidation keeps its tombstone for the scavenger.
                if !session.invalidation_pending() && session.is_idle() {
                    self.remove_if_same(session);
                }
                Ok(())
            }
            Completion::Idle => {
                if self.save_due(session, now_millis()) {
                    persist(self.store.as_ref(), session).await?;
                }
                if self.eviction == EvictionPolicy::OnRelease {
                    self.evict(session).await?;
                }
                Ok(())
            }
        }
    }

    fn save_due(&self, session: &Session, now: i64) -> bool {
        if self.save.save_on_release && session.needs_save() {
            return true;
        }
        self.save.save_interval_secs.is_some_and(|secs| {
            let interval = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
            session
                .last_saved()
                .is_none_or(|at| now.saturating_sub(at) >= interval)
        })
    }

    /// Write `session` to the store now.
    pub async fn save(&self, session: &Session) -> Result<()> {
        persist(self.store.as_ref(), session).await
    }

    // ── Invalidation ────────────────────────────────────────────────────────

    /// Permanently destroy session `id` in memory and in the store.
    ///
    /// Fires `Destroyed` once. A session still in use is removed from the
    /// table by its last release. If the store delete fails the session
    /// stays as a tombstone (refused to new callers) and the error is
    /// returned; the scavenger retries the delete.
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        if let Some(session) = self.resident(id) {
            return self.destroy(&session).await;
        }

        let _load = self.load_locks.lock(id).await;
        if let Some(session) = self.resident(id) {
            return self.destroy(&session).await;
        }
        let snapshot = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.destroy(&Arc::new(Session::from_snapshot(snapshot))).await
    }

    async fn destroy(&self, session: &Arc<Session>) -> Result<()> {
        let _lifecycle = session.lock_lifecycle().await;
        session.begin_invalidation()?;
        self.listeners.fire(SessionEvent::Destroyed(session));
        self.delete_invalidated(session).await
    }

    /// Delete the snapshot of a session whose invalidation has begun.
    /// Caller holds the lifecycle lock.
    async fn delete_invalidated(&self, session: &Arc<Session>) -> Result<()> {
        let id = session.id();
        match self.store.delete(&id).await {
            Ok(_) => {
                session.finish_invalidation();
                if session.is_idle() {
                    self.remove_if_same(session);
                }
                info!(session_id = %id, "Session invalidated");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Store delete failed; keeping tombstone");
                let mut table = self.table.lock();
                if !table.contains(&id) {
                    table.put(id, Arc::clone(session));
                }
                Err(e)
            }
        }
    }

    /// Destroy `id` if it is expired as of `now`. Returns whether anything
    /// was destroyed. Sessions with active requests are left for a later
    /// pass; pending tombstones get their store delete retried.
    pub async fn reap(&self, id: &str, now: i64) -> Result<bool> {
        if let Some(session) = self.resident(id) {
            return self.reap_resident(&session, now).await;
        }

        let _load = self.load_locks.lock(id).await;
        if let Some(session) = self.resident(id) {
            return self.reap_resident(&session, now).await;
        }
        let Some(snapshot) = self.store.load(id).await? else {
            return Ok(false);
        };
        if !snapshot.is_expired(now) {
            return Ok(false);
        }
        self.destroy(&Arc::new(Session::from_snapshot(snapshot)))
            .await
            .map(|()| true)
    }

    async fn reap_resident(&self, session: &Arc<Session>, now: i64) -> Result<bool> {
        if !session.is_idle() {
            debug!(session_id = %session.id(), "Session in use; deferring reap");
            return Ok(false);
        }

        let _lifecycle = session.lock_lifecycle().await;
        if session.invalidation_pending() {
            return self.delete_invalidated(session).await.map(|()| true);
        }
        if session.is_invalidated() {
            if session.is_idle() {
                self.remove_if_same(session);
            }
            return Ok(false);
        }
        // An idle session past its expiry refuses new requests, so this
        // check can't race with an access.
        if !session.is_expired(now) || !session.is_idle() {
            return Ok(false);
        }
        session.begin_invalidation()?;
        self.listeners.fire(SessionEvent::Destroyed(session));
        self.delete_invalidated(session).await.map(|()| true)
    }

    // ── Renaming ────────────────────────────────────────────────────────────

    /// Re-key resident session `old_id` as `new_id` in memory and in the store.
    ///
    /// The table swap happens under one lock acquisition, so no caller ever
    /// sees both ids. If the new snapshot can't be written the rename is
    /// rolled back. If only the old snapshot's delete fails, the old id is
    /// kept as a tombstone until the scavenger removes it.
    pub async fn renew_session_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        self.ensure_open()?;
        if old_id == new_id {
            return Ok(());
        }
        let (first, second) = if old_id < new_id { (old_id, new_id) } else { (new_id, old_id) };
        let _first = self.load_locks.lock(first).await;
        let _second = self.load_locks.lock(second).await;

        let session = self
            .resident(old_id)
            .ok_or_else(|| Error::NotFound(old_id.to_string()))?;
        let _lifecycle = session.lock_lifecycle().await;
        if session.is_invalidated() {
            return Err(Error::InvalidState(format!("session {old_id} is invalidated")));
        }

        let old_snapshot = {
            let mut table = self.table.lock();
            if table.contains(new_id) {
                return Err(Error::InvalidState(format!("session id {new_id} is already in use")));
            }
            let old_snapshot = session.snapshot();
            table.pop(old_id);
            session.set_id(new_id);
            table.put(new_id.to_string(), Arc::clone(&session));
            old_snapshot
        };

        let (snapshot, version) = session.snapshot_versioned();
        if let Err(e) = self.store.store(new_id, &snapshot).await {
            let mut table = self.table.lock();
            table.pop(new_id);
            session.set_id(old_id);
            table.put(old_id.to_string(), Arc::clone(&session));
            warn!(session_id = %old_id, new_id = %new_id, error = %e, "Session id renewal rolled back");
            return Err(e);
        }
        session.mark_saved(&snapshot, version, now_millis());

        if let Err(e) = self.store.delete(old_id).await {
            warn!(session_id = %old_id, error = %e, "Old session snapshot not deleted; keeping tombstone");
            let tombstone = Arc::new(Session::from_snapshot(old_snapshot));
            tombstone.begin_invalidation()?;
            self.table.lock().put(old_id.to_string(), tombstone);
        }
        info!(old_id = %old_id, new_id = %new_id, "Session id renewed");
        Ok(())
    }

    // ── Eviction ────────────────────────────────────────────────────────────

    /// Drop `session` from memory if it is still idle, saving it first when
    /// the stored copy is out of date. Returns whether it was evicted.
    async fn evict(&self, session: &Arc<Session>) -> Result<bool> {
        if self.save.save_on_eviction && session.needs_save() {
            persist(self.store.as_ref(), session).await?;
        }
        let id = session.id();
        let mut table = self.table.lock();
        if !session.is_evictable() || (self.save.save_on_eviction && session.needs_save()) {
            return Ok(false);
        }
        if table.peek(&id).is_some_and(|current| Arc::ptr_eq(current, session)) {
            table.pop(&id);
            debug!(session_id = %id, "Session evicted from memory");
            return Ok(true);
        }
        Ok(false)
    }

    /// Evict resident sessions idle for at least `idle_secs`. Returns how
    /// many were evicted.
    pub async fn evict_idle(&self, now: i64, idle_secs: u64) -> usize {
        let idle_ms = i64::try_from(idle_secs).unwrap_or(i64::MAX).saturating_mul(1000);
        let candidates: Vec<Arc<Session>> = self
            .table
            .lock()
            .iter()
            .filter(|(_, s)| s.is_evictable() && now.saturating_sub(s.last_accessed()) >= idle_ms)
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let mut evicted = 0;
        for session in candidates {
            match self.evict(&session).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "Idle eviction save failed"),
            }
        }
        evicted
    }

    /// Evict least-recently-used idle sessions until within capacity.
    async fn enforce_capacity(&self) {
        loop {
            let victim = {
                let table = self.table.lock();
                if table.len() <= self.max_sessions {
                    return;
                }
                table
                    .iter()
                    .rev()
                    .find(|(_, s)| s.is_evictable())
                    .map(|(_, s)| Arc::clone(s))
            };
            let Some(victim) = victim else {
                debug!(capacity = self.max_sessions, "Session cache over capacity; every session is in use");
                return;
            };
            match self.evict(&victim).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(session_id = %victim.id(), error = %e, "Capacity eviction save failed");
                    return;
                }
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Save every out-of-date session, then drop the table. Later `get`/`add`
    /// calls fail with `Closed`. Returns the number of sessions saved.
    pub async fn flush_and_close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let sessions: Vec<Arc<Session>> = self
            .table
            .lock()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let mut saved = 0;
        for session in &sessions {
            if !session.needs_save() || session.is_invalidated() {
                continue;
            }
            match persist(self.store.as_ref(), session).await {
                Ok(()) => saved += 1,
                Err(e) => warn!(session_id = %session.id(), error = %e, "Failed to flush session"),
            }
        }
        self.table.lock().clear();
        info!(saved, resident = sessions.len(), "Session cache flushed");
        saved
    }
}

/// Write the current state of `session`. Invalidated sessions are skipped
/// so a late save can't resurrect a deleted snapshot.
async fn persist(store: &dyn SessionDataStore, session: &Session) -> Result<()> {
    let _lifecycle = session.lock_lifecycle().await;
    if session.is_invalidated() {
        return Ok(());
    }
    let (snapshot, version) = session.snapshot_versioned();
    store.store(&snapshot.id, &snapshot).await?;
    session.mark_saved(&snapshot, version, now_millis());
    debug!(session_id = %snapshot.id, "Session saved");
    Ok(())
}
