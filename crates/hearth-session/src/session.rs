//! The in-memory session record and its persisted snapshot.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry instant for a session, or `None` if it never expires.
pub fn compute_expiry(last_accessed: i64, max_inactive_secs: i64) -> Option<i64> {
    (max_inactive_secs > 0).then(|| last_accessed.saturating_add(max_inactive_secs.saturating_mul(1000)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Persistable copy of a session, as written to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: i64,
    pub last_accessed: i64,
    pub max_inactive_secs: i64,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Snapshot {
    /// Expiry in epoch millis, `None` if the session never expires.
    pub fn expiry(&self) -> Option<i64> {
        compute_expiry(self.last_accessed, self.max_inactive_secs)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry().is_some_and(|expiry| now > expiry)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`Session::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other requests still hold the session.
    Active(usize),
    /// The last request finished.
    Idle,
    /// The last request finished and the session was invalidated meanwhile.
    IdleInvalidated,
}

/// Validity of a session. `Invalidating` covers the window in which
/// destroy listeners run: new requests are refused but attributes can
/// still be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validity {
    Valid,
    Invalidating,
    Invalid,
}

#[derive(Debug)]
struct SessionState {
    last_accessed: i64,
    max_inactive_secs: i64,
    attributes: HashMap<String, Value>,
    dirty: bool,
    /// Bumped on every mutation so a save can tell whether it is still current.
    version: u64,
    requests: usize,
    validity: Validity,
    last_saved: Option<i64>,
    /// `last_accessed` as of the last successful save.
    saved_access: Option<i64>,
}

impl SessionState {
    fn ensure_valid(&self, id: &str) -> Result<()> {
        if self.validity == Validity::Invalid {
            return Err(Error::InvalidState(format!("session {id} is invalidated")));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.version += 1;
    }
}

/// A live session.
///
/// Metadata, attributes and the request counter sit behind one short-lived
/// lock that is never held across an await. A second, async lock
/// serializes store round trips (save, invalidate, rename) for this
/// session only, so unrelated sessions never contend.
#[derive(Debug)]
pub struct Session {
    id: RwLock<String>,
    created_at: i64,
    state: Mutex<SessionState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a brand new session. It starts dirty since it was never saved.
    pub fn new(id: impl Into<String>, now: i64, max_inactive_secs: i64) -> Self {
        Self {
            id: RwLock::new(id.into()),
            created_at: now,
            state: Mutex::new(SessionState {
                last_accessed: now,
                max_inactive_secs,
                attributes: HashMap::new(),
                dirty: true,
                version: 0,
                requests: 0,
                validity: Validity::Valid,
                last_saved: None,
                saved_access: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild a session from a stored snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            id: RwLock::new(snapshot.id),
            created_at: snapshot.created_at,
            state: Mutex::new(SessionState {
                last_accessed: snapshot.last_accessed,
                max_inactive_secs: snapshot.max_inactive_secs,
                attributes: snapshot.attributes,
                dirty: false,
                version: 0,
                requests: 0,
                validity: Validity::Valid,
                last_saved: Some(snapshot.last_accessed),
                saved_access: Some(snapshot.last_accessed),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: &str) {
        *self.id.write() = id.to_string();
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_accessed(&self) -> i64 {
        self.state.lock().last_accessed
    }

    pub fn max_inactive_secs(&self) -> i64 {
        self.state.lock().max_inactive_secs
    }

    /// Change the max-inactive interval; the expiry moves with it.
    pub fn set_max_inactive_secs(&self, secs: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_valid(&self.id())?;
        state.max_inactive_secs = secs;
        state.touch();
        Ok(())
    }

    /// Expiry in epoch millis, `None` if the session never expires.
    pub fn expiry(&self) -> Option<i64> {
        let state = self.state.lock();
        compute_expiry(state.last_accessed, state.max_inactive_secs)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry().is_some_and(|expiry| now > expiry)
    }

    /// Number of requests currently holding the session.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// The stored copy is out of date: attributes changed, or a later
    /// access moved the expiry past the one last written.
    pub fn needs_save(&self) -> bool {
        let state = self.state.lock();
        state.dirty || state.saved_access.is_none_or(|at| at < state.last_accessed)
    }

    /// True once invalidation has begun.
    pub fn is_invalidated(&self) -> bool {
        self.state.lock().validity != Validity::Valid
    }

    /// Epoch millis of the last successful save, if any.
    pub fn last_saved(&self) -> Option<i64> {
        self.state.lock().last_saved
    }

    /// Begin a request on this session.
    ///
    /// An idle session past its expiry refuses new requests; one that is
    /// already in use stays usable so an in-flight request can't be cut off.
    pub fn access(&self, now: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.validity != Validity::Valid {
            return Err(Error::InvalidState(format!("session {} is invalidated", self.id())));
        }
        if state.requests == 0
            && compute_expiry(state.last_accessed, state.max_inactive_secs)
                .is_some_and(|expiry| now > expiry)
        {
            return Err(Error::Expired(self.id()));
        }
        state.requests += 1;
        state.last_accessed = now;
        Ok(())
    }

    /// End a request on this session.
    pub fn complete(&self) -> Completion {
        let mut state = self.state.lock();
        if state.requests == 0 {
            warn!(session_id = %self.id(), "complete() without a matching access()");
        } else {
            state.requests -= 1;
        }
        match (state.requests, state.validity) {
            (0, Validity::Valid) => Completion::Idle,
            (0, _) => Completion::IdleInvalidated,
            (n, _) => Completion::Active(n),
        }
    }

    pub fn attribute(&self, name: &str) -> Result<Option<Value>> {
        let state = self.state.lock();
        state.ensure_valid(&self.id())?;
        Ok(state.attributes.get(name).cloned())
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        state.ensure_valid(&self.id())?;
        let old = state.attributes.insert(name.into(), value);
        state.touch();
        Ok(old)
    }

    /// Remove an attribute, returning its value. Removing a missing name
    /// leaves the session clean.
    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        state.ensure_valid(&self.id())?;
        let old = state.attributes.remove(name);
        if old.is_some() {
            state.touch();
        }
        Ok(old)
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        state.ensure_valid(&self.id())?;
        Ok(state.attributes.keys().cloned().collect())
    }

    /// Copy the persistable state along with the mutation version it reflects.
    pub(crate) fn snapshot_versioned(&self) -> (Snapshot, u64) {
        let id = self.id();
        let state = self.state.lock();
        let snapshot = Snapshot {
            id,
            created_at: self.created_at,
            last_accessed: state.last_accessed,
            max_inactive_secs: state.max_inactive_secs,
            attributes: state.attributes.clone(),
        };
        (snapshot, state.version)
    }

    /// Copy the persistable state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_versioned().0
    }

    /// Record a successful save of `snapshot`, taken at `version`.
    pub(crate) fn mark_saved(&self, snapshot: &Snapshot, version: u64, now: i64) {
        let mut state = self.state.lock();
        if state.version == version {
            state.dirty = false;
        }
        state.last_saved = Some(now);
        state.saved_access = Some(state.saved_access.map_or(snapshot.last_accessed, |at| {
            at.max(snapshot.last_accessed)
        }));
    }

    /// Begin invalidation. Fails if another caller got there first.
    ///
    /// Until [`finish_invalidation`](Self::finish_invalidation) the session
    /// refuses new requests but its attributes stay readable.
    pub(crate) fn begin_invalidation(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.validity != Validity::Valid {
            return Err(Error::InvalidState(format!(
                "session {} is already invalidated",
                self.id()
            )));
        }
        state.validity = Validity::Invalidating;
        Ok(())
    }

    /// Complete invalidation; every later use fails.
    pub(crate) fn finish_invalidation(&self) {
        self.state.lock().validity = Validity::Invalid;
    }

    /// Begin and finish invalidation in one step.
    #[cfg(test)]
    pub(crate) fn mark_invalidated(&self) -> Result<()> {
        self.begin_invalidation()?;
        self.finish_invalidation();
        Ok(())
    }

    /// Invalidation began but its store delete has not succeeded yet.
    pub(crate) fn invalidation_pending(&self) -> bool {
        self.state.lock().validity == Validity::Invalidating
    }

    /// Valid and without active requests, so it may leave memory.
    pub(crate) fn is_evictable(&self) -> bool {
        let state = self.state.lock();
        state.requests == 0 && state.validity == Validity::Valid
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().requests == 0
    }

    /// Serialize store round trips for this session.
    pub(crate) async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }
}
