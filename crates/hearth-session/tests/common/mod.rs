//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use hearth_session::store::{MemoryConnector, RemoteStore};
use hearth_session::{
    Error, ListenerError, PoolConfig, Result, SessionDataStore, SessionEvent, SessionManager,
    SessionManagerConfig, Snapshot,
};

/// Store wrapper whose writes can be made to fail on demand.
pub struct FlakyStore {
    inner: Arc<dyn SessionDataStore>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn SessionDataStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Attempted writes, failed ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionDataStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn load(&self, id: &str) -> Result<Option<Snapshot>> {
        self.inner.load(id).await
    }

    async fn store(&self, id: &str, snapshot: &Snapshot) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("injected write failure".into()));
        }
        self.inner.store(id, snapshot).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.inner.exists(id).await
    }

    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        self.inner.get_expired(candidates, now).await
    }
}

/// Counts lifecycle events.
#[derive(Default)]
pub struct EventCounts {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl EventCounts {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Register a counting listener on `manager`.
pub fn count_events(manager: &SessionManager) -> Arc<EventCounts> {
    let counts = Arc::new(EventCounts::default());
    let sink = Arc::clone(&counts);
    manager.add_listener(move |event: SessionEvent<'_>| -> std::result::Result<(), ListenerError> {
        match event {
            SessionEvent::Created(_) => sink.created.fetch_add(1, Ordering::SeqCst),
            SessionEvent::Destroyed(_) => sink.destroyed.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    });
    counts
}

/// An in-process remote store and the node backing it.
pub fn memory_store() -> (Arc<dyn SessionDataStore>, MemoryConnector) {
    let node = MemoryConnector::default();
    let store = RemoteStore::single_node(node.clone(), "it", &PoolConfig::default());
    (Arc::new(store), node)
}

/// Config with the background scavenger off; tests drive passes by hand.
pub fn manual_config() -> SessionManagerConfig {
    SessionManagerConfig::new().with_scavenge_interval(0)
}
