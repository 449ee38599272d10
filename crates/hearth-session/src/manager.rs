//! The session manager façade and per-request session handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::SessionCache;
use crate::config::SessionManagerConfig;
use crate::error::{Error, Result};
use crate::id::SessionIdGenerator;
use crate::listener::{Listeners, SessionEvent, SessionListener};
use crate::scavenger::{ScavengeReport, Scavenger};
use crate::session::{Session, now_millis};
use crate::store::{SessionDataStore, open_store};

/// Owns the id generator, cache, store and scavenger for one deployment.
///
/// Create one with [`initialize`](Self::initialize) and share the returned
/// `Arc` with every caller; each request works through its own
/// [`SessionAgent`].
pub struct SessionManager {
    config: SessionManagerConfig,
    ids: SessionIdGenerator,
    listeners: Arc<Listeners>,
    cache: Arc<SessionCache>,
    scavenger: Arc<Scavenger>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Validate `config`, open its store and start the scavenger.
    pub async fn initialize(config: SessionManagerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = open_store(&config.store).await?;
        Self::with_store(config, store)
    }

    /// Build a manager over an already-open store, ignoring `config.store`.
    ///
    /// Must be called within a Tokio runtime when the scavenge interval is
    /// non-zero.
    pub fn with_store(
        config: SessionManagerConfig,
        store: Arc<dyn SessionDataStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let listeners = Arc::new(Listeners::new());
        let cache = Arc::new(SessionCache::new(
            store,
            Arc::clone(&listeners),
            config.eviction,
            config.save.clone(),
            config.max_sessions,
        ));
        let scavenger = Arc::new(Scavenger::new(Arc::clone(&cache), config.idle_eviction_secs));
        if let Some(interval) = config.scavenge_interval() {
            scavenger.start(interval);
        }

        info!(
            store = cache.store().name(),
            timeout_secs = config.default_max_inactive_secs,
            eviction = ?config.eviction,
            "Session manager initialized"
        );
        Ok(Arc::new(Self {
            ids: SessionIdGenerator::new(config.node_id.clone()),
            config,
            listeners,
            cache,
            scavenger,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn id_generator(&self) -> &SessionIdGenerator {
        &self.ids
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a lifecycle listener. Listeners fire in registration order.
    pub fn add_listener(&self, listener: impl SessionListener + 'static) {
        self.listeners.add(Arc::new(listener));
    }

    /// A handle with no session bound yet.
    pub fn new_session_agent(self: &Arc<Self>) -> SessionAgent {
        SessionAgent {
            manager: Arc::clone(self),
            session: None,
        }
    }

    /// Run one scavenge pass immediately.
    pub async fn scavenge_now(&self) -> ScavengeReport {
        self.scavenger.scavenge(now_millis()).await
    }

    /// Stop the scavenger, flush the cache and close the store.
    ///
    /// The scavenger is stopped first so it can't race the final saves.
    /// Calling it twice is a no-op.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scavenger.stop().await;
        let saved = self.cache.flush_and_close().await;
        self.cache.store().close().await;
        info!(saved, "Session manager destroyed");
    }

    /// Mint an id unused in memory and in the store. An unreachable store
    /// doesn't block creation; the id is taken as free.
    async fn fresh_id(&self) -> Result<String> {
        loop {
            let id = self.ids.generate();
            if self.cache.contains(&id) {
                debug!(session_id = %id, "Generated session id already in use");
                continue;
            }
            match self.cache.store().exists(&id).await {
                Ok(false) => return Ok(id),
                Ok(true) => debug!(session_id = %id, "Generated session id already in use"),
                Err(e) if e.is_transient() => {
                    warn!(session_id = %id, error = %e, "Store unreachable while checking new session id");
                    return Ok(id);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionAgent
// ─────────────────────────────────────────────────────────────────────────────

/// A caller's handle on at most one session.
///
/// Binding a session (via [`create`](Self::create) or
/// [`access`](Self::access)) begins a request on it; [`complete`](Self::complete)
/// ends it. A handle dropped while bound releases its session in the
/// background.
pub struct SessionAgent {
    manager: Arc<SessionManager>,
    session: Option<Arc<Session>>,
}

impl SessionAgent {
    fn bound(&self) -> Result<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no session bound to this agent".into()))
    }

    /// Release the current session, if any, before binding another.
    async fn unbind(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => self.manager.cache.release(&session).await,
            None => Ok(()),
        }
    }

    /// Create a new session and bind it. Returns its id.
    ///
    /// Created listeners have run by the time this returns.
    pub async fn create(&mut self) -> Result<String> {
        if self.manager.is_closed() {
            return Err(Error::Closed);
        }
        self.unbind().await?;

        let id = self.manager.fresh_id().await?;
        let now = now_millis();
        let session = Arc::new(Session::new(
            id.clone(),
            now,
            self.manager.config.default_max_inactive_secs,
        ));
        session.access(now)?;
        self.manager.cache.add(Arc::clone(&session)).await?;
        self.manager.listeners.fire(SessionEvent::Created(&session));

        debug!(session_id = %id, "Session created");
        self.session = Some(session);
        Ok(id)
    }

    /// Bind the session presented as `id`.
    ///
    /// Returns `false` for unknown, expired or invalidated ids; store
    /// failures are returned as errors.
    pub async fn access(&mut self, id: &str) -> Result<bool> {
        self.unbind().await?;
        match self.manager.cache.get(id).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(session_id = %id, error = %e, "Presented session id not usable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.session.is_some()
    }

    /// Id of the bound session.
    pub fn id(&self) -> Option<String> {
        self.session.as_ref().map(|session| session.id())
    }

    pub fn creation_time(&self) -> Result<i64> {
        Ok(self.bound()?.created_at())
    }

    pub fn last_accessed_time(&self) -> Result<i64> {
        Ok(self.bound()?.last_accessed())
    }

    pub fn max_inactive_interval(&self) -> Result<i64> {
        Ok(self.bound()?.max_inactive_secs())
    }

    pub fn set_max_inactive_interval(&self, secs: i64) -> Result<()> {
        self.bound()?.set_max_inactive_secs(secs)
    }

    pub fn get_attribute(&self, name: &str) -> Result<Option<Value>> {
        self.bound()?.attribute(name)
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Result<Option<Value>> {
        self.bound()?.set_attribute(name, value)
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>> {
        self.bound()?.remove_attribute(name)
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        self.bound()?.attribute_names()
    }

    /// Destroy the bound session and unbind it.
    pub async fn invalidate(&mut self) -> Result<()> {
        let id = self.bound()?.id();
        let result = self.manager.cache.invalidate(&id).await;
        if let Err(e) = self.unbind().await {
            warn!(session_id = %id, error = %e, "Release after invalidation failed");
        }
        result
    }

    /// Move the bound session to a fresh id, keeping its node suffix.
    /// Returns the new id.
    pub async fn renew_id(&mut self) -> Result<String> {
        let old_id = self.bound()?.id();
        let new_id = self.manager.ids.renew(&old_id);
        self.manager.cache.renew_session_id(&old_id, &new_id).await?;
        Ok(new_id)
    }

    /// End the request on the bound session, saving it per the save policy.
    pub async fn complete(&mut self) -> Result<()> {
        self.unbind().await
    }
}

impl Drop for SessionAgent {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = Arc::clone(&self.manager.cache);
                handle.spawn(async move {
                    if let Err(e) = cache.release(&session).await {
                        warn!(session_id = %session.id(), error = %e, "Release of dropped session agent failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to save on; at least balance the request count.
                session.complete();
                warn!(session_id = %session.id(), "Session agent dropped outside a runtime; changes not saved");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, PoolConfig};
    use crate::listener::ListenerError;
    use crate::store::{MemoryConnector, RemoteStore};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager(config: SessionManagerConfig) -> (Arc<SessionManager>, MemoryConnector) {
        let node = MemoryConnector::default();
        let store = Arc::new(RemoteStore::single_node(node.clone(), "test", &PoolConfig::default()));
        (SessionManager::with_store(config, store).unwrap(), node)
    }

    fn quiet() -> SessionManagerConfig {
        SessionManagerConfig::new().with_scavenge_interval(0)
    }

    #[tokio::test]
    async fn test_create_while_store_unreachable() {
        let (manager, node) = manager(quiet());
        node.set_available(false);

        let mut agent = manager.new_session_agent();
        let id = agent.create().await.unwrap();
        agent.set_attribute("user", json!("ada")).unwrap();
        assert!(manager.cache().contains(&id));
        assert!(agent.complete().await.unwrap_err().is_transient());

        node.set_available(true);
        assert!(agent.access(&id).await.unwrap());
        assert_eq!(agent.get_attribute("user").unwrap(), Some(json!("ada")));
        agent.complete().await.unwrap();
        assert!(manager.cache().store().exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_access_and_attributes() {
        let (manager, _) = manager(quiet().with_node_id("n1"));
        let mut agent = manager.new_session_agent();
        let id = agent.create().await.unwrap();
        assert!(id.ends_with(".n1"));
        assert_eq!(agent.max_inactive_interval().unwrap(), 1800);

        agent.set_attribute("user", json!("ada")).unwrap();
        agent.complete().await.unwrap();
        assert!(!agent.is_bound());

        let mut other = manager.new_session_agent();
        assert!(other.access(&id).await.unwrap());
        assert_eq!(other.get_attribute("user").unwrap(), Some(json!("ada")));
        assert_eq!(other.attribute_names().unwrap(), vec!["user".to_string()]);
        other.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_access_unknown_id() {
        let (manager, _) = manager(quiet());
        let mut agent = manager.new_session_agent();
        assert!(!agent.access("missing").await.unwrap());
        assert!(matches!(agent.get_attribute("x"), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_listeners_fire_once() {
        let (manager, _) = manager(quiet());
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (c, d) = (Arc::clone(&created), Arc::clone(&destroyed));
        manager.add_listener(move |event: SessionEvent<'_>| -> std::result::Result<(), ListenerError> {
            match event {
                SessionEvent::Created(_) => c.fetch_add(1, Ordering::SeqCst),
                SessionEvent::Destroyed(session) => {
                    // Attributes are still readable while destroy listeners run.
                    assert_eq!(session.attribute("k")?, Some(json!("v")));
                    d.fetch_add(1, Ordering::SeqCst)
                }
            };
            Ok(())
        });

        let mut agent = manager.new_session_agent();
        let id = agent.create().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        agent.set_attribute("k", json!("v")).unwrap();
        agent.invalidate().await.unwrap();
        assert!(!agent.is_bound());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        assert!(!agent.access(&id).await.unwrap());
        assert!(!manager.cache().contains(&id));
    }

    #[tokio::test]
    async fn test_renew_id_keeps_attributes() {
        let (manager, _) = manager(quiet().with_node_id("n1"));
        let mut agent = manager.new_session_agent();
        let old_id = agent.create().await.unwrap();
        agent.set_attribute("cart", json!([1, 2])).unwrap();

        let new_id = agent.renew_id().await.unwrap();
        assert_ne!(old_id, new_id);
        assert!(new_id.ends_with(".n1"));
        assert_eq!(agent.id(), Some(new_id.clone()));
        agent.complete().await.unwrap();

        let mut other = manager.new_session_agent();
        assert!(!other.access(&old_id).await.unwrap());
        assert!(other.access(&new_id).await.unwrap());
        assert_eq!(other.get_attribute("cart").unwrap(), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_dropped_agent_releases_session() {
        let (manager, _) = manager(quiet());
        let mut agent = manager.new_session_agent();
        let id = agent.create().await.unwrap();
        drop(agent);

        for _ in 0..50 {
            if manager.cache().stats().in_use == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(manager.cache().stats().in_use, 0);
        assert!(manager.cache().contains(&id));
    }

    #[tokio::test]
    async fn test_destroy_flushes_and_closes() {
        let config = quiet().with_save_policy(crate::config::SavePolicy {
            save_on_create: false,
            save_on_release: false,
            ..Default::default()
        });
        let (manager, node) = manager(config.with_eviction(EvictionPolicy::Never));
        let mut agent = manager.new_session_agent();
        agent.create().await.unwrap();
        agent.set_attribute("x", json!(1)).unwrap();
        agent.complete().await.unwrap();
        assert!(node.keys().is_empty());

        manager.destroy().await;
        assert_eq!(node.keys().len(), 1);
        assert!(manager.is_closed());
        assert!(matches!(manager.new_session_agent().create().await, Err(Error::Closed)));
        manager.destroy().await;
    }
}
