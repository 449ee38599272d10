//! Background reclamation of expired sessions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SessionCache;
use crate::config::EvictionPolicy;

/// Outcome of one scavenge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScavengeReport {
    /// Distinct ids considered (resident plus store-reported expired).
    pub candidates: usize,
    /// Sessions destroyed, including retried tombstone deletes.
    pub invalidated: usize,
    /// Idle sessions evicted from memory.
    pub evicted: usize,
    /// Candidates skipped after a store error.
    pub failures: usize,
}

impl ScavengeReport {
    pub fn has_failures(&self) -> bool {
        self.failures > 0
    }
}

impl fmt::Display for ScavengeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidates, {} invalidated, {} evicted, {} failed",
            self.candidates, self.invalidated, self.evicted, self.failures
        )
    }
}

/// Finds and destroys expired sessions, resident or not.
pub struct Scavenger {
    cache: Arc<SessionCache>,
    idle_eviction_secs: u64,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scavenger {
    pub fn new(cache: Arc<SessionCache>, idle_eviction_secs: u64) -> Self {
        Self {
            cache,
            idle_eviction_secs,
            running: Mutex::new(None),
        }
    }

    /// Run one pass as of `now` (epoch millis).
    ///
    /// A store error for one candidate is logged and counted; the rest of
    /// the pass continues and the candidate comes up again next tick.
    pub async fn scavenge(&self, now: i64) -> ScavengeReport {
        let mut report = ScavengeReport::default();

        let resident: HashSet<String> = self.cache.resident_ids().into_iter().collect();
        let mut candidates = resident.clone();
        match self.cache.store().get_expired(&resident, now).await {
            Ok(expired) => candidates.extend(expired),
            Err(e) => {
                warn!(error = %e, "Store expiry query failed; scavenging resident sessions only");
                report.failures += 1;
            }
        }
        report.candidates = candidates.len();

        for id in &candidates {
            match self.cache.reap(id, now).await {
                Ok(true) => report.invalidated += 1,
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to reap session; will retry");
                    report.failures += 1;
                }
            }
        }

        if self.cache.eviction() == EvictionPolicy::Idle && self.idle_eviction_secs > 0 {
            report.evicted = self.cache.evict_idle(now, self.idle_eviction_secs).await;
        }

        if report.invalidated > 0 || report.evicted > 0 || report.has_failures() {
            info!(report = %report, "Scavenge pass complete");
        } else {
            debug!(candidates = report.candidates, "Scavenge pass found nothing");
        }
        report
    }

    /// Start the background loop, one pass per `interval`. Calling it again
    /// while running is a no-op.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scavenger = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        scavenger.scavenge(crate::session::now_millis()).await;
                    }
                }
            }
            debug!("Scavenger stopped");
        });

        info!(interval_secs = interval.as_secs(), "Scavenger started");
        *running = Some(Running { cancel, handle });
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the loop and wait for an in-progress pass to finish.
    pub async fn stop(&self) {
        let Some(Running { cancel, handle }) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Scavenger task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileStoreConfig, PoolConfig, SavePolicy};
    use crate::listener::Listeners;
    use crate::session::{Session, now_millis};
    use crate::store::{FileStore, MemoryConnector, RemoteStore, SessionDataStore};

    fn cache(node: &MemoryConnector, eviction: EvictionPolicy) -> Arc<SessionCache> {
        let store = Arc::new(RemoteStore::single_node(node.clone(), "test", &PoolConfig::default()));
        let save = SavePolicy {
            save_on_create: false,
            ..SavePolicy::default()
        };
        Arc::new(SessionCache::new(store, Arc::new(Listeners::new()), eviction, save, 100))
    }

    async fn idle_session(cache: &SessionCache, id: &str, max_inactive_secs: i64) {
        let session = Arc::new(Session::new(id, now_millis(), max_inactive_secs));
        session.access(now_millis()).unwrap();
        cache.add(Arc::clone(&session)).await.unwrap();
        cache.release(&session).await.unwrap();
    }

    #[tokio::test]
    async fn test_scavenge_invalidates_expired_only() {
        let node = MemoryConnector::default();
        let cache = cache(&node, EvictionPolicy::Never);
        idle_session(&cache, "short", 1).await;
        idle_session(&cache, "long", 3600).await;

        let scavenger = Scavenger::new(Arc::clone(&cache), 0);
        let report = scavenger.scavenge(now_millis() + 2_000).await;

        assert_eq!(report.candidates, 2);
        assert_eq!(report.invalidated, 1);
        assert!(!cache.contains("short"));
        assert!(cache.contains("long"));
    }

    #[tokio::test]
    async fn test_scavenge_reaches_non_resident_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(FileStoreConfig {
            path: dir.path().to_path_buf(),
            delete_unrestorable_files: false,
        })
        .await
        .unwrap();
        let save = SavePolicy {
            save_on_create: false,
            ..SavePolicy::default()
        };
        let cache = Arc::new(SessionCache::new(
            Arc::new(store),
            Arc::new(Listeners::new()),
            EvictionPolicy::OnRelease,
            save,
            100,
        ));
        idle_session(&cache, "gone", 1).await;
        idle_session(&cache, "kept", 3600).await;
        assert!(cache.is_empty());

        let scavenger = Scavenger::new(Arc::clone(&cache), 0);
        let report = scavenger.scavenge(now_millis() + 2_000).await;
        assert_eq!(report.invalidated, 1);
        assert!(!cache.store().exists("gone").await.unwrap());
        assert!(cache.store().exists("kept").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_access_keeps_evicted_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(FileStoreConfig {
            path: dir.path().to_path_buf(),
            delete_unrestorable_files: false,
        })
        .await
        .unwrap();
        let save = SavePolicy {
            save_on_create: false,
            ..SavePolicy::default()
        };
        let cache = Arc::new(SessionCache::new(
            Arc::new(store),
            Arc::new(Listeners::new()),
            EvictionPolicy::OnRelease,
            save,
            100,
        ));
        idle_session(&cache, "s1", 1).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        let reader = cache.get("s1").await.unwrap();
        cache.release(&reader).await.unwrap();
        assert!(cache.is_empty());

        tokio::time::sleep(Duration::from_millis(700)).await;
        let scavenger = Scavenger::new(Arc::clone(&cache), 0);
        let report = scavenger.scavenge(now_millis()).await;
        assert_eq!(report.invalidated, 0);
        assert!(cache.store().exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_scavenge_survives_store_outage() {
        let node = MemoryConnector::default();
        let cache = cache(&node, EvictionPolicy::Never);
        idle_session(&cache, "a", 1).await;
        idle_session(&cache, "b", 1).await;
        node.set_available(false);

        let scavenger = Scavenger::new(Arc::clone(&cache), 0);
        let report = scavenger.scavenge(now_millis() + 2_000).await;
        assert!(report.has_failures());
        assert_eq!(report.invalidated, 0);

        node.set_available(true);
        let report = scavenger.scavenge(now_millis() + 2_000).await;
        assert_eq!(report.invalidated, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_scavenge_evicts_idle() {
        let node = MemoryConnector::default();
        let cache = cache(&node, EvictionPolicy::Idle);
        idle_session(&cache, "s1", 3600).await;

        let scavenger = Scavenger::new(Arc::clone(&cache), 60);
        let report = scavenger.scavenge(now_millis() + 120_000).await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.invalidated, 0);
        assert!(cache.store().exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let node = MemoryConnector::default();
        let cache = cache(&node, EvictionPolicy::Never);
        let scavenger = Arc::new(Scavenger::new(cache, 0));

        scavenger.start(Duration::from_millis(10));
        scavenger.start(Duration::from_millis(10));
        assert!(scavenger.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;

        scavenger.stop().await;
        assert!(!scavenger.is_running());
        scavenger.stop().await;
    }
}
