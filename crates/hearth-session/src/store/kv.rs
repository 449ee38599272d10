//! Key-value connection seam for remote session stores.
//!
//! Remote stores only need four commands from a backend: GET, SET with an
//! optional TTL, DEL and EXISTS. [`KvConnector`] opens connections that
//! speak those commands. [`RedisConnector`] talks to a Redis-compatible
//! server; [`MemoryConnector`] is an in-process backend with the same TTL
//! semantics, used for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Opens connections to one backend node.
#[async_trait]
pub trait KvConnector: Send + Sync + 'static {
    /// Connection type handed out by this connector.
    type Conn: KvConnection;

    /// Human-readable address, used in logs and errors.
    fn endpoint(&self) -> &str;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Conn>;
}

/// A single connection to a key-value node.
#[async_trait]
pub trait KvConnection: Send + 'static {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Upsert `key`. With a TTL the key disappears after `ttl_secs` seconds.
    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()>;

    /// Remove `key`, returning whether it existed.
    async fn del(&mut self, key: &str) -> Result<bool>;

    async fn exists(&mut self, key: &str) -> Result<bool>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis
// ─────────────────────────────────────────────────────────────────────────────

/// Connector for a Redis-compatible server.
pub struct RedisConnector {
    client: redis::Client,
    endpoint: String,
}

impl RedisConnector {
    /// Parse `url` (e.g. `redis://127.0.0.1:6379/0`). No connection is made yet.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid store endpoint '{url}': {e}")))?;
        Ok(Self {
            client,
            endpoint: url.to_string(),
        })
    }
}

#[async_trait]
impl KvConnector for RedisConnector {
    type Conn = redis::aio::MultiplexedConnection;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Self::Conn> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl KvConnection for redis::aio::MultiplexedConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(redis::cmd("GET").arg(key).query_async(self).await?)
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        let _: () = cmd.query_async(self).await?;
        Ok(())
    }

    async fn del(&mut self, key: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(self).await?;
        Ok(removed > 0)
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(redis::cmd("EXISTS").arg(key).query_async(self).await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug)]
struct MemoryNode {
    endpoint: String,
    entries: Mutex<HashMap<String, MemoryEntry>>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    commands: AtomicUsize,
}

impl MemoryNode {
    /// Copy of the entry under `key` if still live; an expired one is dropped.
    fn live_entry(&self, key: &str, now: Instant) -> Option<MemoryEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

/// In-process key-value node.
///
/// Clones share the same data. Outages and latency can be simulated with
/// [`set_available`](Self::set_available) and [`set_latency`](Self::set_latency).
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    node: Arc<MemoryNode>,
}

impl MemoryConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            node: Arc::new(MemoryNode {
                endpoint: endpoint.into(),
                entries: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                latency: Mutex::new(None),
                connects: AtomicUsize::new(0),
                commands: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the node reachable or not. While unavailable every connect
    /// and command fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.node.available.store(available, Ordering::SeqCst);
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.node.latency.lock() = latency;
    }

    /// Copy `source`'s live data into this node, as a replica sync would.
    pub fn replicate_from(&self, source: &MemoryConnector) {
        let now = Instant::now();
        let copied: HashMap<String, MemoryEntry> = source
            .node
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        *self.node.entries.lock() = copied;
    }

    /// Remaining TTL of `key`, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.node
            .entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Live keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.node
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Overwrite a raw value, bypassing encoding.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        self.node.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
    }

    /// Entries held, expired ones not yet pruned included.
    #[cfg(test)]
    fn stored_entries(&self) -> usize {
        self.node.entries.lock().len()
    }

    /// Connections opened so far.
    pub fn connects(&self) -> usize {
        self.node.connects.load(Ordering::SeqCst)
    }

    /// Commands executed so far.
    pub fn commands(&self) -> usize {
        self.node.commands.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new("memory://local")
    }
}

#[async_trait]
impl KvConnector for MemoryConnector {
    type Conn = MemoryConnection;

    fn endpoint(&self) -> &str {
        &self.node.endpoint
    }

    async fn connect(&self) -> Result<MemoryConnection> {
        check_available(&self.node)?;
        self.node.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            node: Arc::clone(&self.node),
        })
    }
}

fn check_available(node: &MemoryNode) -> Result<()> {
    if node.available.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::StoreUnavailable(format!("{} is unreachable", node.endpoint)))
    }
}

/// Connection to a [`MemoryConnector`] node.
#[derive(Debug)]
pub struct MemoryConnection {
    node: Arc<MemoryNode>,
}

impl MemoryConnection {
    async fn begin(&self) -> Result<()> {
        let latency = *self.node.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        check_available(&self.node)?;
        self.node.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.begin().await?;
        Ok(self.node.live_entry(key, Instant::now()).map(|entry| entry.value))
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        self.begin().await?;
        let now = Instant::now();
        let expires_at = ttl_secs.map(|secs| now + Duration::from_secs(secs));
        let mut entries = self.node.entries.lock();
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&mut self, key: &str) -> Result<bool> {
        self.begin().await?;
        let now = Instant::now();
        Ok(self
            .node
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.begin().await?;
        Ok(self.node.live_entry(key, Instant::now()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_del() {
        let node = MemoryConnector::default();
        let mut conn = node.connect().await.unwrap();

        conn.set("k", b"v", None).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(conn.exists("k").await.unwrap());

        assert!(conn.del("k").await.unwrap());
        assert!(!conn.del("k").await.unwrap());
        assert_eq!(conn.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_ttl() {
        let node = MemoryConnector::default();
        let mut conn = node.connect().await.unwrap();

        conn.set("k", b"v", Some(60)).await.unwrap();
        let ttl = node.ttl("k").unwrap();
        assert!(ttl <= Duration::from_secs(60) && ttl > Duration::from_secs(58));

        conn.set("k", b"v", None).await.unwrap();
        assert_eq!(node.ttl("k"), None);
    }

    #[tokio::test]
    async fn test_memory_prunes_expired_entries() {
        let node = MemoryConnector::default();
        let mut conn = node.connect().await.unwrap();
        conn.set("a", b"v", Some(1)).await.unwrap();
        conn.set("b", b"v", Some(1)).await.unwrap();
        assert_eq!(node.stored_entries(), 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(conn.get("a").await.unwrap(), None);
        assert_eq!(node.stored_entries(), 1);

        conn.set("c", b"v", None).await.unwrap();
        assert_eq!(node.stored_entries(), 1);
        assert_eq!(node.keys(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_outage() {
        let node = MemoryConnector::default();
        let mut conn = node.connect().await.unwrap();

        node.set_available(false);
        assert!(matches!(conn.get("k").await, Err(Error::StoreUnavailable(_))));
        assert!(node.connect().await.is_err());

        node.set_available(true);
        assert_eq!(conn.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replicate_from() {
        let primary = MemoryConnector::new("memory://primary");
        let replica = MemoryConnector::new("memory://replica");
        primary.put_raw("k", b"v");

        replica.replicate_from(&primary);
        assert_eq!(replica.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn test_redis_connector_rejects_bad_url() {
        assert!(matches!(RedisConnector::new("not a url"), Err(Error::Config(_))));
        assert!(RedisConnector::new("redis://127.0.0.1:6379").is_ok());
    }
}
