//! Remote key-value session stores.
//!
//! One key per session, `{namespace}:session:{id}`, holding a JSON
//! snapshot with a TTL equal to the session's max-inactive interval. The
//! TTL is refreshed on every write, so an abandoned session disappears
//! from the backend on its own.
//!
//! The same [`RemoteStore`] serves every remote topology:
//! - single node: one shard, no replicas;
//! - master-replica: one shard whose replicas may serve reads;
//! - clustered: keys spread over several shards by CRC16 hash slot.
//!
//! Writes always go to a shard's primary. Reads follow the configured
//! [`ReadPreference`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{PoolConfig, ReadPreference};
use crate::error::{Error, Result};
use crate::session::Snapshot;
use crate::store::kv::KvConnector;
use crate::store::pool::Pool;
use crate::store::SessionDataStore;

/// Number of hash slots keys are spread over in a clustered store.
pub const HASH_SLOTS: u16 = 16384;

/// Topology of a remote store, reported as the store name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    SingleNode,
    MasterReplica,
    Clustered,
}

impl Topology {
    fn name(self) -> &'static str {
        match self {
            Topology::SingleNode => "single_node_remote",
            Topology::MasterReplica => "master_replica_remote",
            Topology::Clustered => "clustered_remote",
        }
    }
}

/// Connectors for one shard: a primary and its replicas.
pub struct ShardConnectors<C> {
    pub primary: C,
    pub replicas: Vec<C>,
}

struct Shard<C: KvConnector> {
    primary: Pool<C>,
    replicas: Vec<Pool<C>>,
}

/// Session store backed by one or more remote key-value nodes.
pub struct RemoteStore<C: KvConnector> {
    topology: Topology,
    shards: Vec<Shard<C>>,
    namespace: String,
    read_preference: ReadPreference,
    next_replica: AtomicUsize,
}

impl<C: KvConnector> RemoteStore<C> {
    /// A store on a single node.
    pub fn single_node(connector: C, namespace: &str, pool: &PoolConfig) -> Self {
        Self::build(
            Topology::SingleNode,
            vec![ShardConnectors {
                primary: connector,
                replicas: Vec::new(),
            }],
            namespace,
            ReadPreference::Primary,
            pool,
        )
    }

    /// A store on one primary with read replicas.
    pub fn master_replica(
        shard: ShardConnectors<C>,
        namespace: &str,
        read_preference: ReadPreference,
        pool: &PoolConfig,
    ) -> Self {
        Self::build(Topology::MasterReplica, vec![shard], namespace, read_preference, pool)
    }

    /// A store sharded by hash slot across `shards`.
    pub fn clustered(
        shards: Vec<ShardConnectors<C>>,
        namespace: &str,
        read_preference: ReadPreference,
        pool: &PoolConfig,
    ) -> Result<Self> {
        if shards.is_empty() || shards.len() > HASH_SLOTS as usize {
            return Err(Error::Config(format!(
                "clustered store needs between 1 and {HASH_SLOTS} shards, got {}",
                shards.len()
            )));
        }
        Ok(Self::build(Topology::Clustered, shards, namespace, read_preference, pool))
    }

    fn build(
        topology: Topology,
        shards: Vec<ShardConnectors<C>>,
        namespace: &str,
        read_preference: ReadPreference,
        pool: &PoolConfig,
    ) -> Self {
        let shards = shards
            .into_iter()
            .map(|shard| Shard {
                primary: Pool::new(shard.primary, pool),
                replicas: shard
                    .replicas
                    .into_iter()
                    .map(|replica| Pool::new(replica, pool))
                    .collect(),
            })
            .collect();
        Self {
            topology,
            shards,
            namespace: namespace.to_string(),
            read_preference,
            next_replica: AtomicUsize::new(0),
        }
    }

    /// Backend key for a session id.
    pub fn key(&self, id: &str) -> String {
        format!("{}:session:{}", self.namespace, id)
    }

    fn shard_for(&self, key: &str) -> &Shard<C> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let slot = hash_slot(key) as usize;
        let per_shard = (HASH_SLOTS as usize).div_ceil(self.shards.len());
        &self.shards[(slot / per_shard).min(self.shards.len() - 1)]
    }

    /// Pools to try for a read, in order.
    fn read_pools<'a>(&self, shard: &'a Shard<C>) -> Vec<&'a Pool<C>> {
        match self.read_preference {
            ReadPreference::PreferReplica if !shard.replicas.is_empty() => {
                let start = self.next_replica.fetch_add(1, Ordering::Relaxed);
                vec![&shard.replicas[start % shard.replicas.len()], &shard.primary]
            }
            _ => vec![&shard.primary],
        }
    }

    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut last_err = None;
        for pool in self.read_pools(self.shard_for(key)) {
            let result = async { pool.get().await?.get(key).await }.await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(endpoint = %pool.endpoint(), error = %e, "Store read failed, trying next node");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::StoreUnavailable("no readable node".into())))
    }

    async fn read_exists(&self, key: &str) -> Result<bool> {
        let mut last_err = None;
        for pool in self.read_pools(self.shard_for(key)) {
            let result = async { pool.get().await?.exists(key).await }.await;
            match result {
                Ok(found) => return Ok(found),
                Err(e) if e.is_transient() => {
                    warn!(endpoint = %pool.endpoint(), error = %e, "Store read failed, trying next node");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::StoreUnavailable("no readable node".into())))
    }

    fn decode(id: &str, bytes: &[u8]) -> Result<Snapshot> {
        let snapshot: Snapshot = serde_json::from_slice(bytes).map_err(|e| Error::CorruptData {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if snapshot.id != id {
            return Err(Error::CorruptData {
                id: id.to_string(),
                reason: format!("stored under {id} but holds {}", snapshot.id),
            });
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl<C: KvConnector> SessionDataStore for RemoteStore<C> {
    fn name(&self) -> &'static str {
        self.topology.name()
    }

    async fn load(&self, id: &str) -> Result<Option<Snapshot>> {
        let key = self.key(id);
        match self.read_bytes(&key).await? {
            Some(bytes) => Self::decode(id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, id: &str, snapshot: &Snapshot) -> Result<()> {
        let key = self.key(id);
        let bytes = serde_json::to_vec(snapshot)?;
        let ttl = (snapshot.max_inactive_secs > 0).then_some(snapshot.max_inactive_secs as u64);
        let mut conn = self.shard_for(&key).primary.get().await?;
        conn.set(&key, &bytes, ttl).await?;
        debug!(session_id = %id, ttl_secs = ?ttl, "Stored session snapshot");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let key = self.key(id);
        let mut conn = self.shard_for(&key).primary.get().await?;
        conn.del(&key).await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        // The TTL removes a key once its session has expired.
        self.read_exists(&self.key(id)).await
    }

    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let mut expired = HashSet::new();
        for id in candidates {
            match self.read_bytes(&self.key(id)).await {
                // Gone: reaped by TTL, or never saved. The caller re-checks.
                Ok(None) => {
                    expired.insert(id.clone());
                }
                Ok(Some(bytes)) => match Self::decode(id, &bytes) {
                    Ok(snapshot) if snapshot.expiry().is_some_and(|at| at <= now) => {
                        expired.insert(id.clone());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable snapshot"),
                },
                Err(e) => warn!(session_id = %id, error = %e, "Expiry check failed"),
            }
        }
        Ok(expired)
    }

    async fn close(&self) {
        for shard in &self.shards {
            shard.primary.close();
            for replica in &shard.replicas {
                replica.close();
            }
        }
    }
}

/// Hash slot of `key`: CRC16 (XMODEM) modulo 16384.
///
/// As in Redis Cluster, when the key contains a non-empty `{...}` section
/// only that section is hashed, so related keys can be pinned together.
pub fn hash_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };
    crc16(hashed) % HASH_SLOTS
}

fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
