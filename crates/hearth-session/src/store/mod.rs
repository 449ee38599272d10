//! Persistence for sessions that are not (or not only) held in memory.
//!
//! [`SessionDataStore`] is the capability the cache needs from a backend.
//! Every operation may block on I/O and may fail with
//! `StoreUnavailable` or `Timeout`; none of them retries silently.
//! [`open_store`] picks the backend from configuration.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ReplicatedStoreConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::session::Snapshot;

pub mod file;
pub mod kv;
pub mod pool;
pub mod remote;

pub use file::FileStore;
pub use kv::{KvConnection, KvConnector, MemoryConnection, MemoryConnector, RedisConnector};
pub use pool::{Pool, PooledConnection};
pub use remote::{RemoteStore, ShardConnectors, Topology, hash_slot};

/// Storage backend for session snapshots.
#[async_trait]
pub trait SessionDataStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Fetch the snapshot stored for `id`, `None` if there is none.
    async fn load(&self, id: &str) -> Result<Option<Snapshot>>;

    /// Insert or replace the snapshot for `id`.
    async fn store(&self, id: &str, snapshot: &Snapshot) -> Result<()>;

    /// Remove the snapshot for `id`. Returns whether one existed; a
    /// missing id is not an error.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Whether a live (stored and unexpired) snapshot exists for `id`.
    /// Cheaper than [`load`](Self::load); used to vet caller-presented ids.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Ids whose persisted expiry is at or before `now`.
    ///
    /// Answers for `candidates` and may add ids the store alone knows to
    /// be expired. False positives are allowed; callers re-check before
    /// destroying anything.
    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>>;

    /// Release connections held by the store.
    async fn close(&self) {}
}

/// Build the store selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn SessionDataStore>> {
    let store: Arc<dyn SessionDataStore> = match config {
        StoreConfig::File(file) => Arc::new(FileStore::open(file.clone()).await?),
        StoreConfig::SingleNodeRemote(remote) => Arc::new(RemoteStore::single_node(
            RedisConnector::new(&remote.endpoint)?,
            &remote.namespace,
            &remote.pool,
        )),
        StoreConfig::MasterReplicaRemote(replicated) => {
            let mut shards = redis_shards(replicated)?;
            let shard = shards.pop().ok_or_else(|| {
                Error::Config("master_replica_remote requires a primary".into())
            })?;
            Arc::new(RemoteStore::master_replica(
                shard,
                &replicated.namespace,
                replicated.read_preference,
                &replicated.pool,
            ))
        }
        StoreConfig::ClusteredRemote(replicated) => Arc::new(RemoteStore::clustered(
            redis_shards(replicated)?,
            &replicated.namespace,
            replicated.read_preference,
            &replicated.pool,
        )?),
    };
    info!(store = store.name(), "Session store ready");
    Ok(store)
}

fn redis_shards(config: &ReplicatedStoreConfig) -> Result<Vec<ShardConnectors<RedisConnector>>> {
    config
        .shards
        .iter()
        .map(|shard| {
            Ok(ShardConnectors {
                primary: RedisConnector::new(&shard.primary)?,
                replicas: shard
                    .replicas
                    .iter()
                    .map(|url| RedisConnector::new(url))
                    .collect::<Result<Vec<_>>>()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileStoreConfig, RemoteStoreConfig, ShardConfig};

    #[tokio::test]
    async fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&StoreConfig::File(FileStoreConfig {
            path: dir.path().join("sessions"),
            delete_unrestorable_files: false,
        }))
        .await
        .unwrap();
        assert_eq!(store.name(), "file");
        assert!(dir.path().join("sessions").is_dir());
    }

    #[tokio::test]
    async fn test_open_remote_stores_without_connecting() {
        let single = open_store(&StoreConfig::SingleNodeRemote(RemoteStoreConfig::default()))
            .await
            .unwrap();
        assert_eq!(single.name(), "single_node_remote");

        let replicated = ReplicatedStoreConfig {
            shards: vec![ShardConfig {
                primary: "redis://primary:6379".into(),
                replicas: vec!["redis://replica:6379".into()],
            }],
            ..Default::default()
        };
        let master_replica = open_store(&StoreConfig::MasterReplicaRemote(replicated.clone()))
            .await
            .unwrap();
        assert_eq!(master_replica.name(), "master_replica_remote");

        let clustered = open_store(&StoreConfig::ClusteredRemote(replicated))
            .await
            .unwrap();
        assert_eq!(clustered.name(), "clustered_remote");
    }

    #[tokio::test]
    async fn test_open_rejects_bad_endpoint() {
        let config = StoreConfig::SingleNodeRemote(RemoteStoreConfig {
            endpoint: "nonsense".into(),
            ..Default::default()
        });
        assert!(open_store(&config).await.is_err());
    }
}
