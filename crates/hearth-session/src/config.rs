//! Configuration for the session manager and its stores.
//!
//! Maps to a TOML document such as:
//!
//! ```toml
//! timeout = 1800                 # default max-inactive seconds
//! scavenge_interval_secs = 600
//! eviction = "on_release"        # never | on_release | idle
//! node_id = "node0"
//!
//! [save]
//! save_on_release = true
//!
//! [store]
//! type = "file"
//! path = "/var/lib/hearth/sessions"
//! delete_unrestorable_files = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default max-inactive interval for new sessions (30 minutes).
pub const DEFAULT_MAX_INACTIVE_SECS: i64 = 1800;

/// Default interval between scavenger passes (10 minutes).
pub const DEFAULT_SCAVENGE_INTERVAL_SECS: u64 = 600;

/// Default maximum number of sessions kept in memory.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Default key prefix for remote stores.
pub const DEFAULT_NAMESPACE: &str = "hearth";

// ─────────────────────────────────────────────────────────────────────────────
// Manager configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Max-inactive interval, in seconds, given to new sessions.
    /// Zero or negative means sessions never expire.
    #[serde(rename = "timeout")]
    pub default_max_inactive_secs: i64,

    /// Seconds between scavenger passes. Zero disables the background loop.
    pub scavenge_interval_secs: u64,

    /// When resident sessions are dropped from memory.
    pub eviction: EvictionPolicy,

    /// Idle time after which `EvictionPolicy::Idle` evicts a session.
    pub idle_eviction_secs: u64,

    /// Maximum number of sessions kept in memory before LRU eviction.
    pub max_sessions: usize,

    /// Node identifier appended to generated ids for load-balancer affinity.
    pub node_id: Option<String>,

    /// When sessions are written to the store.
    pub save: SavePolicy,

    /// Backing store selection.
    pub store: StoreConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            default_max_inactive_secs: DEFAULT_MAX_INACTIVE_SECS,
            scavenge_interval_secs: DEFAULT_SCAVENGE_INTERVAL_SECS,
            eviction: EvictionPolicy::default(),
            idle_eviction_secs: 0,
            max_sessions: DEFAULT_MAX_SESSIONS,
            node_id: None,
            save: SavePolicy::default(),
            store: StoreConfig::default(),
        }
    }
}

impl SessionManagerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".into()));
        }
        if self.eviction == EvictionPolicy::Idle && self.idle_eviction_secs == 0 {
            return Err(Error::Config(
                "eviction = \"idle\" requires idle_eviction_secs > 0".into(),
            ));
        }
        if let Some(node) = &self.node_id
            && (node.is_empty() || node.contains(crate::id::NODE_DELIMITER))
        {
            return Err(Error::Config(format!("invalid node_id '{node}'")));
        }
        self.store.validate()
    }

    /// Set the default max-inactive interval in seconds.
    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.default_max_inactive_secs = secs;
        self
    }

    /// Set the scavenge interval in seconds (0 disables the background loop).
    pub fn with_scavenge_interval(mut self, secs: u64) -> Self {
        self.scavenge_interval_secs = secs;
        self
    }

    /// Set the eviction policy.
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Evict sessions idle for `secs` seconds.
    pub fn with_idle_eviction(mut self, secs: u64) -> Self {
        self.eviction = EvictionPolicy::Idle;
        self.idle_eviction_secs = secs;
        self
    }

    /// Set the in-memory capacity.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the node id suffix for generated session ids.
    pub fn with_node_id(mut self, node: impl Into<String>) -> Self {
        self.node_id = Some(node.into());
        self
    }

    /// Set the save policy.
    pub fn with_save_policy(mut self, save: SavePolicy) -> Self {
        self.save = save;
        self
    }

    /// Set the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Scavenger period, or `None` when the background loop is disabled.
    pub fn scavenge_interval(&self) -> Option<Duration> {
        (self.scavenge_interval_secs > 0).then(|| Duration::from_secs(self.scavenge_interval_secs))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// When a resident session is removed from memory (its snapshot stays).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep sessions resident until invalidated or pushed out by capacity.
    #[default]
    Never,
    /// Evict as soon as the last request releases the session.
    OnRelease,
    /// Evict after `idle_eviction_secs` without access, checked by the scavenger.
    Idle,
}

/// When sessions are written to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavePolicy {
    /// Schedule a background save when a session is created.
    pub save_on_create: bool,

    /// Save when the last request releases a session whose stored copy is
    /// out of date: changed attributes, or a newer access than was written.
    pub save_on_release: bool,

    /// Also save clean sessions on release when the last save is older
    /// than this many seconds.
    pub save_interval_secs: Option<u64>,

    /// Save an out-of-date session before evicting it from memory.
    pub save_on_eviction: bool,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            save_on_create: true,
            save_on_release: true,
            save_interval_secs: None,
            save_on_eviction: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Backing store selection, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// One file per session under a directory.
    #[serde(alias = "FILE")]
    File(FileStoreConfig),

    /// A single remote key-value node.
    #[serde(alias = "SINGLE_NODE_REMOTE")]
    SingleNodeRemote(RemoteStoreConfig),

    /// Keys sharded across several primaries, each with optional replicas.
    #[serde(alias = "CLUSTERED_REMOTE")]
    ClusteredRemote(ReplicatedStoreConfig),

    /// One primary with read replicas.
    #[serde(alias = "MASTER_REPLICA_REMOTE")]
    MasterReplicaRemote(ReplicatedStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File(FileStoreConfig::default())
    }
}

impl StoreConfig {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::File(_) => "file",
            StoreConfig::SingleNodeRemote(_) => "single_node_remote",
            StoreConfig::ClusteredRemote(_) => "clustered_remote",
            StoreConfig::MasterReplicaRemote(_) => "master_replica_remote",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            StoreConfig::File(_) => Ok(()),
            StoreConfig::SingleNodeRemote(remote) => {
                if remote.endpoint.is_empty() {
                    return Err(Error::Config("single_node_remote requires an endpoint".into()));
                }
                remote.pool.validate()
            }
            StoreConfig::ClusteredRemote(replicated) => {
                if replicated.shards.is_empty() {
                    return Err(Error::Config("clustered_remote requires at least one shard".into()));
                }
                replicated.validate()
            }
            StoreConfig::MasterReplicaRemote(replicated) => {
                if replicated.shards.len() != 1 {
                    return Err(Error::Config(
                        "master_replica_remote requires exactly one primary".into(),
                    ));
                }
                replicated.validate()
            }
        }
    }
}

/// File store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory holding one file per session.
    pub path: PathBuf,

    /// Delete unparsable files and treat them as missing, instead of failing the load.
    pub delete_unrestorable_files: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_dir(),
            delete_unrestorable_files: false,
        }
    }
}

/// Default file store directory under the platform's local data dir.
pub fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hearth")
        .join("sessions")
}

/// Connection pool settings shared by remote stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections per endpoint.
    pub size: usize,

    /// How long to wait for a free connection before failing.
    pub borrow_timeout_ms: u64,

    /// Upper bound on a single store round trip.
    pub op_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            borrow_timeout_ms: 2_000,
            op_timeout_ms: 2_000,
        }
    }
}

impl PoolConfig {
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Config("pool size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Single-node remote store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub endpoint: String,

    /// Key prefix, one per deployment group.
    pub namespace: String,

    /// Connection pool settings.
    pub pool: PoolConfig,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            pool: PoolConfig::default(),
        }
    }
}

/// Which node serves reads in a replicated store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Always read from the primary (read-your-writes across nodes).
    #[default]
    Primary,
    /// Spread reads over replicas, falling back to the primary.
    PreferReplica,
}

/// One primary and its replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Primary URL; all writes go here.
    pub primary: String,

    /// Replica URLs.
    pub replicas: Vec<String>,
}

/// Replicated (clustered or master-replica) remote store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedStoreConfig {
    /// Shards; master-replica deployments have exactly one.
    pub shards: Vec<ShardConfig>,

    /// Key prefix, one per deployment group.
    pub namespace: String,

    /// Read routing.
    pub read_preference: ReadPreference,

    /// Connection pool settings, applied per node.
    pub pool: PoolConfig,
}

impl Default for ReplicatedStoreConfig {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            read_preference: ReadPreference::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ReplicatedStoreConfig {
    fn validate(&self) -> Result<()> {
        if let Some(shard) = self.shards.iter().find(|s| s.primary.is_empty()) {
            return Err(Error::Config(format!(
                "shard with replicas {:?} has no primary",
                shard.replicas
            )));
        }
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionManagerConfig::default();
        assert_eq!(config.default_max_inactive_secs, 1800);
        assert_eq!(config.eviction, EvictionPolicy::Never);
        assert!(config.save.save_on_release);
        assert!(matches!(config.store, StoreConfig::File(_)));
        assert_eq!(
            config.scavenge_interval(),
            Some(Duration::from_secs(DEFAULT_SCAVENGE_INTERVAL_SECS))
        );
    }

    #[test]
    fn test_parse_file_store() {
        let config = SessionManagerConfig::from_toml(
            r#"
timeout = 60
eviction = "on_release"

[store]
type = "file"
path = "/tmp/sessions"
delete_unrestorable_files = true
"#,
        )
        .unwrap();

        assert_eq!(config.default_max_inactive_secs, 60);
        assert_eq!(config.eviction, EvictionPolicy::OnRelease);
        match config.store {
            StoreConfig::File(file) => {
                assert_eq!(file.path, PathBuf::from("/tmp/sessions"));
                assert!(file.delete_unrestorable_files);
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn test_parse_uppercase_store_type() {
        let config = SessionManagerConfig::from_toml(
            r#"
[store]
type = "MASTER_REPLICA_REMOTE"
read_preference = "prefer_replica"

[[store.shards]]
primary = "redis://primary:6379"
replicas = ["redis://replica-a:6379", "redis://replica-b:6379"]

[store.pool]
size = 4
borrow_timeout_ms = 50
"#,
        )
        .unwrap();

        match config.store {
            StoreConfig::MasterReplicaRemote(replicated) => {
                assert_eq!(replicated.read_preference, ReadPreference::PreferReplica);
                assert_eq!(replicated.shards[0].replicas.len(), 2);
                assert_eq!(replicated.pool.size, 4);
                assert_eq!(replicated.pool.op_timeout_ms, 2_000);
                assert_eq!(replicated.namespace, DEFAULT_NAMESPACE);
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn test_master_replica_needs_one_primary() {
        let result = SessionManagerConfig::from_toml(
            r#"
[store]
type = "master_replica_remote"
"#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_idle_eviction_needs_duration() {
        let config = SessionManagerConfig::new().with_eviction(EvictionPolicy::Idle);
        assert!(config.validate().is_err());
        assert!(config.with_idle_eviction(30).validate().is_ok());
    }

    #[test]
    fn test_node_id_rejects_delimiter() {
        let config = SessionManagerConfig::new().with_node_id("a.b");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_preserves_store() {
        let config = SessionManagerConfig::new()
            .with_timeout(5)
            .with_store(StoreConfig::SingleNodeRemote(RemoteStoreConfig::default()));
        let text = config.to_toml().unwrap();
        let parsed = SessionManagerConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.default_max_inactive_secs, 5);
        assert_eq!(parsed.store.kind(), "single_node_remote");
    }

    #[test]
    fn test_disabled_scavenger() {
        let config = SessionManagerConfig::new().with_scavenge_interval(0);
        assert_eq!(config.scavenge_interval(), None);
    }
}
