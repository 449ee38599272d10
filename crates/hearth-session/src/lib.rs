//! Server-side session management with pluggable persistence.
//!
//! This crate provides:
//! - A reference-counted in-memory session table with LRU capacity and
//!   idle eviction
//! - Persistence through a [`SessionDataStore`]: local files, a single
//!   remote node, or a sharded/replicated remote deployment
//! - A background scavenger that destroys expired sessions
//! - Lifecycle listeners for session creation and destruction
//!
//! # Example
//!
//! ```rust,ignore
//! use hearth_session::{SessionManager, SessionManagerConfig};
//!
//! let manager = SessionManager::initialize(SessionManagerConfig::default()).await?;
//! let mut agent = manager.new_session_agent();
//! let id = agent.create().await?;
//! agent.set_attribute("user", serde_json::json!("ada"))?;
//! agent.complete().await?;
//!
//! manager.destroy().await;
//! ```

mod cache;
mod config;
mod error;
mod id;
mod listener;
mod manager;
mod scavenger;
mod session;
pub mod store;

pub use cache::{CacheStats, SessionCache};
pub use config::{
    DEFAULT_MAX_INACTIVE_SECS, DEFAULT_MAX_SESSIONS, DEFAULT_NAMESPACE,
    DEFAULT_SCAVENGE_INTERVAL_SECS, EvictionPolicy, FileStoreConfig, PoolConfig, ReadPreference,
    RemoteStoreConfig, ReplicatedStoreConfig, SavePolicy, SessionManagerConfig, ShardConfig,
    StoreConfig, default_store_dir,
};
pub use error::{Error, Result};
pub use id::{NODE_DELIMITER, SessionIdGenerator, cluster_id_of, node_suffix_of};
pub use listener::{ListenerError, Listeners, SessionEvent, SessionListener};
pub use manager::{SessionAgent, SessionManager};
pub use scavenger::{ScavengeReport, Scavenger};
pub use session::{Completion, Session, Snapshot, compute_expiry, now_millis};
pub use store::{SessionDataStore, open_store};
