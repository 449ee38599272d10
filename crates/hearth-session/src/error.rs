//! Error types for session management.

use std::time::Duration;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No session with this id exists in memory or in the store.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The id resolves, but the session's expiry has passed.
    #[error("Session expired: {0}")]
    Expired(String),

    /// The backing store is unreachable or its connection pool is exhausted.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store operation did not finish in time.
    #[error("Session store operation '{op}' timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// A persisted snapshot could not be parsed.
    #[error("Corrupt session data for {id}: {reason}")]
    CorruptData { id: String, reason: String },

    /// Operation on a session that has already been invalidated.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session manager has been shut down.
    #[error("Session manager is closed")]
    Closed,
}

impl Error {
    /// True for errors a caller should treat as "no such session".
    ///
    /// Expired sessions are reported separately for diagnostics but are
    /// indistinguishable from unknown ids to callers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Expired(_))
    }

    /// True for transient backend failures (unavailable or timed out).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout { .. })
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_counts_as_not_found() {
        assert!(Error::NotFound("a".into()).is_not_found());
        assert!(Error::Expired("a".into()).is_not_found());
        assert!(!Error::InvalidState("a".into()).is_not_found());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::StoreUnavailable("down".into()).is_transient());
        assert!(
            Error::Timeout {
                op: "load",
                after: Duration::from_millis(5)
            }
            .is_transient()
        );
        assert!(!Error::Closed.is_transient());
    }
}
