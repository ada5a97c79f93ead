//! Error types for the sync core.
//!
//! Throttling is not represented here: a denied send is a plain `false`.

use shared::Identity;

/// A state change the core declined at the call boundary. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed identity {0}")]
    InvalidIdentity(Identity),

    #[error("invalid leaderboard name {0:?}")]
    InvalidLeaderboard(String),

    #[error("invalid entry name {0:?}")]
    InvalidEntry(String),

    #[error("pending queue for {identity} is full ({limit} updates)")]
    QueueFull { identity: Identity, limit: usize },

    #[error("{identity} already follows {limit} leaderboards")]
    TooManySubscriptions { identity: Identity, limit: usize },
}

/// Failures surfaced by core operations.
///
/// `Rejected` is a declined state change with nothing mutated. Every other
/// variant is a collaborator failure, which the core never retries.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        let err = Rejection::QueueFull {
            identity: Identity(3),
            limit: 256,
        };
        assert_eq!(err.to_string(), "pending queue for session-3 is full (256 updates)");

        let err = Rejection::InvalidLeaderboard("bad name".to_string());
        assert_eq!(err.to_string(), "invalid leaderboard name \"bad name\"");
    }

    #[test]
    fn test_sync_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_rejection_is_transparent() {
        let err: SyncError = Rejection::InvalidEntry(String::new()).into();
        assert_eq!(err.to_string(), "invalid entry name \"\"");
    }
}
