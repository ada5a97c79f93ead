//! Narrow interfaces to the host that owns sessions, scores and sockets.

use crate::error::SyncError;
use shared::{Identity, LeaderboardSnapshot, ScoreUpdate};

/// Outbound sink for score lines. Fire-and-forget: an `Ok` is taken as sent.
pub trait Transport: Send + Sync {
    fn send(&self, identity: Identity, update: &ScoreUpdate) -> Result<(), SyncError>;

    /// Points the client's sidebar at `leaderboard`, or clears it with `None`.
    /// With `reset` the client must forget every line it holds for the board.
    fn display(
        &self,
        _identity: Identity,
        _leaderboard: Option<&str>,
        _title: &str,
        _reset: bool,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Pull-based source of authoritative scores.
pub trait SnapshotSource: Send + Sync {
    /// `None` when the leaderboard does not exist.
    fn snapshot(&self, leaderboard: &str) -> Option<LeaderboardSnapshot>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for std::sync::Arc<S> {
    fn snapshot(&self, leaderboard: &str) -> Option<LeaderboardSnapshot> {
        (**self).snapshot(leaderboard)
    }
}

pub trait LivenessOracle: Send + Sync {
    fn is_connected(&self, identity: Identity) -> bool;
}

impl<F> LivenessOracle for F
where
    F: Fn(Identity) -> bool + Send + Sync,
{
    fn is_connected(&self, identity: Identity) -> bool {
        self(identity)
    }
}
