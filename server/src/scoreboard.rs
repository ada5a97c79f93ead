//! In-memory authoritative leaderboards.
//!
//! Stands in for the host's scoreboard: the server reads snapshots from it
//! every tick and, in demo mode, mutates it at random so there is something
//! to sync.

use crate::error::Rejection;
use crate::host::SnapshotSource;
use dashmap::DashMap;
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{
    is_valid_entry_name, is_valid_leaderboard_name, LeaderboardSnapshot, ScoreUpdate,
};

#[derive(Default)]
pub struct ScoreboardStore {
    boards: DashMap<String, LeaderboardSnapshot>,
}

impl ScoreboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the leaderboard already existed.
    pub fn create_leaderboard(&self, leaderboard: &str) -> Result<bool, Rejection> {
        if !is_valid_leaderboard_name(leaderboard) {
            return Err(Rejection::InvalidLeaderboard(leaderboard.to_string()));
        }
        if self.boards.contains_key(leaderboard) {
            return Ok(false);
        }
        self.boards
            .insert(leaderboard.to_string(), LeaderboardSnapshot::new());
        info!("Created leaderboard {}", leaderboard);
        Ok(true)
    }

    pub fn remove_leaderboard(&self, leaderboard: &str) -> bool {
        self.boards.remove(leaderboard).is_some()
    }

    /// Sets a score, creating the leaderboard on first use. Returns the
    /// previous value.
    pub fn set_score(
        &self,
        leaderboard: &str,
        entry: &str,
        value: i32,
    ) -> Result<Option<i32>, Rejection> {
        if !is_valid_leaderboard_name(leaderboard) {
            return Err(Rejection::InvalidLeaderboard(leaderboard.to_string()));
        }
        if !is_valid_entry_name(entry) {
            return Err(Rejection::InvalidEntry(entry.to_string()));
        }
        Ok(self
            .boards
            .entry(leaderboard.to_string())
            .or_default()
            .insert(entry.to_string(), value))
    }

    pub fn add_score(&self, leaderboard: &str, entry: &str, delta: i32) -> Result<i32, Rejection> {
        let current = self.score(leaderboard, entry).unwrap_or(0);
        let value = current.saturating_add(delta);
        self.set_score(leaderboard, entry, value)?;
        Ok(value)
    }

    pub fn remove_entry(&self, leaderboard: &str, entry: &str) -> bool {
        self.boards
            .get_mut(leaderboard)
            .is_some_and(|mut board| board.remove(entry).is_some())
    }

    pub fn score(&self, leaderboard: &str, entry: &str) -> Option<i32> {
        self.boards
            .get(leaderboard)
            .and_then(|board| board.get(entry).copied())
    }

    pub fn leaderboards(&self) -> Vec<String> {
        let mut names: Vec<String> = self.boards.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Applies `changes` random score bumps across `players` and returns
    /// them as score lines.
    pub fn churn<R: Rng>(
        &self,
        rng: &mut R,
        players: &[String],
        changes: usize,
    ) -> Vec<ScoreUpdate> {
        let boards = self.leaderboards();
        let mut applied = Vec::with_capacity(changes);
        for _ in 0..changes {
            let (Some(leaderboard), Some(player)) = (boards.choose(rng), players.choose(rng))
            else {
                break;
            };
            let delta = rng.gen_range(1..=5);
            if let Ok(value) = self.add_score(leaderboard, player, delta) {
                applied.push(ScoreUpdate::change(leaderboard, player, value));
            }
        }
        applied
    }
}

impl SnapshotSource for ScoreboardStore {
    fn snapshot(&self, leaderboard: &str) -> Option<LeaderboardSnapshot> {
        self.boards.get(leaderboard).map(|board| board.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_set_and_read_scores() {
        let store = ScoreboardStore::new();
        assert_eq!(store.set_score("kills", "alice", 3).unwrap(), None);
        assert_eq!(store.set_score("kills", "alice", 5).unwrap(), Some(3));
        assert_eq!(store.add_score("kills", "alice", -7).unwrap(), -2);
        assert_eq!(store.score("kills", "alice"), Some(-2));
        assert_eq!(store.leaderboards(), vec!["kills".to_string()]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = ScoreboardStore::new();
        store.set_score("kills", "alice", 1).unwrap();
        let snapshot = store.snapshot("kills").unwrap();
        store.set_score("kills", "alice", 2).unwrap();
        assert_eq!(snapshot["alice"], 1);
        assert!(store.snapshot("missing").is_none());
    }

    #[test]
    fn test_rejects_invalid_names() {
        let store = ScoreboardStore::new();
        assert!(store.set_score("no spaces", "alice", 1).is_err());
        assert!(store.set_score("kills", "", 1).is_err());
        assert!(store.create_leaderboard("a/b").is_err());
        assert!(store.leaderboards().is_empty());
    }

    #[test]
    fn test_remove_entry_and_leaderboard() {
        let store = ScoreboardStore::new();
        assert!(store.create_leaderboard("deaths").unwrap());
        assert!(!store.create_leaderboard("deaths").unwrap());
        store.set_score("deaths", "bob", 1).unwrap();
        assert!(store.remove_entry("deaths", "bob"));
        assert!(!store.remove_entry("deaths", "bob"));
        assert!(store.remove_leaderboard("deaths"));
        assert!(store.snapshot("deaths").is_none());
    }

    #[test]
    fn test_churn_touches_known_boards_only() {
        let store = ScoreboardStore::new();
        store.create_leaderboard("kills").unwrap();
        store.create_leaderboard("deaths").unwrap();
        let players = vec!["alice".to_string(), "bob".to_string()];
        let mut rng = StdRng::seed_from_u64(7);

        let updates = store.churn(&mut rng, &players, 10);
        assert_eq!(updates.len(), 10);
        for update in &updates {
            assert!(update.leaderboard == "kills" || update.leaderboard == "deaths");
            assert!(update.value > 0);
        }
        assert_eq!(store.leaderboards().len(), 2);
    }

    #[test]
    fn test_churn_without_players_is_empty() {
        let store = ScoreboardStore::new();
        store.create_leaderboard("kills").unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(store.churn(&mut rng, &[], 5).is_empty());
    }
}
