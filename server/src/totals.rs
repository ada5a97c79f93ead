//! Synthetic `total_<stat>` leaderboards built from per-player statistics.
//!
//! The aggregator remembers the last value reported for every player and
//! statistic, including players who have since disconnected, so a total
//! leaderboard covers everyone who ever contributed. Each total leaderboard
//! lists the players with a positive value plus a [`SERVER_TOTAL_ENTRY`] line
//! holding their sum.

use crate::error::Rejection;
use crate::host::SnapshotSource;
use dashmap::{DashMap, DashSet};
use log::{debug, info};
use shared::{
    is_valid_entry_name, is_valid_leaderboard_name, LeaderboardSnapshot, SERVER_TOTAL_ENTRY,
    TOTAL_PREFIX,
};
use std::collections::HashMap;
use std::sync::Arc;

pub fn total_leaderboard_id(stat: &str) -> String {
    format!("{}{}", TOTAL_PREFIX, stat)
}

#[derive(Default)]
pub struct StatsAggregator {
    values: DashMap<String, HashMap<String, i32>>,
    enabled: DashSet<String>,
    excluded: DashSet<String>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, player: &str, stat: &str, value: i32) -> Result<(), Rejection> {
        if !is_valid_entry_name(player) {
            return Err(Rejection::InvalidEntry(player.to_string()));
        }
        self.values
            .entry(player.to_string())
            .or_default()
            .insert(stat.to_string(), value);
        Ok(())
    }

    pub fn value(&self, player: &str, stat: &str) -> Option<i32> {
        self.values
            .get(player)
            .and_then(|stats| stats.get(stat).copied())
    }

    pub fn enable_stat(&self, stat: &str) -> Result<(), Rejection> {
        let id = total_leaderboard_id(stat);
        if stat.is_empty() || !is_valid_leaderboard_name(&id) {
            return Err(Rejection::InvalidLeaderboard(id));
        }
        if self.enabled.insert(stat.to_string()) {
            info!("Enabled total leaderboard {}", id);
        }
        Ok(())
    }

    pub fn disable_stat(&self, stat: &str) -> bool {
        self.enabled.remove(stat).is_some()
    }

    pub fn is_enabled(&self, stat: &str) -> bool {
        self.enabled.contains(stat)
    }

    /// Ids of every enabled total leaderboard, sorted.
    pub fn total_leaderboards(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .enabled
            .iter()
            .map(|stat| total_leaderboard_id(stat.key()))
            .collect();
        ids.sort();
        ids
    }

    pub fn exclude_player(&self, player: &str) {
        self.excluded.insert(player.to_string());
    }

    pub fn include_player(&self, player: &str) {
        self.excluded.remove(player);
    }

    pub fn is_excluded(&self, player: &str) -> bool {
        self.excluded.contains(player)
    }

    pub fn remove_player(&self, player: &str) {
        self.values.remove(player);
    }

    /// Current totals for `stat`: positive per-player values and the server
    /// total.
    pub fn total_snapshot(&self, stat: &str) -> LeaderboardSnapshot {
        let mut snapshot = LeaderboardSnapshot::new();
        let mut total: i32 = 0;
        for entry in self.values.iter() {
            if self.excluded.contains(entry.key()) {
                continue;
            }
            if let Some(&value) = entry.value().get(stat) {
                if value > 0 {
                    total = total.saturating_add(value);
                    snapshot.insert(entry.key().clone(), value);
                }
            }
        }
        debug!(
            "Computed {} - Total: {}, Players: {}",
            total_leaderboard_id(stat),
            total,
            snapshot.len()
        );
        snapshot.insert(SERVER_TOTAL_ENTRY.to_string(), total);
        snapshot
    }
}

/// Snapshot source that answers enabled `total_*` leaderboards from a
/// [`StatsAggregator`] and everything else from `inner`.
pub struct TotalsSource<S> {
    inner: S,
    stats: Arc<StatsAggregator>,
}

impl<S: SnapshotSource> TotalsSource<S> {
    pub fn new(inner: S, stats: Arc<StatsAggregator>) -> Self {
        Self { inner, stats }
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: SnapshotSource> SnapshotSource for TotalsSource<S> {
    fn snapshot(&self, leaderboard: &str) -> Option<LeaderboardSnapshot> {
        match leaderboard.strip_prefix(TOTAL_PREFIX) {
            Some(stat) if self.stats.is_enabled(stat) => Some(self.stats.total_snapshot(stat)),
            _ => self.inner.snapshot(leaderboard),
        }
    }
}
