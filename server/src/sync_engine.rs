//! Differential synchronization of leaderboards to individual clients.
//!
//! For every (identity, leaderboard) pair the engine keeps the values it has
//! actually transmitted. A sync pass diffs a fresh snapshot against that view
//! and sends only what differs, one general-class rate-limit unit per line.
//! A throttled line is left out of the cache so the next pass retries it.

use crate::config::SyncLimits;
use crate::error::{Rejection, SyncError};
use crate::host::Transport;
use crate::rate_limiter::{RateLimiter, TrafficClass};
use dashmap::DashMap;
use log::{debug, error, trace};
use shared::{
    is_valid_entry_name, is_valid_leaderboard_name, Identity, LeaderboardSnapshot, ScoreUpdate,
    UpdateKind,
};
use std::collections::HashMap;
use std::sync::Arc;

/// What one sync pass transmitted and what it had to leave for later.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDelta {
    /// `(entry, value)` pairs sent as changes.
    pub updates: Vec<(String, i32)>,
    /// Entries sent as removals.
    pub removals: Vec<String>,
    /// Lines that differed but were denied by the rate limiter.
    pub throttled: usize,
    /// New entries refused because the pair reached its entry cap.
    pub over_limit: usize,
    /// Entries whose names are not displayable.
    pub rejected: usize,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removals.is_empty()
    }

    pub fn sent(&self) -> usize {
        self.updates.len() + self.removals.len()
    }
}

type PairCache = HashMap<String, i32>;

pub struct DifferentialSyncEngine {
    limits: SyncLimits,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    cache: DashMap<Identity, HashMap<String, PairCache>>,
}

impl DifferentialSyncEngine {
    pub fn new(limits: SyncLimits, limiter: Arc<RateLimiter>, transport: Arc<dyn Transport>) -> Self {
        Self {
            limits,
            limiter,
            transport,
            cache: DashMap::new(),
        }
    }

    /// Sends the difference between `snapshot` and what `identity` was last
    /// sent for `leaderboard`.
    ///
    /// Removals go first so a full pair frees room before new entries are
    /// admitted. Candidates are visited in name order. A transport failure
    /// ends the pass; lines sent before it stay cached.
    pub fn sync(
        &self,
        identity: Identity,
        leaderboard: &str,
        snapshot: &LeaderboardSnapshot,
    ) -> Result<SyncDelta, SyncError> {
        if !identity.is_valid() {
            return Err(Rejection::InvalidIdentity(identity).into());
        }
        if !is_valid_leaderboard_name(leaderboard) {
            return Err(Rejection::InvalidLeaderboard(leaderboard.to_string()).into());
        }

        let mut pairs = self.cache.entry(identity).or_default();
        let cached = pairs.entry(leaderboard.to_string()).or_default();
        let mut delta = SyncDelta::default();

        let mut removals: Vec<String> = cached
            .keys()
            .filter(|name| !snapshot.contains_key(*name))
            .cloned()
            .collect();
        removals.sort();

        for name in removals {
            if !self.limiter.try_consume(identity, TrafficClass::General) {
                delta.throttled += 1;
                continue;
            }
            self.transmit(identity, &ScoreUpdate::remove(leaderboard, &name))?;
            cached.remove(&name);
            delta.removals.push(name);
        }

        let mut changes: Vec<(&String, i32)> = snapshot
            .iter()
            .filter(|(name, value)| cached.get(*name) != Some(*value))
            .map(|(name, value)| (name, *value))
            .collect();
        changes.sort();

        for (name, value) in changes {
            if !is_valid_entry_name(name) {
                trace!("Skipping undisplayable entry {:?} on {}", name, leaderboard);
                delta.rejected += 1;
                continue;
            }
            if !cached.contains_key(name) && cached.len() >= self.limits.max_entries_per_leaderboard
            {
                delta.over_limit += 1;
                continue;
            }
            if !self.limiter.try_consume(identity, TrafficClass::General) {
                delta.throttled += 1;
                continue;
            }
            self.transmit(identity, &ScoreUpdate::change(leaderboard, name, value))?;
            cached.insert(name.clone(), value);
            delta.updates.push((name.clone(), value));
        }

        if !delta.is_empty() || delta.throttled > 0 {
            debug!(
                "Synced {} for {}: {} updates, {} removals, {} throttled",
                leaderboard,
                identity,
                delta.updates.len(),
                delta.removals.len(),
                delta.throttled
            );
        }
        if delta.over_limit > 0 {
            debug!(
                "{} on {} is at its entry cap of {}; {} new entries not admitted",
                leaderboard, identity, self.limits.max_entries_per_leaderboard, delta.over_limit
            );
        }
        Ok(delta)
    }

    fn transmit(&self, identity: Identity, update: &ScoreUpdate) -> Result<(), SyncError> {
        self.transport.send(identity, update).map_err(|e| {
            error!(
                "Failed to send {} {:?} to {}: {}",
                update.leaderboard, update.entry, identity, e
            );
            e
        })
    }

    /// Applies a line sent outside `sync` to the pair's cache. Pairs that
    /// were never synced are left alone.
    pub fn record_sent(&self, identity: Identity, update: &ScoreUpdate) {
        let Some(mut pairs) = self.cache.get_mut(&identity) else {
            return;
        };
        let Some(cached) = pairs.get_mut(&update.leaderboard) else {
            return;
        };
        match update.kind {
            UpdateKind::Change => {
                if cached.contains_key(&update.entry)
                    || cached.len() < self.limits.max_entries_per_leaderboard
                {
                    cached.insert(update.entry.clone(), update.value);
                }
            }
            UpdateKind::Remove => {
                cached.remove(&update.entry);
            }
        }
    }

    /// Forgets what the client was sent for one pair; the next sync is a
    /// full resync.
    pub fn invalidate(&self, identity: Identity, leaderboard: &str) {
        self.cache.remove_if_mut(&identity, |_, pairs| {
            pairs.remove(leaderboard);
            pairs.is_empty()
        });
    }

    /// Drops every identity's cache for a leaderboard that no longer exists.
    pub fn invalidate_leaderboard(&self, leaderboard: &str) {
        self.cache.retain(|_, pairs| {
            pairs.remove(leaderboard);
            !pairs.is_empty()
        });
    }

    pub fn clear_identity(&self, identity: Identity) {
        self.cache.remove(&identity);
    }

    pub fn cached(&self, identity: Identity, leaderboard: &str) -> Option<PairCache> {
        self.cache
            .get(&identity)
            .and_then(|pairs| pairs.get(leaderboard).cloned())
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.cache.contains_key(&identity)
    }

    pub fn tracked_identities(&self) -> usize {
        self.cache.len()
    }
}
