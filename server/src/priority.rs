//! Priority tiers for (leaderboard, identity) pairs and the load-shedding
//! rule built on them.

use crate::config::PriorityConfig;
use crate::error::Rejection;
use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};
use shared::Identity;
use std::fmt;

/// Ordered most urgent first, so `min` picks the more urgent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        };
        f.write_str(name)
    }
}

const LEADERBOARD_PRIORITIES: &[(&str, Priority)] = &[
    ("playerKillCount", Priority::Critical),
    ("deaths", Priority::Critical),
    ("health", Priority::High),
    ("score", Priority::High),
    ("level", Priority::Normal),
    ("totalPlayTime", Priority::Low),
];

/// Tier of a leaderboard on its own: exact name first, then case-insensitive
/// containment (most urgent match wins), otherwise `Normal`.
pub fn leaderboard_priority(leaderboard: &str) -> Priority {
    if let Some((_, priority)) = LEADERBOARD_PRIORITIES
        .iter()
        .find(|(name, _)| *name == leaderboard)
    {
        return *priority;
    }

    let lowered = leaderboard.to_lowercase();
    LEADERBOARD_PRIORITIES
        .iter()
        .filter(|(name, _)| lowered.contains(&name.to_lowercase()))
        .map(|(_, priority)| *priority)
        .min()
        .unwrap_or(Priority::Normal)
}

/// Whether a tier is shed at `load_percent`. Critical never is.
pub fn skips_at(priority: Priority, load_percent: u8, config: &PriorityConfig) -> bool {
    match priority {
        Priority::Critical => false,
        Priority::High => load_percent > config.high_skip_above,
        Priority::Normal => load_percent > config.normal_skip_above,
        Priority::Low => load_percent > config.low_skip_above,
    }
}

pub struct PriorityClassifier {
    config: PriorityConfig,
    overrides: DashMap<Identity, Priority>,
}

impl PriorityClassifier {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            config,
            overrides: DashMap::new(),
        }
    }

    /// The leaderboard's tier, raised to the identity's override if that is
    /// more urgent.
    pub fn classify(&self, leaderboard: &str, identity: Identity) -> Priority {
        let base = leaderboard_priority(leaderboard);
        match self.overrides.get(&identity) {
            Some(boost) => base.min(*boost),
            None => base,
        }
    }

    pub fn should_skip(&self, leaderboard: &str, identity: Identity, load_percent: u8) -> bool {
        skips_at(self.classify(leaderboard, identity), load_percent, &self.config)
    }

    /// Sets an identity-wide tier. `Normal` is the implicit default and
    /// removes the override.
    pub fn set_override(&self, identity: Identity, priority: Priority) -> Result<(), Rejection> {
        if !identity.is_valid() {
            return Err(Rejection::InvalidIdentity(identity));
        }
        if priority == Priority::Normal {
            self.overrides.remove(&identity);
        } else {
            self.overrides.insert(identity, priority);
        }
        info!("Set priority for {}: {}", identity, priority);
        Ok(())
    }

    pub fn override_for(&self, identity: Identity) -> Option<Priority> {
        self.overrides.get(&identity).map(|priority| *priority)
    }

    pub fn clear_identity(&self, identity: Identity) {
        self.overrides.remove(&identity);
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.overrides.contains_key(&identity)
    }
}
