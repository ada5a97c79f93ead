//! Operator-tunable settings for the sync core.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "limiter": { "scoreboard_baseline": 20 }, "batch": { "batch_timeout_ms": 50 } }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use shared::{is_valid_entry_name, is_valid_leaderboard_name};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub load: LoadConfig,
    pub limiter: LimiterConfig,
    pub batch: BatchConfig,
    pub sync: SyncLimits,
    pub priority: PriorityConfig,
    pub cooldowns: CooldownConfig,
    pub auto_transform: AutoTransformConfig,
}

/// Measurement window and level thresholds for the load monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub window_ms: u64,
    /// Units per second that count as 100% load.
    pub baseline_units_per_sec: u64,
    pub medium_threshold: u8,
    pub high_threshold: u8,
    pub critical_threshold: u8,
    /// Ticks-per-second below which the host is considered overloaded.
    pub tps_floor: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            baseline_units_per_sec: 100,
            medium_threshold: 30,
            high_threshold: 70,
            critical_threshold: 90,
            tps_floor: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub window_ms: u64,
    pub general_baseline: u32,
    pub scoreboard_baseline: u32,
    pub general_floor: u32,
    pub scoreboard_floor: u32,
    pub divisors: LoadDivisors,
    /// Bytes reported to the load monitor for every admitted packet.
    pub estimated_packet_size: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            general_baseline: 50,
            scoreboard_baseline: 10,
            general_floor: 5,
            scoreboard_floor: 1,
            divisors: LoadDivisors::default(),
            estimated_packet_size: 64,
        }
    }
}

/// Divisor applied to each baseline cap at a given load level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadDivisors {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for LoadDivisors {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 2,
            high: 3,
            critical: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Hard cap on queued updates per identity.
    pub max_pending: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            batch_timeout_ms: 100,
            max_pending: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLimits {
    pub max_entries_per_leaderboard: usize,
    pub max_subscriptions: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_entries_per_leaderboard: 100,
            max_subscriptions: 50,
        }
    }
}

/// Load percentages above which each tier stops being synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub high_skip_above: u8,
    pub normal_skip_above: u8,
    pub low_skip_above: u8,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            high_skip_above: 80,
            normal_skip_above: 60,
            low_skip_above: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub command_ms: u64,
    pub gui_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            command_ms: 500,
            gui_ms: 1_000,
        }
    }
}

/// Transforms handed to players without anyone asking for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTransformConfig {
    pub enabled: bool,
    /// Apply the rules to every player as they connect.
    pub apply_to_new_players: bool,
    pub rules: Vec<TransformRule>,
}

impl AutoTransformConfig {
    /// Whether connecting players get the rules.
    pub fn applies_on_connect(&self) -> bool {
        self.enabled && self.apply_to_new_players
    }

    pub fn rule_for(&self, leaderboard: &str) -> Option<&TransformRule> {
        if !self.enabled {
            return None;
        }
        self.rules.iter().find(|rule| rule.leaderboard == leaderboard)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    pub leaderboard: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub score_offsets: HashMap<String, i32>,
}

impl TransformRule {
    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_leaderboard_name(&self.leaderboard) {
            return Err(ConfigError::Invalid(format!(
                "auto transform rule names invalid leaderboard {:?}",
                self.leaderboard
            )));
        }
        let bad_title = self
            .display_name
            .as_deref()
            .is_some_and(|title| !is_valid_entry_name(title));
        if bad_title || !self.score_offsets.keys().all(|entry| is_valid_entry_name(entry)) {
            return Err(ConfigError::Invalid(format!(
                "auto transform rule for {} has an invalid title or entry name",
                self.leaderboard
            )));
        }
        Ok(())
    }
}

impl SyncConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let load = &self.load;
        if load.window_ms == 0 || load.baseline_units_per_sec == 0 {
            return Err(ConfigError::Invalid(
                "load window and baseline rate must be positive".into(),
            ));
        }
        if !(load.medium_threshold <= load.high_threshold
            && load.high_threshold <= load.critical_threshold
            && load.critical_threshold <= 100)
        {
            return Err(ConfigError::Invalid(
                "load thresholds must be ordered medium <= high <= critical <= 100".into(),
            ));
        }

        let limiter = &self.limiter;
        if limiter.window_ms == 0 {
            return Err(ConfigError::Invalid("limiter window must be positive".into()));
        }
        if limiter.general_floor == 0 || limiter.scoreboard_floor == 0 {
            return Err(ConfigError::Invalid("rate limit floors must be positive".into()));
        }
        let d = &limiter.divisors;
        if d.low == 0 || !(d.low <= d.medium && d.medium <= d.high && d.high <= d.critical) {
            return Err(ConfigError::Invalid(
                "divisors must be >= 1 and non-decreasing with load".into(),
            ));
        }

        if self.batch.max_batch_size == 0 || self.batch.max_pending < self.batch.max_batch_size {
            return Err(ConfigError::Invalid(
                "batch size must be positive and no larger than the pending cap".into(),
            ));
        }
        if self.sync.max_entries_per_leaderboard == 0 || self.sync.max_subscriptions == 0 {
            return Err(ConfigError::Invalid("sync limits must be positive".into()));
        }
        self.auto_transform.validate()
    }
}

impl AutoTransformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load.window_ms, 5_000);
        assert_eq!(config.limiter.scoreboard_baseline, 10);
        assert_eq!(config.batch.max_batch_size, 20);
        assert_eq!(config.sync.max_entries_per_leaderboard, 100);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SyncConfig::from_json(r#"{ "limiter": { "scoreboard_baseline": 20 } }"#).unwrap();
        assert_eq!(config.limiter.scoreboard_baseline, 20);
        assert_eq!(config.limiter.general_baseline, 50);
        assert_eq!(config.batch, BatchConfig::default());
    }

    #[test]
    fn test_rejects_decreasing_divisors() {
        let result = SyncConfig::from_json(r#"{ "limiter": { "divisors": { "high": 1 } } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_floor() {
        let mut config = SyncConfig::default();
        config.limiter.scoreboard_floor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SyncConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_auto_transform_rules_from_json() {
        let config = SyncConfig::from_json(
            r#"{ "auto_transform": {
                "enabled": true,
                "apply_to_new_players": true,
                "rules": [
                    { "leaderboard": "deaths", "display_name": "Deaths" },
                    { "leaderboard": "points", "score_offsets": { "Sim_256": 1000 } }
                ]
            } }"#,
        )
        .unwrap();
        let auto = &config.auto_transform;
        assert!(auto.applies_on_connect());
        assert_eq!(
            auto.rule_for("deaths").unwrap().display_name.as_deref(),
            Some("Deaths")
        );
        assert_eq!(auto.rule_for("points").unwrap().score_offsets["Sim_256"], 1000);
        assert!(auto.rule_for("kills").is_none());
    }

    #[test]
    fn test_disabled_auto_transform_matches_nothing() {
        let mut auto = AutoTransformConfig {
            enabled: false,
            apply_to_new_players: true,
            rules: vec![TransformRule {
                leaderboard: "deaths".to_string(),
                ..TransformRule::default()
            }],
        };
        assert!(!auto.applies_on_connect());
        assert!(auto.rule_for("deaths").is_none());
        auto.enabled = true;
        assert!(auto.rule_for("deaths").is_some());
    }

    #[test]
    fn test_rejects_bad_auto_transform_rule() {
        let result = SyncConfig::from_json(
            r#"{ "auto_transform": { "rules": [ { "leaderboard": "has space" } ] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            SyncConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
