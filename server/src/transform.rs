//! Per-identity presentation tweaks applied to snapshots before diffing.
//!
//! A transform never touches the authoritative scores; it only changes what
//! one client is shown: a custom sidebar title per leaderboard and fixed
//! offsets added to individual entries. Operators can also hand out
//! transforms from config as [`TransformRule`]s.

use crate::config::TransformRule;
use crate::error::Rejection;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::{is_valid_entry_name, is_valid_leaderboard_name, Identity, LeaderboardSnapshot};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreboardTransform {
    pub enabled: bool,
    pub display_names: HashMap<String, String>,
    pub offsets: HashMap<String, HashMap<String, i32>>,
}

impl ScoreboardTransform {
    pub fn offset(&self, leaderboard: &str, entry: &str) -> Option<i32> {
        self.offsets
            .get(leaderboard)
            .and_then(|entries| entries.get(entry))
            .copied()
    }

    /// Adds configured offsets in place. Offsets for entries missing from the
    /// snapshot are ignored.
    pub fn apply(&self, leaderboard: &str, snapshot: &mut LeaderboardSnapshot) {
        if !self.enabled {
            return;
        }
        let Some(entries) = self.offsets.get(leaderboard) else {
            return;
        };
        for (entry, offset) in entries {
            if let Some(value) = snapshot.get_mut(entry) {
                *value = value.saturating_add(*offset);
            }
        }
    }
}

#[derive(Default)]
pub struct TransformRegistry {
    transforms: DashMap<Identity, ScoreboardTransform>,
}

fn validate(identity: Identity, leaderboard: &str) -> Result<(), Rejection> {
    if !identity.is_valid() {
        return Err(Rejection::InvalidIdentity(identity));
    }
    if !is_valid_leaderboard_name(leaderboard) {
        return Err(Rejection::InvalidLeaderboard(leaderboard.to_string()));
    }
    Ok(())
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_display_name(
        &self,
        identity: Identity,
        leaderboard: &str,
        title: &str,
    ) -> Result<(), Rejection> {
        validate(identity, leaderboard)?;
        if !is_valid_entry_name(title) {
            return Err(Rejection::InvalidEntry(title.to_string()));
        }
        self.transforms
            .entry(identity)
            .or_default()
            .display_names
            .insert(leaderboard.to_string(), title.to_string());
        Ok(())
    }

    pub fn set_offset(
        &self,
        identity: Identity,
        leaderboard: &str,
        entry: &str,
        offset: i32,
    ) -> Result<(), Rejection> {
        validate(identity, leaderboard)?;
        if !is_valid_entry_name(entry) {
            return Err(Rejection::InvalidEntry(entry.to_string()));
        }
        self.transforms
            .entry(identity)
            .or_default()
            .offsets
            .entry(leaderboard.to_string())
            .or_default()
            .insert(entry.to_string(), offset);
        Ok(())
    }

    pub fn set_enabled(&self, identity: Identity, enabled: bool) -> Result<(), Rejection> {
        if !identity.is_valid() {
            return Err(Rejection::InvalidIdentity(identity));
        }
        self.transforms.entry(identity).or_default().enabled = enabled;
        Ok(())
    }

    /// Merges a configured rule into the identity's transform and enables it.
    /// Titles and offsets the rule names overwrite existing ones; everything
    /// else is kept.
    pub fn apply_rule(&self, identity: Identity, rule: &TransformRule) -> Result<(), Rejection> {
        validate(identity, &rule.leaderboard)?;
        let mut transform = self.transforms.entry(identity).or_default();
        if let Some(title) = &rule.display_name {
            transform
                .display_names
                .insert(rule.leaderboard.clone(), title.clone());
        }
        if !rule.score_offsets.is_empty() {
            transform
                .offsets
                .entry(rule.leaderboard.clone())
                .or_default()
                .extend(rule.score_offsets.iter().map(|(entry, offset)| (entry.clone(), *offset)));
        }
        transform.enabled = true;
        Ok(())
    }

    /// Sidebar title for `leaderboard` as `identity` should see it.
    pub fn title_for(&self, identity: Identity, leaderboard: &str) -> String {
        self.transforms
            .get(&identity)
            .filter(|transform| transform.enabled)
            .and_then(|transform| transform.display_names.get(leaderboard).cloned())
            .unwrap_or_else(|| leaderboard.to_string())
    }

    pub fn apply(&self, identity: Identity, leaderboard: &str, snapshot: &mut LeaderboardSnapshot) {
        if let Some(transform) = self.transforms.get(&identity) {
            transform.apply(leaderboard, snapshot);
        }
    }

    /// Transformed value of a single line, for updates that bypass snapshots.
    pub fn transform_value(
        &self,
        identity: Identity,
        leaderboard: &str,
        entry: &str,
        value: i32,
    ) -> i32 {
        self.transforms
            .get(&identity)
            .filter(|transform| transform.enabled)
            .and_then(|transform| transform.offset(leaderboard, entry))
            .map_or(value, |offset| value.saturating_add(offset))
    }

    pub fn get(&self, identity: Identity) -> Option<ScoreboardTransform> {
        self.transforms.get(&identity).map(|transform| transform.clone())
    }

    /// Drops the identity's transform. Returns whether one existed.
    pub fn clear_identity(&self, identity: Identity) -> bool {
        self.transforms.remove(&identity).is_some()
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.transforms.contains_key(&identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Identity = Identity(1);
    const BOB: Identity = Identity(2);

    fn snapshot(entries: &[(&str, i32)]) -> LeaderboardSnapshot {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn test_offsets_apply_only_when_enabled() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "bob", 10).unwrap();

        let mut snap = snapshot(&[("bob", 5), ("carol", 1)]);
        registry.apply(ALICE, "kills", &mut snap);
        assert_eq!(snap["bob"], 5);

        registry.set_enabled(ALICE, true).unwrap();
        registry.apply(ALICE, "kills", &mut snap);
        assert_eq!(snap, snapshot(&[("bob", 15), ("carol", 1)]));
        assert_eq!(registry.transform_value(ALICE, "kills", "bob", 1), 11);
        assert_eq!(registry.transform_value(ALICE, "kills", "carol", 1), 1);
    }

    #[test]
    fn test_offsets_are_scoped_to_identity_and_leaderboard() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "bob", -3).unwrap();
        registry.set_enabled(ALICE, true).unwrap();

        let mut other_board = snapshot(&[("bob", 5)]);
        registry.apply(ALICE, "deaths", &mut other_board);
        assert_eq!(other_board["bob"], 5);

        let mut other_identity = snapshot(&[("bob", 5)]);
        registry.apply(BOB, "kills", &mut other_identity);
        assert_eq!(other_identity["bob"], 5);
    }

    #[test]
    fn test_offset_saturates() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "bob", 10).unwrap();
        registry.set_enabled(ALICE, true).unwrap();
        let mut snap = snapshot(&[("bob", i32::MAX - 1)]);
        registry.apply(ALICE, "kills", &mut snap);
        assert_eq!(snap["bob"], i32::MAX);
    }

    #[test]
    fn test_offset_for_missing_entry_adds_nothing() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "ghost", 10).unwrap();
        registry.set_enabled(ALICE, true).unwrap();
        let mut snap = snapshot(&[("bob", 1)]);
        registry.apply(ALICE, "kills", &mut snap);
        assert_eq!(snap, snapshot(&[("bob", 1)]));
    }

    #[test]
    fn test_title_mapping() {
        let registry = TransformRegistry::new();
        assert_eq!(registry.title_for(ALICE, "kills"), "kills");

        registry.set_display_name(ALICE, "kills", "Top Slayers").unwrap();
        assert_eq!(registry.title_for(ALICE, "kills"), "kills");
        registry.set_enabled(ALICE, true).unwrap();
        assert_eq!(registry.title_for(ALICE, "kills"), "Top Slayers");
        assert_eq!(registry.title_for(ALICE, "deaths"), "deaths");
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let registry = TransformRegistry::new();
        assert!(matches!(
            registry.set_offset(Identity(0), "kills", "bob", 1),
            Err(Rejection::InvalidIdentity(_))
        ));
        assert!(matches!(
            registry.set_offset(ALICE, "no spaces", "bob", 1),
            Err(Rejection::InvalidLeaderboard(_))
        ));
        assert!(matches!(
            registry.set_display_name(ALICE, "kills", ""),
            Err(Rejection::InvalidEntry(_))
        ));
        assert!(!registry.tracks(ALICE));
    }

    #[test]
    fn test_rule_merges_into_existing_transform() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "carol", 2).unwrap();

        let rule = TransformRule {
            leaderboard: "kills".to_string(),
            display_name: Some("Slayers".to_string()),
            score_offsets: HashMap::from([("bob".to_string(), 100)]),
        };
        registry.apply_rule(ALICE, &rule).unwrap();

        assert_eq!(registry.title_for(ALICE, "kills"), "Slayers");
        let mut snap = snapshot(&[("bob", 1), ("carol", 1)]);
        registry.apply(ALICE, "kills", &mut snap);
        assert_eq!(snap, snapshot(&[("bob", 101), ("carol", 3)]));
        assert!(!registry.tracks(BOB));
    }

    #[test]
    fn test_clear_identity() {
        let registry = TransformRegistry::new();
        registry.set_offset(ALICE, "kills", "bob", 1).unwrap();
        assert!(registry.clear_identity(ALICE));
        assert!(!registry.clear_identity(ALICE));
        assert!(registry.get(ALICE).is_none());
    }
}
