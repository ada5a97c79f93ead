//! Per-player sidebars that exist only for one client.
//!
//! A custom sidebar has its own leaderboard name, title and lines. While one
//! is set it is shown instead of whatever server board the player picked,
//! and reads of its name for that player come from here rather than from the
//! host's snapshot source.

use crate::error::Rejection;
use dashmap::DashMap;
use shared::{is_valid_entry_name, is_valid_leaderboard_name, Identity, LeaderboardSnapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomSidebar {
    pub leaderboard: String,
    pub title: String,
    pub entries: LeaderboardSnapshot,
    /// Server board displayed before this sidebar took over.
    pub replaced: Option<String>,
}

#[derive(Default)]
pub struct CustomSidebars {
    sidebars: DashMap<Identity, CustomSidebar>,
}

impl CustomSidebars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or renames the identity's sidebar. Lines survive a rename of
    /// the title but not a change of leaderboard name. Returns the sidebar it
    /// replaced, if any.
    pub fn set(
        &self,
        identity: Identity,
        leaderboard: &str,
        title: &str,
        replaced: Option<String>,
    ) -> Result<Option<CustomSidebar>, Rejection> {
        if !identity.is_valid() {
            return Err(Rejection::InvalidIdentity(identity));
        }
        if !is_valid_leaderboard_name(leaderboard) {
            return Err(Rejection::InvalidLeaderboard(leaderboard.to_string()));
        }
        if !is_valid_entry_name(title) {
            return Err(Rejection::InvalidEntry(title.to_string()));
        }

        let mut sidebar = self.sidebars.entry(identity).or_default();
        let previous = (!sidebar.leaderboard.is_empty()).then(|| sidebar.clone());
        match &previous {
            Some(old) if old.leaderboard == leaderboard => {}
            Some(old) => {
                sidebar.leaderboard = leaderboard.to_string();
                sidebar.entries.clear();
                sidebar.replaced = old.replaced.clone();
            }
            None => {
                sidebar.leaderboard = leaderboard.to_string();
                sidebar.replaced = replaced;
            }
        }
        sidebar.title = title.to_string();
        Ok(previous)
    }

    /// Records the board to restore once the sidebar is disabled. Naming the
    /// sidebar itself changes nothing. Returns false when the identity has no
    /// sidebar.
    pub fn set_replaced(&self, identity: Identity, leaderboard: Option<&str>) -> bool {
        let Some(mut sidebar) = self.sidebars.get_mut(&identity) else {
            return false;
        };
        if leaderboard != Some(sidebar.leaderboard.as_str()) {
            sidebar.replaced = leaderboard.map(str::to_string);
        }
        true
    }

    /// Returns false when the identity has no sidebar.
    pub fn set_score(&self, identity: Identity, entry: &str, value: i32) -> Result<bool, Rejection> {
        if !is_valid_entry_name(entry) {
            return Err(Rejection::InvalidEntry(entry.to_string()));
        }
        Ok(self
            .sidebars
            .get_mut(&identity)
            .map(|mut sidebar| {
                sidebar.entries.insert(entry.to_string(), value);
            })
            .is_some())
    }

    pub fn remove_score(&self, identity: Identity, entry: &str) -> bool {
        self.sidebars
            .get_mut(&identity)
            .and_then(|mut sidebar| sidebar.entries.remove(entry))
            .is_some()
    }

    /// Drops the sidebar and hands it back so the caller can restore the
    /// board it replaced.
    pub fn disable(&self, identity: Identity) -> Option<CustomSidebar> {
        self.sidebars.remove(&identity).map(|(_, sidebar)| sidebar)
    }

    pub fn get(&self, identity: Identity) -> Option<CustomSidebar> {
        self.sidebars.get(&identity).map(|sidebar| sidebar.clone())
    }

    /// Lines `identity` should see for `leaderboard`, when it is their
    /// custom sidebar.
    pub fn snapshot(&self, identity: Identity, leaderboard: &str) -> Option<LeaderboardSnapshot> {
        self.sidebars
            .get(&identity)
            .filter(|sidebar| sidebar.leaderboard == leaderboard)
            .map(|sidebar| sidebar.entries.clone())
    }

    pub fn title(&self, identity: Identity, leaderboard: &str) -> Option<String> {
        self.sidebars
            .get(&identity)
            .filter(|sidebar| sidebar.leaderboard == leaderboard)
            .map(|sidebar| sidebar.title.clone())
    }

    pub fn clear_identity(&self, identity: Identity) {
        self.sidebars.remove(&identity);
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.sidebars.contains_key(&identity)
    }
}
