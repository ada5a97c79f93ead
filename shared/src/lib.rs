use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_LEADERBOARD_NAME_LENGTH: usize = 64;
pub const MAX_ENTRY_NAME_LENGTH: usize = 64;
pub const SIDEBAR_LINES: usize = 15;
pub const SERVER_TOTAL_ENTRY: &str = "$SERVER_TOTAL";
pub const TOTAL_PREFIX: &str = "total_";

/// Entry name -> score for one leaderboard at one point in time.
pub type LeaderboardSnapshot = HashMap<String, i32>;

/// Opaque key for one connected client session. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub u64);

impl Identity {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Change,
    Remove,
}

/// A single score line addressed to one leaderboard on one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub leaderboard: String,
    pub entry: String,
    pub value: i32,
    pub kind: UpdateKind,
}

impl ScoreUpdate {
    pub fn change(leaderboard: &str, entry: &str, value: i32) -> Self {
        Self {
            leaderboard: leaderboard.to_string(),
            entry: entry.to_string(),
            value,
            kind: UpdateKind::Change,
        }
    }

    pub fn remove(leaderboard: &str, entry: &str) -> Self {
        Self {
            leaderboard: leaderboard.to_string(),
            entry: entry.to_string(),
            value: 0,
            kind: UpdateKind::Remove,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Subscribe {
        leaderboard: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    Action {
        kind: String,
    },
    Disconnect,

    Connected {
        client_id: u64,
    },
    /// `reset` tells the client to drop the lines it holds before the
    /// server resends the board; without it only the title changes.
    Display {
        leaderboard: Option<String>,
        title: String,
        reset: bool,
    },
    Score(ScoreUpdate),
    ActionResult {
        kind: String,
        accepted: bool,
    },
    Disconnected {
        reason: String,
    },
}

/// Leaderboard names follow the host's objective naming rules.
pub fn is_valid_leaderboard_name(name: &str) -> bool {
    if name.trim().is_empty() || name.len() > MAX_LEADERBOARD_NAME_LENGTH {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

pub fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_ENTRY_NAME_LENGTH && !name.chars().any(char::is_control)
}

pub fn is_total_leaderboard(name: &str) -> bool {
    name.starts_with(TOTAL_PREFIX)
}

/// Entries sorted for display: highest score first, ties by name.
pub fn ranked(snapshot: &LeaderboardSnapshot) -> Vec<(&str, i32)> {
    let mut entries: Vec<(&str, i32)> = snapshot
        .iter()
        .map(|(name, value)| (name.as_str(), *value))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    entries
}

/// Plain-text sidebar: a bracketed title, a rule, then the top
/// [`SIDEBAR_LINES`] entries.
pub fn format_sidebar(title: &str, snapshot: &LeaderboardSnapshot) -> String {
    let mut out = format!("【{}】\n{}\n", title, "─".repeat(30));
    for (name, value) in ranked(snapshot).into_iter().take(SIDEBAR_LINES) {
        out.push_str(&format!("{:<16} {:>8}\n", name, value));
    }
    out
}
