//! Client-side mirror of the sidebar the server points us at.

use log::{debug, warn};
use shared::{format_sidebar, LeaderboardSnapshot, Packet, ScoreUpdate, UpdateKind};

/// What [`ScoreboardView::apply`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    /// The sidebar was replaced or cleared.
    Displayed,
    /// A line of the displayed leaderboard changed.
    Scored,
    /// The packet did not touch the view.
    Ignored,
}

#[derive(Debug, Default)]
pub struct ScoreboardView {
    leaderboard: Option<String>,
    title: String,
    entries: LeaderboardSnapshot,
}

impl ScoreboardView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaderboard(&self) -> Option<&str> {
        self.leaderboard.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn entries(&self) -> &LeaderboardSnapshot {
        &self.entries
    }

    pub fn score(&self, entry: &str) -> Option<i32> {
        self.entries.get(entry).copied()
    }

    pub fn apply(&mut self, packet: &Packet) -> ViewChange {
        match packet {
            Packet::Display {
                leaderboard,
                title,
                reset,
            } => {
                self.show(leaderboard.as_deref(), title, *reset);
                ViewChange::Displayed
            }
            Packet::Score(update) => self.apply_score(update),
            _ => ViewChange::Ignored,
        }
    }

    /// Switching leaderboards or a reset drops every line we held; the
    /// server resends the board in full on its next sync.
    fn show(&mut self, leaderboard: Option<&str>, title: &str, reset: bool) {
        if reset || self.leaderboard.as_deref() != leaderboard {
            self.entries.clear();
        }
        self.leaderboard = leaderboard.map(str::to_string);
        self.title = title.to_string();
    }

    fn apply_score(&mut self, update: &ScoreUpdate) -> ViewChange {
        if self.leaderboard.as_deref() != Some(update.leaderboard.as_str()) {
            debug!(
                "Ignoring score for {} while showing {:?}",
                update.leaderboard, self.leaderboard
            );
            return ViewChange::Ignored;
        }

        match update.kind {
            UpdateKind::Change => {
                self.entries.insert(update.entry.clone(), update.value);
            }
            UpdateKind::Remove => {
                if self.entries.remove(&update.entry).is_none() {
                    warn!("Server removed unknown entry {}", update.entry);
                }
            }
        }
        ViewChange::Scored
    }

    /// Empty when no leaderboard is displayed.
    pub fn render(&self) -> String {
        match self.leaderboard {
            Some(_) => format_sidebar(&self.title, &self.entries),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display(leaderboard: &str, title: &str) -> Packet {
        Packet::Display {
            leaderboard: Some(leaderboard.to_string()),
            title: title.to_string(),
            reset: true,
        }
    }

    fn retitle(leaderboard: &str, title: &str) -> Packet {
        Packet::Display {
            leaderboard: Some(leaderboard.to_string()),
            title: title.to_string(),
            reset: false,
        }
    }

    #[test]
    fn test_scores_apply_to_displayed_board() {
        let mut view = ScoreboardView::new();
        assert_eq!(view.apply(&display("kills", "Kills")), ViewChange::Displayed);
        assert_eq!(
            view.apply(&Packet::Score(ScoreUpdate::change("kills", "alice", 4))),
            ViewChange::Scored
        );
        assert_eq!(view.score("alice"), Some(4));
        assert_eq!(view.title(), "Kills");
    }

    #[test]
    fn test_scores_for_other_boards_are_ignored() {
        let mut view = ScoreboardView::new();
        view.apply(&display("kills", "Kills"));
        let change = view.apply(&Packet::Score(ScoreUpdate::change("deaths", "alice", 1)));
        assert_eq!(change, ViewChange::Ignored);
        assert!(view.entries().is_empty());
    }

    #[test]
    fn test_remove_drops_line() {
        let mut view = ScoreboardView::new();
        view.apply(&display("kills", "Kills"));
        view.apply(&Packet::Score(ScoreUpdate::change("kills", "alice", 4)));
        view.apply(&Packet::Score(ScoreUpdate::remove("kills", "alice")));
        assert_eq!(view.score("alice"), None);
    }

    #[test]
    fn test_switching_board_clears_entries() {
        let mut view = ScoreboardView::new();
        view.apply(&display("kills", "Kills"));
        view.apply(&Packet::Score(ScoreUpdate::change("kills", "alice", 4)));

        view.apply(&retitle("kills", "Renamed"));
        assert_eq!(view.score("alice"), Some(4));
        assert_eq!(view.title(), "Renamed");

        view.apply(&retitle("deaths", "Deaths"));
        assert!(view.entries().is_empty());
        assert_eq!(view.leaderboard(), Some("deaths"));
    }

    #[test]
    fn test_reset_of_same_board_drops_stale_lines() {
        let mut view = ScoreboardView::new();
        view.apply(&display("deaths", "Deaths"));
        view.apply(&Packet::Score(ScoreUpdate::change("deaths", "alice", 1)));
        view.apply(&Packet::Score(ScoreUpdate::change("deaths", "bob", 2)));

        assert_eq!(view.apply(&display("deaths", "Deaths")), ViewChange::Displayed);
        assert!(view.entries().is_empty());
        assert_eq!(view.leaderboard(), Some("deaths"));

        view.apply(&Packet::Score(ScoreUpdate::change("deaths", "bob", 2)));
        assert_eq!(view.score("alice"), None);
        assert_eq!(view.score("bob"), Some(2));
    }

    #[test]
    fn test_render() {
        let mut view = ScoreboardView::new();
        assert!(view.render().is_empty());

        view.apply(&display("kills", "Kills"));
        view.apply(&Packet::Score(ScoreUpdate::change("kills", "alice", 4)));
        view.apply(&Packet::Score(ScoreUpdate::change("kills", "bob", 9)));
        let rendered = view.render();
        assert!(rendered.starts_with("【Kills】"));
        let bob = rendered.find("bob").unwrap();
        let alice = rendered.find("alice").unwrap();
        assert!(bob < alice);

        view.apply(&Packet::Display {
            leaderboard: None,
            title: String::new(),
            reset: true,
        });
        assert!(view.render().is_empty());
        assert!(view.entries().is_empty());
    }

    #[test]
    fn test_unrelated_packets_are_ignored() {
        let mut view = ScoreboardView::new();
        let change = view.apply(&Packet::Disconnected {
            reason: "bye".to_string(),
        });
        assert_eq!(change, ViewChange::Ignored);
    }
}
