//! # Scoreboard Client Library
//!
//! A small UDP client for the scoreboard server. It is mostly useful for
//! watching the differential sync from the receiving end: every line the
//! server sends lands in a local [`view::ScoreboardView`], which can be
//! rendered as the same plain-text sidebar a game client would draw.
//!
//! ## Module Organization
//!
//! ### View Module (`view`)
//! Client-side copy of the displayed leaderboard:
//! - Applies `Display` packets (switch or clear the sidebar)
//! - Applies change and remove lines for the displayed leaderboard only
//! - Renders the top entries via [`shared::format_sidebar`]
//!
//! ### Network Module (`network`)
//! Manages the session with the server:
//! - Connect handshake and protocol version
//! - Subscribing to a leaderboard once connected
//! - Heartbeats so the server does not time us out
//! - Action requests and their accepted/denied results
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::Client;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new("127.0.0.1:8080", "playerKillCount")
//!     .await?
//!     .with_sidebar_output(true);
//! client.run(Some(Duration::from_secs(30))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The view only ever reflects what the server chose to send. Under load the
//! server throttles and skips low-priority leaderboards, so the sidebar can
//! lag behind the authoritative scores until the next tick catches it up.

pub mod network;
pub mod view;
