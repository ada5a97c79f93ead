//! # Scoreboard Sync Server Library
//!
//! Keeps every connected player's sidebar in step with the authoritative
//! leaderboards while sending as little as possible. Instead of pushing whole
//! leaderboards each tick, the server remembers what each player was last
//! sent and transmits only the lines that changed, throttled per player and
//! scaled back as outbound traffic grows.
//!
//! ## Core Responsibilities
//!
//! ### Differential Sync
//! For every (player, leaderboard) pair the server caches the last values it
//! sent. A tick diffs the current snapshot against that cache and sends
//! change and remove lines only, within the player's scoreboard budget.
//! Lines that do not fit are picked up on a later tick.
//!
//! ### Load Shedding
//! Outbound units are counted in a one second window and turned into a load
//! percentage. The percentage drives both the per-player caps of the rate
//! limiter and the priority classifier, which skips low-priority leaderboards
//! entirely when the server is busy.
//!
//! ### Event-Driven Updates
//! Score changes can also be pushed as they happen. They queue per player in
//! the batcher and flush when the queue fills or times out, gated by the same
//! limiter so the two paths share one budget.
//!
//! ## Module Organization
//!
//! ### Sync Core
//! - `load_monitor`: throughput window, load percentage and level
//! - `rate_limiter`: per-player counters, load-scaled caps, action cooldowns
//! - `batcher`: per-player FIFO queues for event-driven lines
//! - `sync_engine`: per-pair caches and the diff
//! - `priority`: leaderboard tiers and load-based skipping
//! - `transform`: per-player display names and score offsets
//! - `custom`: per-player sidebars shown ahead of the server boards
//! - `totals`: server-wide `total_*` leaderboards built from player stats
//! - `service`: [`service::ScoreboardSync`], which owns all of the above
//!
//! ### Host Seams
//! - `host`: the transport, snapshot source and liveness traits
//! - `clock`: wall clock and a manual clock for tests
//! - `config`: JSON-loadable tuning with defaults for every knob
//! - `error`: rejections and sync errors
//!
//! ### Demo Host
//! - `scoreboard`: in-memory authoritative leaderboards
//! - `client_manager`: UDP session registry and timeouts
//! - `network`: the UDP server loop that drives the sync core
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::SyncConfig;
//! use server::network::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 20Hz ticks, at most 32 clients, default sync tuning
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         Duration::from_millis(50),
//!         32,
//!         SyncConfig::default(),
//!     )
//!     .await?
//!     .with_churn(4);
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! The server runs an event-driven loop with internal async tasks:
//! - **Network Receiver**: decodes incoming packets
//! - **Network Sender**: drains the outbound queue onto the socket
//! - **Timeout Checker**: drops clients that stopped sending heartbeats
//! - **Main Loop**: handles packets and runs the sync tick

pub mod batcher;
pub mod client_manager;
pub mod clock;
pub mod config;
pub mod custom;
pub mod error;
pub mod host;
pub mod load_monitor;
pub mod network;
pub mod priority;
pub mod rate_limiter;
pub mod scoreboard;
pub mod service;
pub mod sync_engine;
pub mod totals;
pub mod transform;
