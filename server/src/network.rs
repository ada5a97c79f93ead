//! Server network layer: UDP plumbing around the sync service
//!
//! The main loop owns packet handling and the sync tick. Three spawned tasks
//! do the I/O: a receiver that decodes datagrams, a sender that drains the
//! outbound queue, and a timeout checker that drops silent clients. Score and
//! display packets produced by the sync core go through [`ChannelTransport`],
//! which only enqueues, so a tick never waits on the socket.

use crate::client_manager::{ClientManager, CLIENT_TIMEOUT};
use crate::clock::SystemClock;
use crate::config::{AutoTransformConfig, SyncConfig};
use crate::error::SyncError;
use crate::host::Transport;
use crate::scoreboard::ScoreboardStore;
use crate::service::ScoreboardSync;
use crate::totals::{StatsAggregator, TotalsSource};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{Identity, Packet, ScoreUpdate};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Leaderboards the demo store starts with.
pub const DEMO_LEADERBOARDS: &[&str] = &["playerKillCount", "deaths", "score", "totalPlayTime"];

#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: Identity,
    },
    #[allow(dead_code)]
    Shutdown,
}

#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Transport that turns score lines into packets on the outbound queue.
/// Lines for clients that are already gone are dropped.
pub struct ChannelTransport {
    clients: Arc<ClientManager>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new(clients: Arc<ClientManager>, out_tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { clients, out_tx }
    }

    fn queue(&self, identity: Identity, packet: Packet) -> Result<(), SyncError> {
        let Some(addr) = self.clients.addr_of(identity) else {
            return Ok(());
        };
        self.out_tx
            .send(OutboundMessage::SendPacket { packet, addr })
            .map_err(|_| SyncError::TransportClosed)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, identity: Identity, update: &ScoreUpdate) -> Result<(), SyncError> {
        self.queue(identity, Packet::Score(update.clone()))
    }

    fn display(
        &self,
        identity: Identity,
        leaderboard: Option<&str>,
        title: &str,
        reset: bool,
    ) -> Result<(), SyncError> {
        self.queue(
            identity,
            Packet::Display {
                leaderboard: leaderboard.map(str::to_string),
                title: title.to_string(),
                reset,
            },
        )
    }
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<ClientManager>,
    store: Arc<ScoreboardStore>,
    stats: Arc<StatsAggregator>,
    sync: ScoreboardSync,
    tick_duration: Duration,
    tick: u64,
    churn_per_tick: usize,
    rng: StdRng,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_clients: usize,
        config: SyncConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let clients = Arc::new(ClientManager::new(max_clients));
        let store = Arc::new(ScoreboardStore::new());
        let stats = Arc::new(StatsAggregator::new());
        for leaderboard in DEMO_LEADERBOARDS {
            store.create_leaderboard(leaderboard)?;
            stats.enable_stat(leaderboard)?;
        }

        let transport = Arc::new(ChannelTransport::new(clients.clone(), out_tx.clone()));
        let source = Arc::new(TotalsSource::new(store.clone(), stats.clone()));
        let sync = ScoreboardSync::new(
            config,
            transport,
            source,
            clients.clone(),
            Arc::new(SystemClock),
        );

        Ok(Server {
            socket,
            clients,
            store,
            stats,
            sync,
            tick_duration,
            tick: 0,
            churn_per_tick: 0,
            rng: StdRng::from_entropy(),
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    /// Random score changes applied each tick so idle demos have traffic.
    pub fn with_churn(mut self, changes_per_tick: usize) -> Self {
        self.churn_per_tick = changes_per_tick;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn store(&self) -> &Arc<ScoreboardStore> {
        &self.store
    }

    pub fn sync(&self) -> &ScoreboardSync {
        &self.sync
    }

    /// Installs new auto transform rules and re-applies them to every
    /// connected client.
    pub fn reload_auto_transforms(&self, config: AutoTransformConfig) -> Result<(), SyncError> {
        let online: Vec<Identity> = self
            .clients
            .get_client_addrs()
            .into_iter()
            .map(|(client_id, _)| client_id)
            .collect();
        self.sync.reload_auto_transforms(config, &online)
    }

    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(OutboundMessage::SendPacket { packet, addr }) = out_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                for client_id in clients.check_timeouts(CLIENT_TIMEOUT) {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), SyncError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Connect { client_version } = packet {
            self.handle_connect(client_version, addr);
            return;
        }

        let Some(client_id) = self.clients.find_client_by_addr(addr) else {
            debug!("Ignoring packet from unknown address {}", addr);
            return;
        };

        match packet {
            Packet::Subscribe { leaderboard } => {
                self.clients.touch(client_id);
                let target = (!leaderboard.is_empty()).then_some(leaderboard.as_str());
                match self.sync.set_display(client_id, target) {
                    Ok(()) => {}
                    Err(SyncError::Rejected(rejection)) => {
                        warn!("Rejected subscription from {}: {}", client_id, rejection);
                    }
                    Err(e) => error!("Failed to switch display for {}: {}", client_id, e),
                }
            }
            Packet::Heartbeat { timestamp } => {
                self.clients.record_heartbeat(client_id, timestamp);
            }
            Packet::Action { kind } => {
                self.clients.touch(client_id);
                let cooldown = self.sync.action_cooldown_ms(&kind);
                let accepted = self.sync.try_perform_action(client_id, &kind, cooldown);
                if !accepted {
                    debug!("{} action {:?} on cooldown", client_id, kind);
                }
                self.send_packet(Packet::ActionResult { kind, accepted }, addr);
            }
            Packet::Disconnect => {
                self.clients.remove_client(client_id);
                self.sync.disconnect(client_id);
            }
            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    fn handle_connect(&mut self, client_version: u32, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );

        // A reconnect from the same address replaces the old session.
        if let Some(existing_id) = self.clients.find_client_by_addr(addr) {
            info!("Removing existing client {} from {}", existing_id, addr);
            self.clients.remove_client(existing_id);
            self.sync.disconnect(existing_id);
        }

        if client_version != shared::PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: format!(
                        "Protocol version {} not supported (server speaks {})",
                        client_version,
                        shared::PROTOCOL_VERSION
                    ),
                },
                addr,
            );
            return;
        }

        match self.clients.add_client(addr) {
            Some(client_id) => {
                if let Err(e) = self.sync.connect(client_id) {
                    error!("Failed to register {} with sync core: {}", client_id, e);
                    self.clients.remove_client(client_id);
                    return;
                }
                self.send_packet(
                    Packet::Connected {
                        client_id: client_id.0,
                    },
                    addr,
                );
            }
            None => {
                self.send_packet(
                    Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                    addr,
                );
            }
        }
    }

    /// Feeds churned scores into the totals and the event-driven path of
    /// every client that is displaying the changed leaderboard.
    fn apply_churn(&mut self) {
        if self.churn_per_tick == 0 {
            return;
        }
        let players: Vec<String> = (1..=8).map(|i| format!("Player{}", i)).collect();
        let updates = self
            .store
            .churn(&mut self.rng, &players, self.churn_per_tick);

        let watchers: Vec<(Identity, Option<String>)> = self
            .clients
            .get_client_addrs()
            .into_iter()
            .map(|(client_id, _)| (client_id, self.sync.displayed(client_id)))
            .collect();

        for update in updates {
            if let Err(e) = self
                .stats
                .record(&update.entry, &update.leaderboard, update.value)
            {
                warn!("Dropped statistic for {}: {}", update.entry, e);
            }
            for (client_id, displayed) in &watchers {
                if displayed.as_deref() != Some(update.leaderboard.as_str()) {
                    continue;
                }
                if let Err(e) = self.sync.push_update(*client_id, update.clone()) {
                    debug!("Queued update for {} not accepted: {}", client_id, e);
                }
            }
        }
    }

    fn run_tick(&mut self, dt: f32) {
        self.tick += 1;
        if dt > 0.0 {
            self.sync.notify_tps((1.0 / dt).round() as u32);
        }

        self.apply_churn();

        match self.sync.tick() {
            Ok(report) => {
                // Periodic performance monitoring
                if self.tick % 60 == 0 && !self.clients.is_empty() {
                    debug!(
                        "Tick {}: {} clients, {:.1}Hz, load {}% ({}), {} pairs synced, {} skipped, {} updates, {} throttled",
                        self.tick,
                        self.clients.len(),
                        1.0 / dt,
                        report.load_percent,
                        report.level,
                        report.synced,
                        report.skipped,
                        report.updates,
                        report.throttled
                    );
                }
            }
            Err(e) => error!("Sync tick {} failed: {}", self.tick, e),
        }

        if self.tick % 600 == 0 {
            info!("{}", self.sync.load().statistics());
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            self.sync.disconnect(client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;
                    self.run_tick(dt);
                },
            }
        }

        Ok(())
    }
}
