//! UDP session with the scoreboard server.
//!
//! Connects, asks for a leaderboard once the server acknowledges us, keeps the
//! session alive with heartbeats and folds every sidebar packet into a
//! [`ScoreboardView`].

use crate::view::{ScoreboardView, ViewChange};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Identity, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout};

/// Well under the server's five second client timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    leaderboard: String,
    client_id: Option<Identity>,
    connected: bool,
    view: ScoreboardView,
    print_sidebar: bool,
    last_action: Option<(String, bool)>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        leaderboard: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            leaderboard: leaderboard.to_string(),
            client_id: None,
            connected: false,
            view: ScoreboardView::new(),
            print_sidebar: false,
            last_action: None,
        })
    }

    /// Print the sidebar to stdout whenever it changes.
    pub fn with_sidebar_output(mut self, enabled: bool) -> Self {
        self.print_sidebar = enabled;
        self
    }

    pub fn view(&self) -> &ScoreboardView {
        &self.view
    }

    pub fn client_id(&self) -> Option<Identity> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Outcome of the most recent action request, if any came back.
    pub fn last_action(&self) -> Option<&(String, bool)> {
        self.last_action.as_ref()
    }

    pub async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server at {}...", self.server_addr);
        self.send_packet(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
        })
        .await
    }

    /// Switches the sidebar. An empty name clears it.
    pub async fn subscribe(&mut self, leaderboard: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.leaderboard = leaderboard.to_string();
        if !self.connected {
            return Ok(());
        }
        self.send_packet(&Packet::Subscribe {
            leaderboard: leaderboard.to_string(),
        })
        .await
    }

    pub async fn request_action(&self, kind: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::Action {
            kind: kind.to_string(),
        })
        .await
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connected {
            self.send_packet(&Packet::Disconnect).await?;
            self.connected = false;
            self.client_id = None;
        }
        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.connected {
            return Ok(());
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis() as u64;
        self.send_packet(&Packet::Heartbeat { timestamp }).await
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(Identity(*client_id));
                self.connected = true;
                if !self.leaderboard.is_empty() {
                    let leaderboard = self.leaderboard.clone();
                    self.subscribe(&leaderboard).await?;
                }
            }
            Packet::Display { .. } | Packet::Score(_) => {
                if self.view.apply(packet) != ViewChange::Ignored && self.print_sidebar {
                    println!("{}", self.view.render());
                }
            }
            Packet::ActionResult { kind, accepted } => {
                debug!("Action {} accepted: {}", kind, accepted);
                self.last_action = Some((kind.clone(), *accepted));
            }
            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
            }
            _ => {
                warn!("Unexpected packet type");
            }
        }
        Ok(())
    }

    /// Waits up to `wait` for one packet and applies it. Returns the packet,
    /// or `None` on timeout or an undecodable datagram.
    pub async fn poll(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Packet>, Box<dyn std::error::Error>> {
        let mut buffer = [0u8; 2048];
        let (len, _) = match timeout(wait, self.socket.recv_from(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };

        match deserialize::<Packet>(&buffer[..len]) {
            Ok(packet) => {
                self.handle_packet(&packet).await?;
                Ok(Some(packet))
            }
            Err(e) => {
                warn!("Failed to deserialize packet: {}", e);
                Ok(None)
            }
        }
    }

    /// Runs until Ctrl-C, the server drops us, or `duration` elapses.
    pub async fn run(
        &mut self,
        duration: Option<Duration>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
        let deadline = sleep(duration.unwrap_or(Duration::from_secs(365 * 24 * 3600)));
        tokio::pin!(deadline);
        let mut buffer = [0u8; 2048];
        let mut was_connected = false;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => match deserialize::<Packet>(&buffer[..len]) {
                            Ok(packet) => {
                                if let Err(e) = self.handle_packet(&packet).await {
                                    error!("Error handling packet: {}", e);
                                }
                            }
                            Err(e) => warn!("Failed to deserialize packet: {}", e),
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        error!("Error sending heartbeat: {}", e);
                    }
                },

                _ = &mut deadline => {
                    info!("Run time elapsed");
                    break;
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                },
            }

            if self.connected {
                was_connected = true;
            } else if was_connected {
                break;
            }
        }

        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ScoreUpdate;

    async fn offline_client() -> Client {
        Client::new("127.0.0.1:9", "").await.unwrap()
    }

    #[test]
    fn test_connected_and_disconnected() {
        tokio_test::block_on(async {
            let mut client = offline_client().await;
            client
                .handle_packet(&Packet::Connected { client_id: 7 })
                .await
                .unwrap();
            assert!(client.is_connected());
            assert_eq!(client.client_id(), Some(Identity(7)));

            client
                .handle_packet(&Packet::Disconnected {
                    reason: "Server full".to_string(),
                })
                .await
                .unwrap();
            assert!(!client.is_connected());
            assert_eq!(client.client_id(), None);
        });
    }

    #[test]
    fn test_sidebar_packets_reach_view() {
        tokio_test::block_on(async {
            let mut client = offline_client().await;
            client
                .handle_packet(&Packet::Display {
                    leaderboard: Some("kills".to_string()),
                    title: "Kills".to_string(),
                    reset: true,
                })
                .await
                .unwrap();
            client
                .handle_packet(&Packet::Score(ScoreUpdate::change("kills", "alice", 3)))
                .await
                .unwrap();
            assert_eq!(client.view().score("alice"), Some(3));
        });
    }

    #[test]
    fn test_action_result_is_remembered() {
        tokio_test::block_on(async {
            let mut client = offline_client().await;
            assert!(client.last_action().is_none());
            client
                .handle_packet(&Packet::ActionResult {
                    kind: "gui".to_string(),
                    accepted: false,
                })
                .await
                .unwrap();
            assert_eq!(client.last_action(), Some(&("gui".to_string(), false)));
        });
    }

    #[test]
    fn test_poll_times_out_quietly() {
        tokio_test::block_on(async {
            let mut client = offline_client().await;
            let packet = client.poll(Duration::from_millis(10)).await.unwrap();
            assert!(packet.is_none());
        });
    }

    #[test]
    fn test_subscribe_before_connect_only_remembers() {
        tokio_test::block_on(async {
            let mut client = offline_client().await;
            client.subscribe("deaths").await.unwrap();
            assert_eq!(client.leaderboard, "deaths");
            assert!(!client.is_connected());
        });
    }
}
