//! Session registry for the UDP server
//!
//! Maps each connected client to the [`Identity`] the sync core keys its
//! state by, tracks the address replies go to, and times out silent clients.
//! The registry is shared between the main loop, the timeout checker and the
//! outbound transport, so it is internally synchronized.

use crate::host::LivenessOracle;
use dashmap::DashMap;
use log::info;
use shared::Identity;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Clients silent for longer than this are dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Client {
    pub id: Identity,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Timestamp carried by the most recent heartbeat
    pub last_heartbeat: u64,
}

impl Client {
    pub fn new(id: Identity, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_heartbeat: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct ClientManager {
    clients: DashMap<Identity, Client>,
    next_client_id: AtomicU64,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            max_clients,
        }
    }

    /// Registers a client, or returns `None` when the server is full.
    /// Identities are never reused.
    pub fn add_client(&self, addr: SocketAddr) -> Option<Identity> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = Identity(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    pub fn remove_client(&self, client_id: Identity) -> bool {
        if let Some((_, client)) = self.clients.remove(&client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<Identity> {
        self.clients
            .iter()
            .find(|client| client.addr == addr)
            .map(|client| *client.key())
    }

    pub fn addr_of(&self, client_id: Identity) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    /// Marks the client as alive. Returns false for unknown clients.
    pub fn touch(&self, client_id: Identity) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(mut client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    pub fn record_heartbeat(&self, client_id: Identity, timestamp: u64) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(mut client) => {
                client.touch();
                client.last_heartbeat = timestamp;
                true
            }
            None => false,
        }
    }

    /// Removes and returns every client silent for longer than `timeout`.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<Identity> {
        let timed_out: Vec<Identity> = self
            .clients
            .iter()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| *client.key())
            .collect();

        for client_id in &timed_out {
            self.remove_client(*client_id);
        }

        timed_out
    }

    pub fn get_client_addrs(&self) -> Vec<(Identity, SocketAddr)> {
        self.clients
            .iter()
            .map(|client| (*client.key(), client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl LivenessOracle for ClientManager {
    fn is_connected(&self, identity: Identity) -> bool {
        self.clients.contains_key(&identity)
    }
}
