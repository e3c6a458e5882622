//! Master-side UDP transport
//!
//! A receiver task decodes datagrams and hands them to the tick loop through
//! an unbounded channel; a sender task drains the outgoing queue onto the
//! socket. The peer table mapping socket addresses to transport handles lives
//! on the tick side, so neither task needs a lock.

use bincode::Options;
use log::{debug, error, info, warn};
use session::{Inbound, NetworkInterface, Target, TransportHandle};
use shared::{wire_options, Packet, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Peers silent for this long are dropped from the broadcast list.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages sent from the receiver task to the tick loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
}

/// Messages sent from the tick loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendDatagram { data: Vec<u8>, addr: SocketAddr },
}

#[derive(Debug)]
struct Peer {
    handle: TransportHandle,
    last_heard: Instant,
}

pub struct UdpTransport {
    local_addr: SocketAddr,
    peers: HashMap<SocketAddr, Peer>,
    next_handle: u32,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        spawn_network_receiver(Arc::clone(&socket), server_tx);
        spawn_network_sender(socket, game_rx);

        Ok(UdpTransport {
            local_addr,
            peers: HashMap::new(),
            next_handle: 1,
            server_rx,
            game_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn handle_for(&mut self, addr: SocketAddr) -> TransportHandle {
        let now = Instant::now();
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_heard = now;
            return peer.handle;
        }

        let handle = TransportHandle(self.next_handle);
        self.next_handle += 1;
        debug!("New peer {} on {}", addr, handle);
        self.peers.insert(
            addr,
            Peer {
                handle,
                last_heard: now,
            },
        );
        handle
    }

    fn prune_silent_peers(&mut self) {
        let now = Instant::now();
        self.peers.retain(|addr, peer| {
            let alive = now.duration_since(peer.last_heard) <= PEER_TIMEOUT;
            if !alive {
                debug!("Dropping silent peer {} ({})", addr, peer.handle);
            }
            alive
        });
    }

    fn addresses(&self, target: Target) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, peer)| match target {
                Target::All => true,
                Target::AllExcept(excluded) => peer.handle != excluded,
                Target::One(only) => peer.handle == only,
            })
            .map(|(addr, _)| *addr)
            .collect()
    }
}

impl NetworkInterface for UdpTransport {
    fn send(&mut self, packet: Packet, target: Target) {
        let data = match packet.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode {:?} packet: {}", packet.kind, e);
                return;
            }
        };

        for addr in self.addresses(target) {
            if let Err(e) = self.game_tx.send(GameMessage::SendDatagram {
                data: data.clone(),
                addr,
            }) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    fn poll_inbound(&mut self, max: usize) -> Vec<Inbound> {
        self.prune_silent_peers();

        let mut inbound = Vec::new();
        while inbound.len() < max {
            match self.server_rx.try_recv() {
                Ok(ServerMessage::PacketReceived { packet, addr }) => {
                    let handle = self.handle_for(addr);
                    inbound.push(Inbound { handle, packet });
                }
                Err(_) => break,
            }
        }
        inbound
    }
}

/// Spawns task that continuously listens for incoming packets
fn spawn_network_receiver(socket: Arc<UdpSocket>, server_tx: mpsc::UnboundedSender<ServerMessage>) {
    tokio::spawn(async move {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => match wire_options().deserialize::<Packet>(&buffer[..len]) {
                    Ok(packet) => {
                        if let Err(e) = server_tx.send(ServerMessage::PacketReceived { packet, addr }) {
                            error!("Failed to send packet to tick loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to decode datagram from {}: {}", addr, e),
                },
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });
}

/// Spawns task that processes outgoing packet queue
fn spawn_network_sender(socket: Arc<UdpSocket>, mut game_rx: mpsc::UnboundedReceiver<GameMessage>) {
    tokio::spawn(async move {
        while let Some(message) = game_rx.recv().await {
            match message {
                GameMessage::SendDatagram { data, addr } => {
                    if let Err(e) = socket.send_to(&data, addr).await {
                        error!("Failed to send packet to {}: {}", addr, e);
                    }
                }
            }
        }
    });
}
