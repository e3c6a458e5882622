//! Client-side UDP transport: a single peer, the master.

use log::{debug, error, info, warn};
use session::{Inbound, NetworkInterface, Target, MASTER_HANDLE};
use shared::{Packet, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub struct ClientTransport {
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<Packet>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientTransport {
    pub async fn connect(server_addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.ip().is_loopback() {
            "127.0.0.1:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Talking to master {} from {}", server_addr, local_addr);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        spawn_network_receiver(Arc::clone(&socket), server_addr, inbound_tx);
        spawn_network_sender(socket, server_addr, outbound_rx);

        Ok(ClientTransport {
            server_addr,
            local_addr,
            inbound_rx,
            outbound_tx,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl NetworkInterface for ClientTransport {
    /// Everything goes to the master, which relays it further.
    fn send(&mut self, packet: Packet, _target: Target) {
        match packet.encode() {
            Ok(data) => {
                if let Err(e) = self.outbound_tx.send(data) {
                    error!("Failed to queue packet for sending: {}", e);
                }
            }
            Err(e) => error!("Failed to encode {:?} packet: {}", packet.kind, e),
        }
    }

    fn poll_inbound(&mut self, max: usize) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        while inbound.len() < max {
            match self.inbound_rx.try_recv() {
                Ok(packet) => inbound.push(Inbound {
                    handle: MASTER_HANDLE,
                    packet,
                }),
                Err(_) => break,
            }
        }
        inbound
    }
}

fn spawn_network_receiver(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<Packet>,
) {
    tokio::spawn(async move {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((_, addr)) if addr != server_addr => {
                    debug!("Ignoring datagram from stranger {}", addr);
                }
                Ok((len, _)) => match Packet::decode(&buffer[..len]) {
                    Ok(packet) => {
                        if inbound_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to decode datagram from the master: {}", e),
                },
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });
}

fn spawn_network_sender(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::spawn(async move {
        while let Some(data) = outbound_rx.recv().await {
            if let Err(e) = socket.send_to(&data, server_addr).await {
                error!("Failed to send packet to {}: {}", server_addr, e);
            }
        }
    });
}
