//! The seam between the session engine and whatever moves packets.
//!
//! A transport buffers received packets until [`NetworkInterface::poll_inbound`]
//! drains them from inside a tick, and queues outgoing ones without blocking.
//! Retrying reliable kinds (see [`shared::MessageKind::is_reliable`]) is the
//! transport's job.

use shared::Packet;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque connection id assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(pub u32);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    AllExcept(TransportHandle),
    One(TransportHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub handle: TransportHandle,
    pub packet: Packet,
}

pub trait NetworkInterface {
    fn send(&mut self, packet: Packet, target: Target);

    /// Hands over at most `max` buffered packets, oldest first.
    fn poll_inbound(&mut self, max: usize) -> Vec<Inbound>;
}

/// Handle under which a client endpoint sees the master.
pub const MASTER_HANDLE: TransportHandle = TransportHandle(0);

#[derive(Debug, Default)]
struct Exchange {
    master_inbox: VecDeque<Inbound>,
    client_inboxes: BTreeMap<u32, VecDeque<Inbound>>,
    severed: HashSet<u32>,
    next_client: u32,
}

/// In-process star network: one master endpoint and any number of client
/// endpoints, delivering in order and without loss.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    exchange: Arc<Mutex<Exchange>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master(&self) -> MemoryNetwork {
        MemoryNetwork {
            exchange: Arc::clone(&self.exchange),
            endpoint: Endpoint::Master,
        }
    }

    pub fn connect(&self) -> MemoryNetwork {
        let mut exchange = lock(&self.exchange);
        exchange.next_client += 1;
        let id = exchange.next_client;
        exchange.client_inboxes.insert(id, VecDeque::new());

        MemoryNetwork {
            exchange: Arc::clone(&self.exchange),
            endpoint: Endpoint::Client(id),
        }
    }

    /// Silently drops all further traffic to and from `endpoint`, as a pulled
    /// cable would.
    pub fn sever(&self, endpoint: &MemoryNetwork) {
        if let Endpoint::Client(id) = endpoint.endpoint {
            let mut exchange = lock(&self.exchange);
            exchange.severed.insert(id);
            exchange.client_inboxes.remove(&id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Master,
    Client(u32),
}

#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    exchange: Arc<Mutex<Exchange>>,
    endpoint: Endpoint,
}

impl MemoryNetwork {
    /// Handle the master uses for this endpoint.
    pub fn handle(&self) -> TransportHandle {
        match self.endpoint {
            Endpoint::Master => MASTER_HANDLE,
            Endpoint::Client(id) => TransportHandle(id),
        }
    }

    pub fn pending(&self) -> usize {
        let exchange = lock(&self.exchange);
        match self.endpoint {
            Endpoint::Master => exchange.master_inbox.len(),
            Endpoint::Client(id) => exchange.client_inboxes.get(&id).map_or(0, VecDeque::len),
        }
    }
}

impl NetworkInterface for MemoryNetwork {
    fn send(&mut self, packet: Packet, target: Target) {
        let mut exchange = lock(&self.exchange);
        match self.endpoint {
            Endpoint::Master => {
                for (id, inbox) in exchange.client_inboxes.iter_mut() {
                    let handle = TransportHandle(*id);
                    let wanted = match target {
                        Target::All => true,
                        Target::AllExcept(excluded) => handle != excluded,
                        Target::One(only) => handle == only,
                    };
                    if wanted {
                        inbox.push_back(Inbound {
                            handle: MASTER_HANDLE,
                            packet: packet.clone(),
                        });
                    }
                }
            }
            Endpoint::Client(id) => {
                if !exchange.severed.contains(&id) {
                    exchange.master_inbox.push_back(Inbound {
                        handle: TransportHandle(id),
                        packet,
                    });
                }
            }
        }
    }

    fn poll_inbound(&mut self, max: usize) -> Vec<Inbound> {
        let mut exchange = lock(&self.exchange);
        let inbox = match self.endpoint {
            Endpoint::Master => Some(&mut exchange.master_inbox),
            Endpoint::Client(id) => exchange.client_inboxes.get_mut(&id),
        };

        match inbox {
            Some(inbox) => {
                let count = inbox.len().min(max);
                inbox.drain(..count).collect()
            }
            None => Vec::new(),
        }
    }
}

fn lock(exchange: &Mutex<Exchange>) -> MutexGuard<'_, Exchange> {
    exchange.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MessageKind;

    fn packet(kind: MessageKind) -> Packet {
        Packet::new(kind, None, Vec::new())
    }

    #[test]
    fn test_client_to_master() {
        let hub = MemoryHub::new();
        let mut master = hub.master();
        let mut client = hub.connect();

        client.send(packet(MessageKind::Join), Target::All);

        let inbound = master.poll_inbound(10);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].handle, client.handle());
    }

    #[test]
    fn test_master_targets() {
        let hub = MemoryHub::new();
        let mut master = hub.master();
        let first = hub.connect();
        let second = hub.connect();

        master.send(packet(MessageKind::TimeAnchor), Target::All);
        master.send(packet(MessageKind::Chat), Target::AllExcept(first.handle()));
        master.send(packet(MessageKind::Join), Target::One(first.handle()));

        assert_eq!(first.pending(), 2);
        assert_eq!(second.pending(), 2);
    }

    #[test]
    fn test_poll_is_bounded_and_ordered() {
        let hub = MemoryHub::new();
        let mut master = hub.master();
        let mut client = hub.connect();

        client.send(packet(MessageKind::Join), Target::All);
        client.send(packet(MessageKind::Chat), Target::All);
        client.send(packet(MessageKind::Leave), Target::All);

        let first = master.poll_inbound(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].packet.kind, MessageKind::Join);
        assert_eq!(first[1].packet.kind, MessageKind::Chat);

        let rest = master.poll_inbound(2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].packet.kind, MessageKind::Leave);
    }

    #[test]
    fn test_severed_endpoint_is_silent() {
        let hub = MemoryHub::new();
        let mut master = hub.master();
        let mut client = hub.connect();

        hub.sever(&client);
        client.send(packet(MessageKind::Chat), Target::All);
        master.send(packet(MessageKind::Chat), Target::All);

        assert_eq!(master.pending(), 0);
        assert!(client.poll_inbound(10).is_empty());
    }
}
