//! Wire protocol shared by every participant of a race session.
//!
//! Everything that crosses the network is a [`Packet`]: a [`MessageKind`], the
//! player index the message originates from (filled in by the master when it
//! relays a client's message), and a payload. Payloads whose layout the session
//! engine interprets live in [`payload`]; vehicle snapshots stay opaque bytes
//! owned by the simulation.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod payload;

pub use payload::{
    AutoElementCreation, ChatText, FactoryId, HitReport, JoinMessage, MainElementCreation,
    MainElementState, MainElementStats, Payload, PermElementState, TimeAnchor,
};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 9530;
pub const MAX_CLIENTS: usize = 10;
pub const MAX_DATAGRAM_SIZE: usize = 2048;

pub const COARSE_ANCHOR_PERIOD_MS: i64 = 12_000;
pub const FINE_ANCHOR_PERIOD_MS: i64 = 8_000;
pub const RACE_COUNTDOWN_MS: i64 = 13_000;

pub const CHAT_EDIT_CAPACITY: usize = 120;
/// Longest chat line, in bytes, that still fits a datagram
pub const MAX_CHAT_BYTES: usize = 1024;
pub const DEFAULT_LAPS: u8 = 5;

/// Stable seat of a participant for the lifetime of a session.
///
/// Remote clients are numbered from 0 by the master; the master's own player
/// travels on the wire as [`PlayerIndex::HOST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerIndex(pub u8);

impl PlayerIndex {
    pub const HOST: PlayerIndex = PlayerIndex(u8::MAX);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PlayerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    MainElementCreate,
    AutoElementCreate,
    PermElementState,
    MainElementState,
    MainElementStats,
    Chat,
    TimeAnchor,
    Hit,
    Join,
    Leave,
}

impl MessageKind {
    /// Kinds the transport must retry until delivered. Everything else is
    /// best-effort and corrected by a later message.
    pub fn is_reliable(self) -> bool {
        !matches!(
            self,
            MessageKind::MainElementState | MessageKind::PermElementState | MessageKind::TimeAnchor
        )
    }
}

/// A single datagram exchanged between the master and a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: MessageKind,
    pub origin: Option<PlayerIndex>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: MessageKind, origin: Option<PlayerIndex>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            origin,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        wire_options().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        wire_options().deserialize(bytes)
    }
}

/// Fixed-width little-endian integers, bounded by the datagram size, no
/// trailing garbage accepted.
pub fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_index_host() {
        assert!(PlayerIndex::HOST.is_host());
        assert!(!PlayerIndex(0).is_host());
        assert_eq!(PlayerIndex(3).as_usize(), 3);
        assert_eq!(PlayerIndex(3).to_string(), "#3");
        assert_eq!(PlayerIndex::HOST.to_string(), "host");
    }

    #[test]
    fn test_reliability_classes() {
        assert!(MessageKind::MainElementCreate.is_reliable());
        assert!(MessageKind::AutoElementCreate.is_reliable());
        assert!(MessageKind::MainElementStats.is_reliable());
        assert!(MessageKind::Join.is_reliable());
        assert!(!MessageKind::MainElementState.is_reliable());
        assert!(!MessageKind::TimeAnchor.is_reliable());
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::new(MessageKind::Hit, Some(PlayerIndex(2)), vec![1, 2]);
        let bytes = packet.encode().unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_packet_rejects_trailing_bytes() {
        let packet = Packet::new(MessageKind::Leave, None, Vec::new());
        let mut bytes = packet.encode().unwrap();
        bytes.push(0xAA);
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_packet_rejects_truncated_data() {
        let packet = Packet::new(MessageKind::Chat, Some(PlayerIndex::HOST), vec![9; 16]);
        let bytes = packet.encode().unwrap();
        assert!(Packet::decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn test_packet_rejects_oversized_length_prefix() {
        // kind = Chat (variant 5), origin = None, payload length = u64::MAX
        let mut bytes = vec![5, 0, 0, 0, 0];
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(Packet::decode(&bytes).is_err());
    }
}
