//! Payload layouts the session engine reads and writes itself.
//!
//! Scalars use the fixed-width encoding of [`crate::wire_options`]: a time
//! anchor is exactly four bytes, a stats report twelve, a hit report two, and
//! chat text is a length-prefixed UTF-8 string.

use crate::{wire_options, MessageKind, PlayerIndex};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed payload bound to the [`MessageKind`] it travels under.
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: MessageKind;

    fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        wire_options().serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        wire_options().deserialize(bytes)
    }
}

/// Master's simulation clock at the moment of sending, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAnchor {
    pub sim_time: i32,
}

impl Payload for TimeAnchor {
    const KIND: MessageKind = MessageKind::TimeAnchor;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainElementStats {
    pub finish_time: i32,
    pub best_lap: i32,
    pub laps: i32,
}

impl Payload for MainElementStats {
    const KIND: MessageKind = MessageKind::MainElementStats;
}

/// `victim` was hit by a missile or mine fired by `attacker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitReport {
    pub attacker: PlayerIndex,
    pub victim: PlayerIndex,
}

impl Payload for HitReport {
    const KIND: MessageKind = MessageKind::Hit;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

impl Payload for ChatText {
    const KIND: MessageKind = MessageKind::Chat;
}

/// Identifies the element class the simulation must instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactoryId {
    pub dll: u16,
    pub class: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainElementCreation {
    pub factory: FactoryId,
    pub room: i32,
    pub craft_model: u8,
    pub snapshot: Vec<u8>,
}

impl Payload for MainElementCreation {
    const KIND: MessageKind = MessageKind::MainElementCreate;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoElementCreation {
    pub element: u32,
    pub factory: FactoryId,
    pub room: i32,
    pub snapshot: Vec<u8>,
}

impl Payload for AutoElementCreation {
    const KIND: MessageKind = MessageKind::AutoElementCreate;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermElementState {
    pub perm_id: u32,
    pub room: i32,
    pub snapshot: Vec<u8>,
}

impl Payload for PermElementState {
    const KIND: MessageKind = MessageKind::PermElementState;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainElementState {
    pub snapshot: Vec<u8>,
}

impl Payload for MainElementState {
    const KIND: MessageKind = MessageKind::MainElementState;
}

/// Admission handshake and roster announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMessage {
    Request {
        protocol_version: u32,
        name: String,
        minor_id: Option<u32>,
        craft_model: u8,
    },
    /// `player_id` is the newcomer's stable id; it may present it as
    /// `minor_id` to reclaim its seat after a disconnect.
    Accepted {
        player: PlayerIndex,
        player_id: u32,
        major_id: u32,
        sim_time: i64,
        laps: u8,
    },
    Refused {
        reason: String,
    },
    Announce {
        player: PlayerIndex,
        player_id: u32,
        name: String,
    },
    /// A result already on the board, replayed to a newcomer. `connected`
    /// is false for participants that have left; their `player` index may
    /// belong to someone else by now.
    Standing {
        player: PlayerIndex,
        player_id: u32,
        name: String,
        craft_model: u8,
        connected: bool,
        finish_time: i32,
        best_lap: i32,
        laps: i32,
    },
    HitTally {
        player: PlayerIndex,
        player_id: u32,
        name: String,
        connected: bool,
        hits_landed: u32,
        times_hit: u32,
    },
}

impl Payload for JoinMessage {
    const KIND: MessageKind = MessageKind::Join;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_anchor_is_four_bytes() {
        let bytes = TimeAnchor { sim_time: -13_000 }.encode().unwrap();
        assert_eq!(bytes, (-13_000i32).to_le_bytes().to_vec());
        assert_eq!(TimeAnchor::decode(&bytes).unwrap().sim_time, -13_000);
    }

    #[test]
    fn test_stats_are_three_i32() {
        let stats = MainElementStats {
            finish_time: 1150,
            best_lap: 370,
            laps: 3,
        };
        let bytes = stats.encode().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &1150i32.to_le_bytes());
        assert_eq!(MainElementStats::decode(&bytes).unwrap(), stats);
    }

    #[test]
    fn test_hit_report_is_two_bytes() {
        let hit = HitReport {
            attacker: PlayerIndex(1),
            victim: PlayerIndex::HOST,
        };
        let bytes = hit.encode().unwrap();
        assert_eq!(bytes, vec![1, 255]);
    }

    #[test]
    fn test_chat_is_length_prefixed() {
        let bytes = ChatText {
            text: "gg".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[0..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..], b"gg");
    }

    #[test]
    fn test_longest_chat_line_fits_a_datagram() {
        let chat = ChatText {
            text: "x".repeat(crate::MAX_CHAT_BYTES),
        };
        let packet = crate::Packet::new(MessageKind::Chat, Some(PlayerIndex(3)), chat.encode().unwrap());
        assert!(packet.encode().unwrap().len() <= crate::MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_chat_rejects_invalid_utf8() {
        let mut bytes = 2u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xC3, 0x28]);
        assert!(ChatText::decode(&bytes).is_err());
    }

    #[test]
    fn test_payload_kinds() {
        assert_eq!(TimeAnchor::KIND, MessageKind::TimeAnchor);
        assert_eq!(JoinMessage::KIND, MessageKind::Join);
        assert_eq!(PermElementState::KIND, MessageKind::PermElementState);
    }

    #[test]
    fn test_stats_reject_short_payload() {
        assert!(MainElementStats::decode(&[0, 0, 0, 0]).is_err());
    }
}
