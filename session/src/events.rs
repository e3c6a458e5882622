use crate::registry::EntityHandle;
use crate::transport::TransportHandle;
use shared::{AutoElementCreation, MainElementCreation, MainElementState, PermElementState, PlayerIndex};

/// Everything a tick asks the host to act on, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The master admitted this client under `player`.
    Joined {
        player: PlayerIndex,
    },
    PlayerJoined {
        player: PlayerIndex,
        name: String,
    },
    PlayerLeft {
        player: PlayerIndex,
        name: String,
    },
    /// Instantiate a remote participant's vehicle.
    SpawnMainElement {
        player: PlayerIndex,
        creation: MainElementCreation,
    },
    SpawnAutoElement {
        origin: PlayerIndex,
        creation: AutoElementCreation,
    },
    UpdateMainElement {
        player: PlayerIndex,
        character: Option<EntityHandle>,
        state: MainElementState,
    },
    UpdatePermElement {
        state: PermElementState,
    },
    /// Destroy an entity that belonged to a departed participant.
    RemoveEntity {
        player: PlayerIndex,
        entity: EntityHandle,
    },
    ResultUpdated {
        player: PlayerIndex,
        rank: usize,
    },
    HitRecorded {
        attacker: PlayerIndex,
        victim: PlayerIndex,
    },
    ChatReceived {
        from: PlayerIndex,
        text: String,
    },
    ProtocolViolation {
        handle: TransportHandle,
        player: Option<PlayerIndex>,
        reason: String,
    },
    /// A peer kept sending malformed traffic. Raised each time its count
    /// reaches a multiple of the configured threshold.
    RepeatedViolations {
        handle: TransportHandle,
        player: Option<PlayerIndex>,
        count: u32,
    },
    /// The join handshake was refused or never answered.
    ConnectionFailed {
        reason: String,
    },
    /// The master ended the session.
    ConnectionLost,
}
