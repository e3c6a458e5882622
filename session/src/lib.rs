//! # Race Session Engine
//!
//! This library keeps a group of racing game instances in agreement about one
//! race: who takes part, where every vehicle is, what time it is on the shared
//! race clock, and who finished where. One instance acts as the master; every
//! other instance is a client that talks only to the master.
//!
//! ## Core Responsibilities
//!
//! ### Session Control
//! [`Session`] is the single entry point. The host creates it in a role,
//! calls [`Session::tick`] once per frame and acts on the returned
//! [`SessionEvent`]s. Inbound traffic is buffered by the transport and only
//! touched from inside a tick, so the engine never needs a lock.
//!
//! ### Membership
//! The master seats joining clients in the lowest free player index, replays
//! the session history to late joiners and reclaims slots whose owners went
//! silent. A client mirrors the master's seating.
//!
//! ### Replication
//! Vehicle creations are sent once and remembered; state snapshots pass
//! through a per-element throttle that skips unchanged snapshots and never
//! sends faster than the configured interval.
//!
//! ### Shared Clock
//! The master stamps its race clock into time anchors on two independent
//! cadences. Clients walk toward each anchor in bounded steps, so the clock
//! never jumps mid-race.
//!
//! ### Results
//! Every participant keeps its own sorted copy of the results and hit
//! statistics, fed by the same relayed reports, so all copies agree.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Message dispatch, relaying on the master, the join handshake and every
//! host-facing operation.
//!
//! ### Registry Module (`registry`)
//! Fixed-capacity slot map from player index to participant.
//!
//! ### Replicator Module (`replicator`)
//! Creation memory for replay and the per-element state throttle.
//!
//! ### Clock Module (`clock`)
//! Anchor cadences on the master and bounded correction on clients.
//!
//! ### Ledger Module (`ledger`)
//! Finish order and hit counts.
//!
//! ### Transport Module (`transport`)
//! The [`NetworkInterface`] seam and an in-process [`MemoryHub`] used by the
//! tests.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use session::{MemoryHub, Session, SessionConfig};
//!
//! let hub = MemoryHub::new();
//! let mut master = Session::new(SessionConfig::master(0x5eed, 1), hub.master())?;
//! let mut client = Session::new(SessionConfig::client(), hub.connect())?;
//!
//! loop {
//!     for event in master.tick(16) {
//!         println!("master: {:?}", event);
//!     }
//!     for event in client.tick(16) {
//!         println!("client: {:?}", event);
//!     }
//! }
//! # Ok::<(), session::SessionError>(())
//! ```

pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod replicator;
pub mod rules;
pub mod session;
pub mod transport;

pub use chat::{ChatComposer, ChatLine};
pub use config::{Role, SessionConfig};
pub use error::{Result, SessionError};
pub use events::SessionEvent;
pub use ledger::{HitEntry, ResultEntry};
pub use registry::{ClientSlot, EntityHandle};
pub use rules::{GameOptions, RaceRules};
pub use session::{ConnectionState, Session};
pub use transport::{
    Inbound, MemoryHub, MemoryNetwork, NetworkInterface, Target, TransportHandle, MASTER_HANDLE,
};
