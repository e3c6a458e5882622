//! # Race Master Server
//!
//! This library hosts the master side of a race session over UDP. The master
//! is the hub every client talks to: it seats joining players, relays their
//! vehicle creations, states, stats, hits and chat to everyone else, and
//! stamps the shared race clock.
//!
//! ## Core Responsibilities
//!
//! ### Transport
//! [`network::UdpTransport`] implements the session engine's
//! `NetworkInterface` on a single UDP socket. Each remote address becomes a
//! transport handle the first time it is heard from; peers that go silent are
//! dropped from the broadcast list.
//!
//! ### Tick Loop
//! [`host::MasterHost`] owns the session and ticks it at a fixed rate. It
//! logs what the session reports and applies the host-side policy for peers
//! that keep sending malformed traffic: they are removed from the session.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Session
//! All session state is touched from the tick loop only. Two spawned tasks
//! own the socket: one decodes incoming datagrams, the other writes outgoing
//! ones. They talk to the tick loop over unbounded channels, which the
//! transport drains without waiting.
//!
//! ### Best-Effort Datagrams
//! Every packet travels as one datagram. Lost creation messages are recovered
//! when the affected client rejoins and receives the replay; lost states and
//! anchors are superseded by the next ones.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::host::MasterHost;
//! use server::network::UdpTransport;
//! use session::SessionConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = UdpTransport::bind("0.0.0.0:9530").await?;
//!     let config = SessionConfig::master(0x5eed, rand::random());
//!
//!     let mut host = MasterHost::new(config, transport, Duration::from_millis(16))?;
//!     host.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod host;
pub mod network;
