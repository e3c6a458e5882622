//! # Race Client Library
//!
//! This library runs the client side of a race session over UDP. A client
//! talks to the master only: it asks to join, publishes its own vehicle,
//! stats and hits, and learns about everyone else through the master's
//! relays.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`network::ClientTransport`] implements the session engine's
//! `NetworkInterface` on a UDP socket bound to an ephemeral port. Datagrams
//! from any address other than the master are ignored.
//!
//! ### Input Module (`input`)
//! Console commands typed by the player. Plain lines are chat; lines starting
//! with `/` publish stats, report hits or inspect the session.
//!
//! ### Host Module (`host`)
//! [`host::ClientHost`] owns the session, ticks it at a fixed rate and
//! applies console commands between ticks.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::host::ClientHost;
//! use client::network::ClientTransport;
//! use session::SessionConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = ClientTransport::connect("127.0.0.1:9530").await?;
//!     let mut config = SessionConfig::client();
//!     config.player_name = "Ace".to_string();
//!
//!     let mut host = ClientHost::new(config, transport, Duration::from_millis(16))?;
//!     host.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Never Block The Frame
//! Socket I/O and console reads happen in spawned tasks. The tick loop only
//! drains what they already delivered, so a slow network never stalls a
//! frame.
//!
//! ### Graceful Degradation
//! A refused or unanswered join ends the client with a clear reason. A master
//! that leaves or goes silent ends the session; the results gathered so far
//! are still printed.

pub mod host;
pub mod input;
pub mod network;
