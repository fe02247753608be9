//! # Relay Server Library
//!
//! This library provides the relay server for Baby Steps multiplayer
//! sessions. Clients stream their avatar pose, voice, chat and world events
//! to the server, which fans them out to every other connected client while
//! keeping total outbound traffic inside a configured bandwidth budget.
//!
//! ## Core Responsibilities
//!
//! ### Protocol Handling
//! Every game message is one length-prefixed frame (see
//! [`shared::protocol`]). Frames whose declared length does not match the
//! datagram, or whose opcode is unknown, are logged and dropped without
//! affecting the connection.
//!
//! ### Session Management
//! Each accepted peer gets a client id in 0..=254. New peers are told their
//! own id and then receive a replay of every existing peer: announcement,
//! name and colour, accessories and toggles.
//!
//! ### Bandwidth Scheduling
//! Poses, world events and voice are queued by priority and drained once per
//! tick. World events always go out; poses and voice share a per-tick byte
//! budget, with poses throttled by distance and voice gated by proximity.
//!
//! ### Distance Culling
//! A background task periodically derives avatar positions from the latest
//! poses and classifies which peers are far from each other.
//!
//! ## Architecture Design
//!
//! ### Single Tick Loop
//! [`network::RelayServer`] owns all relay state and runs a fixed-rate loop:
//! drain transport events, run one scheduling pass, maybe start a culling
//! pass. Only positions and distant sets are shared with the culling task,
//! behind one `RwLock`.
//!
//! ### Transport Boundary
//! The relay talks to the network only through [`shared::transport::Transport`].
//! The binary uses [`shared::transport::udp::UdpTransport`]; tests use an
//! in-memory recording transport.
//!
//! ## Module Organization
//!
//! - `config`: settings file loading and validation
//! - `handshake`: connect key verification
//! - `registry`: client ids and per-session state
//! - `spatial`: positions, distant sets and the culling engine
//! - `scheduler`: priority queues, throttling and telemetry
//! - `broadcast`: encode-once fan-out helpers
//! - `handlers`: per-opcode message handling
//! - `network`: the relay loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerSettings;
//! use server::network::RelayServer;
//! use shared::transport::udp::UdpTransport;
//! use shared::transport::TransportConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings::default();
//!     let transport = UdpTransport::bind("0.0.0.0:7777", TransportConfig::default()).await?;
//!
//!     let mut relay = RelayServer::new(transport, settings, 60);
//!     relay.run_until(tokio::signal::ctrl_c()).await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod handlers;
pub mod handshake;
pub mod network;
pub mod registry;
pub mod scheduler;
pub mod spatial;

#[cfg(test)]
mod test_support;
