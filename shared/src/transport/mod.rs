//! Connection-oriented datagram transport
//!
//! The relay core never touches sockets directly. It consumes the
//! [`Transport`] trait: connection requests, received payloads and
//! disconnects come out of [`Transport::poll_event`], and payloads go back
//! out through [`Transport::send`] under one of two delivery modes.
//!
//! The bundled implementation ([`udp::UdpTransport`] on the server and
//! [`client::ClientConnection`] on the client) runs over a plain UDP socket
//! with a thin reliability layer:
//!
//! - **Reliable-ordered**: sequenced, acknowledged, resent until acked and
//!   released to the application in send order.
//! - **Unreliable**: sequenced but never resent; the receiver drops anything
//!   older than what it already delivered.
//!
//! Peers that stay silent for longer than the disconnect timeout are dropped.

pub mod channel;
pub mod client;
pub mod datagram;
pub mod udp;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Largest datagram the transport will read
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Opaque identity of one transport-level connection
///
/// Handles are never reused within one transport instance, so a handle
/// outliving its connection cannot alias a newer peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Delivery guarantee requested for one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    ReliableOrdered,
    Unreliable,
}

/// Why a connection request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    WrongPassword,
    IncompatibleVersion,
    ServerFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::WrongPassword => write!(f, "incorrect password"),
            RejectReason::IncompatibleVersion => write!(f, "incompatible version"),
            RejectReason::ServerFull => write!(f, "server full"),
        }
    }
}

/// Why an established connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RemoteClosed,
    Timeout,
    /// A new connection attempt arrived from the same address
    Replaced,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => write!(f, "remote connection close"),
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::Replaced => write!(f, "reconnect from the same address"),
        }
    }
}

/// A pending connection waiting for the application to accept or reject it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer: PeerHandle,
    pub addr: SocketAddr,
    /// Handshake string offered by the client
    pub key: String,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionRequest(ConnectionRequest),
    Received {
        peer: PeerHandle,
        payload: Vec<u8>,
    },
    Disconnected {
        peer: PeerHandle,
        reason: DisconnectReason,
    },
}

/// Server-side view of the transport used by the relay core
pub trait Transport {
    /// Queues `payload` for `peer`. Fire-and-forget: failures are logged by
    /// the transport, never reported back.
    fn send(&mut self, peer: PeerHandle, payload: &[u8], delivery: Delivery);

    /// Completes the handshake for a pending request.
    fn accept(&mut self, request: &ConnectionRequest);

    /// Refuses a pending request.
    fn reject(&mut self, request: &ConnectionRequest, reason: RejectReason);

    /// Drops an established connection without raising a disconnect event.
    fn disconnect(&mut self, peer: PeerHandle);

    /// Returns the next queued event without blocking.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

/// Timing knobs shared by both ends of the UDP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How often unacknowledged reliable datagrams are resent
    pub resend_interval: Duration,
    /// Send silence after which a keep-alive is emitted
    pub keepalive_interval: Duration,
    /// Receive silence after which the peer is considered gone
    pub disconnect_timeout: Duration,
    /// How often a client repeats its connect request
    pub connect_retry_interval: Duration,
    /// How long a client waits for the handshake to complete
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(15),
            connect_retry_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors surfaced by the UDP transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datagram encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("connection rejected: {0}")]
    Rejected(RejectReason),
    #[error("timed out waiting for the remote end")]
    TimedOut,
    #[error("connection closed by the remote end")]
    Disconnected,
}
