//! In-memory transport for exercising the relay without sockets

use shared::protocol::{deframe, ServerMessage};
use shared::transport::{
    ConnectionRequest, Delivery, DisconnectReason, PeerHandle, RejectReason, Transport,
    TransportEvent,
};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayload {
    pub peer: PeerHandle,
    pub payload: Vec<u8>,
    pub delivery: Delivery,
}

impl SentPayload {
    pub fn message(&self) -> ServerMessage {
        let message = deframe(&self.payload).expect("relay sent a malformed frame");
        ServerMessage::decode(message).expect("relay sent an undecodable message")
    }
}

/// Records everything the relay hands to the transport and replays scripted
/// events back to it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub incoming: VecDeque<TransportEvent>,
    pub sent: Vec<SentPayload>,
    pub accepted: Vec<PeerHandle>,
    pub rejected: Vec<(PeerHandle, RejectReason)>,
    pub disconnected: Vec<PeerHandle>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connect(&mut self, peer: u64, key: &str) {
        self.incoming
            .push_back(TransportEvent::ConnectionRequest(ConnectionRequest {
                peer: PeerHandle(peer),
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40_000 + peer as u16),
                key: key.to_string(),
            }));
    }

    pub fn push_payload(&mut self, peer: u64, payload: Vec<u8>) {
        self.incoming.push_back(TransportEvent::Received {
            peer: PeerHandle(peer),
            payload,
        });
    }

    pub fn push_disconnect(&mut self, peer: u64) {
        self.incoming.push_back(TransportEvent::Disconnected {
            peer: PeerHandle(peer),
            reason: DisconnectReason::RemoteClosed,
        });
    }

    /// Decoded messages sent to `peer`, in send order
    pub fn messages_to(&self, peer: u64) -> Vec<ServerMessage> {
        self.sent
            .iter()
            .filter(|sent| sent.peer == PeerHandle(peer))
            .map(SentPayload::message)
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, peer: PeerHandle, payload: &[u8], delivery: Delivery) {
        self.sent.push(SentPayload {
            peer,
            payload: payload.to_vec(),
            delivery,
        });
    }

    fn accept(&mut self, request: &ConnectionRequest) {
        self.accepted.push(request.peer);
    }

    fn reject(&mut self, request: &ConnectionRequest, reason: RejectReason) {
        self.rejected.push((request.peer, reason));
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        self.disconnected.push(peer);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.incoming.pop_front()
    }
}
