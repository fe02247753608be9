//! Fan-out helpers
//!
//! A message is encoded and framed once, then the same bytes go to every
//! recipient. Every helper returns the number of bytes handed to the
//! transport so callers can charge them against the tick budget.

use crate::registry::SessionRegistry;
use log::error;
use shared::protocol::{frame, ServerMessage};
use shared::transport::{Delivery, PeerHandle, Transport};

/// Encodes and frames a server message.
///
/// Messages too large for the length prefix are logged and dropped.
pub fn encode_frame(message: &ServerMessage) -> Option<Vec<u8>> {
    match frame(&message.encode()) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(
                "Dropping message {:#04x} for client {}: {}",
                message.opcode(),
                message.client_id(),
                e
            );
            None
        }
    }
}

/// Sends one framed message to one peer.
pub fn send_to<T: Transport>(
    transport: &mut T,
    peer: PeerHandle,
    framed: &[u8],
    delivery: Delivery,
) -> usize {
    transport.send(peer, framed, delivery);
    framed.len()
}

/// Sends a framed message to every given peer.
pub fn send_to_all<T, I>(transport: &mut T, peers: I, framed: &[u8], delivery: Delivery) -> usize
where
    T: Transport,
    I: IntoIterator<Item = PeerHandle>,
{
    peers
        .into_iter()
        .map(|peer| send_to(transport, peer, framed, delivery))
        .sum()
}

/// Sends a framed message to every connected session except `exclude`.
pub fn broadcast<T: Transport>(
    transport: &mut T,
    registry: &SessionRegistry,
    framed: &[u8],
    delivery: Delivery,
    exclude: Option<PeerHandle>,
) -> usize {
    let peers = registry
        .recipients(exclude)
        .into_iter()
        .map(|(peer, _)| peer);
    send_to_all(transport, peers, framed, delivery)
}

/// Encodes `message` and broadcasts it reliably to everyone but `exclude`.
pub fn broadcast_message<T: Transport>(
    transport: &mut T,
    registry: &SessionRegistry,
    message: &ServerMessage,
    exclude: Option<PeerHandle>,
) -> usize {
    match encode_frame(message) {
        Some(framed) => broadcast(transport, registry, &framed, Delivery::ReliableOrdered, exclude),
        None => 0,
    }
}
