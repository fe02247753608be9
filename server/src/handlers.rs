//! Per-opcode handling of client messages
//!
//! Info, accessory, toggle and chat messages are broadcast right away over
//! the reliable channel. Poses, world events and voice go through the
//! bandwidth scheduler.

use crate::broadcast::{broadcast, encode_frame};
use crate::network::RelayServer;
use crate::registry::{PlayerInfo, StateSlot};
use crate::scheduler::Priority;
use log::{debug, info};
use shared::protocol::{ClientMessage, Rgb, ServerMessage};
use shared::transport::{Delivery, PeerHandle, Transport};
use shared::ClientId;
use std::time::Instant;

impl<T: Transport> RelayServer<T> {
    pub(crate) async fn handle_message(
        &mut self,
        peer: PeerHandle,
        id: ClientId,
        message: ClientMessage,
        now: Instant,
    ) {
        match message {
            ClientMessage::InfoUpdate { color, name } => self.handle_info(peer, id, color, name),
            ClientMessage::PoseUpdate {
                kickoff,
                sequence,
                pose,
            } => self.handle_pose(peer, id, kickoff, sequence, pose, now).await,
            ClientMessage::WorldEvent { sequence, event } => {
                self.handle_world_event(peer, id, sequence, event, now)
            }
            ClientMessage::AccessoryAdd { data } => self.handle_accessory(peer, id, data, true),
            ClientMessage::AccessoryRemove { data } => self.handle_accessory(peer, id, data, false),
            ClientMessage::JiminyToggle { enabled } => self.handle_jiminy(peer, id, enabled),
            ClientMessage::CollisionToggle { enabled } => self.handle_collision(peer, id, enabled),
            ClientMessage::ChatMessage { text } => self.handle_chat(peer, id, text),
            ClientMessage::AudioFrame { audio } => self.handle_audio(peer, id, audio, now),
        }
    }

    /// Broadcasts an already framed message reliably to everyone but `peer`.
    fn relay_framed(&mut self, peer: PeerHandle, framed: &[u8]) -> usize {
        broadcast(
            &mut self.transport,
            &self.registry,
            framed,
            Delivery::ReliableOrdered,
            Some(peer),
        )
    }

    fn relay_message(&mut self, peer: PeerHandle, message: &ServerMessage) -> usize {
        match encode_frame(message) {
            Some(framed) => self.relay_framed(peer, &framed),
            None => 0,
        }
    }

    fn handle_info(&mut self, peer: PeerHandle, id: ClientId, color: Rgb, name: String) {
        if name.is_empty() {
            debug!("Client {} sent an info update without a name", id);
            return;
        }
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };

        let first_receipt = match &session.info {
            None => {
                info!("Player {}[{}] has connected", name, id);
                true
            }
            Some(previous) => {
                if previous.name != name {
                    info!("{}[{}] changed nickname to {}", previous.name, id, name);
                }
                false
            }
        };
        info!("{}[{}] set color to {}", name, id, color);
        session.info = Some(PlayerInfo {
            name: name.clone(),
            color,
        });

        if first_receipt {
            self.relay_message(peer, &ServerMessage::PeerAnnounce { id });
        }
        self.relay_message(peer, &ServerMessage::InfoUpdate { id, color, name });
    }

    async fn handle_pose(
        &mut self,
        peer: PeerHandle,
        id: ClientId,
        kickoff: u8,
        sequence: u16,
        pose: Vec<u8>,
        now: Instant,
    ) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        // Nobody can render an avatar they know nothing about
        if !session.has_info() || !session.pose_sequence.accept(sequence) {
            return;
        }
        session.pose_kickoff = kickoff;

        let message = ServerMessage::PoseUpdate {
            id,
            kickoff,
            sequence,
            pose,
        };
        let framed = encode_frame(&message);
        // The frame holds its own copy, so the payload moves into the table
        if let ServerMessage::PoseUpdate { pose, .. } = message {
            self.spatial.write().await.record_pose(id, pose);
        }
        if let Some(framed) = framed {
            self.scheduler.enqueue(peer, framed, Priority::Medium, now);
        }
    }

    fn handle_world_event(
        &mut self,
        peer: PeerHandle,
        id: ClientId,
        sequence: u16,
        event: Vec<u8>,
        now: Instant,
    ) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        if !session.event_sequence.accept(sequence) {
            return;
        }

        let message = ServerMessage::WorldEvent {
            id,
            sequence,
            event,
        };
        if let Some(framed) = encode_frame(&message) {
            self.scheduler.enqueue(peer, framed, Priority::High, now);
        }
    }

    fn handle_accessory(&mut self, peer: PeerHandle, id: ClientId, data: Vec<u8>, add: bool) {
        let Some(&slot) = data.first() else {
            return;
        };
        let message = if add {
            ServerMessage::AccessoryAdd { id, data }
        } else {
            ServerMessage::AccessoryRemove { id, data }
        };
        let Some(framed) = encode_frame(&message) else {
            return;
        };

        if let Some(session) = self.registry.get_mut(id) {
            if add {
                session
                    .persistent_state
                    .insert(StateSlot::Accessory(slot), framed.clone());
            } else {
                session.persistent_state.remove(&StateSlot::Accessory(slot));
            }
        }
        self.relay_framed(peer, &framed);
    }

    fn handle_jiminy(&mut self, peer: PeerHandle, id: ClientId, enabled: bool) {
        let Some(framed) = encode_frame(&ServerMessage::JiminyToggle { id, enabled }) else {
            return;
        };
        if let Some(session) = self.registry.get_mut(id) {
            session.jiminy_enabled = enabled;
            session
                .persistent_state
                .insert(StateSlot::Jiminy, framed.clone());
        }
        self.relay_framed(peer, &framed);
    }

    fn handle_collision(&mut self, peer: PeerHandle, id: ClientId, enabled: bool) {
        let Some(framed) = encode_frame(&ServerMessage::CollisionToggle { id, enabled }) else {
            return;
        };
        if let Some(session) = self.registry.get_mut(id) {
            session.collisions_enabled = enabled;
            session
                .persistent_state
                .insert(StateSlot::Collision, framed.clone());
        }
        self.relay_framed(peer, &framed);
    }

    fn handle_chat(&mut self, peer: PeerHandle, id: ClientId, text: Vec<u8>) {
        if let Some(session) = self.registry.get(id) {
            info!("{}: {}", session.label(), String::from_utf8_lossy(&text));
        }
        self.relay_message(peer, &ServerMessage::ChatMessage { id, text });
    }

    fn handle_audio(&mut self, peer: PeerHandle, id: ClientId, audio: Vec<u8>, now: Instant) {
        if !self.settings.voice_chat_enabled {
            return;
        }
        if let Some(framed) = encode_frame(&ServerMessage::AudioFrame { id, audio }) {
            self.scheduler.enqueue(peer, framed, Priority::Low, now);
        }
    }
}
