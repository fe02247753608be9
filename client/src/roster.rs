//! Local view of the other players on the server
//!
//! The roster applies every decoded [`ServerMessage`] in arrival order. It
//! mirrors what a game client would render: who is connected, what they are
//! called, what they wear and where they last were.

use log::info;
use shared::pose::{position_from_pose, Vec3};
use shared::protocol::{Rgb, ServerMessage};
use shared::ClientId;
use std::collections::{BTreeMap, HashMap};

/// Last pose received for a remote player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePose {
    pub kickoff: u8,
    pub sequence: u16,
    pub pose: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlayer {
    pub id: ClientId,
    pub name: Option<String>,
    pub color: Option<Rgb>,
    pub jiminy_enabled: bool,
    pub collisions_enabled: bool,
    /// Accessory payloads keyed by slot
    pub accessories: BTreeMap<u8, Vec<u8>>,
    pub pose: Option<RemotePose>,
}

impl RemotePlayer {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            name: None,
            color: None,
            jiminy_enabled: false,
            collisions_enabled: true,
            accessories: BTreeMap::new(),
            pose: None,
        }
    }

    pub fn position(&self) -> Option<Vec3> {
        self.pose
            .as_ref()
            .and_then(|pose| position_from_pose(&pose.pose))
    }
}

/// Something worth surfacing to the user beyond state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    Joined(ClientId),
    Left(ClientId),
    Chat { id: ClientId, text: String },
    WorldEvent { id: ClientId, event: Vec<u8> },
    Audio { id: ClientId, bytes: usize },
}

#[derive(Debug, Default)]
pub struct Roster {
    local_id: Option<ClientId>,
    players: HashMap<ClientId, RemotePlayer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the server assigned to us, once known
    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    pub fn player(&self, id: ClientId) -> Option<&RemotePlayer> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &RemotePlayer> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Applies one server message and reports anything noteworthy.
    pub fn apply(&mut self, message: ServerMessage) -> Option<RosterEvent> {
        match message {
            ServerMessage::IdentityAssign { id } => {
                info!("Server assigned us id {}", id);
                self.local_id = Some(id);
                None
            }
            ServerMessage::PeerAnnounce { id } => {
                self.players.entry(id).or_insert_with(|| RemotePlayer::new(id));
                Some(RosterEvent::Joined(id))
            }
            ServerMessage::PeerDisconnect { id } => {
                self.players.remove(&id).map(|_| RosterEvent::Left(id))
            }
            ServerMessage::InfoUpdate { id, color, name } => {
                let player = self.entry(id);
                player.name = Some(name);
                player.color = Some(color);
                None
            }
            ServerMessage::PoseUpdate {
                id,
                kickoff,
                sequence,
                pose,
            } => {
                self.entry(id).pose = Some(RemotePose {
                    kickoff,
                    sequence,
                    pose,
                });
                None
            }
            ServerMessage::WorldEvent { id, event, .. } => Some(RosterEvent::WorldEvent { id, event }),
            ServerMessage::AccessoryAdd { id, data } => {
                if let Some((&slot, _)) = data.split_first() {
                    self.entry(id).accessories.insert(slot, data);
                }
                None
            }
            ServerMessage::AccessoryRemove { id, data } => {
                if let Some(slot) = data.first() {
                    self.entry(id).accessories.remove(slot);
                }
                None
            }
            ServerMessage::JiminyToggle { id, enabled } => {
                self.entry(id).jiminy_enabled = enabled;
                None
            }
            ServerMessage::CollisionToggle { id, enabled } => {
                self.entry(id).collisions_enabled = enabled;
                None
            }
            ServerMessage::ChatMessage { id, text } => Some(RosterEvent::Chat {
                id,
                text: String::from_utf8_lossy(&text).into_owned(),
            }),
            ServerMessage::AudioFrame { id, audio } => Some(RosterEvent::Audio {
                id,
                bytes: audio.len(),
            }),
        }
    }

    /// Messages about a player can race ahead of its announcement
    fn entry(&mut self, id: ClientId) -> &mut RemotePlayer {
        self.players.entry(id).or_insert_with(|| RemotePlayer::new(id))
    }
}
