//! Length-prefixed binary game protocol
//!
//! Every game message travels as exactly one transport payload laid out as
//! `[u16 total_length][opcode][body...]`. The length is little-endian and
//! counts the two length bytes themselves, so a frame carrying an `n`-byte
//! message is `n + 2` bytes long and the declared length must match the
//! received byte count exactly.
//!
//! Client → server and server → client messages share opcode values but have
//! different layouts: outbound messages are prefixed with the id of the client
//! they describe, inbound messages are always about the sender and omit it.

use std::fmt;
use thiserror::Error;

/// Application-level client identifier shared with every peer.
pub type ClientId = u8;

/// Returned by id allocation when every id is already taken.
pub const INVALID_CLIENT_ID: ClientId = 255;

/// Number of usable client ids (0..=254).
pub const MAX_CLIENTS: usize = 255;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Opcode values used on the wire
pub mod opcode {
    pub const IDENTITY_ASSIGN: u8 = 0x01;
    pub const PEER_ANNOUNCE: u8 = 0x02;
    pub const PEER_DISCONNECT: u8 = 0x03;
    pub const INFO_UPDATE: u8 = 0x04;
    pub const POSE_UPDATE: u8 = 0x05;
    pub const WORLD_EVENT: u8 = 0x06;
    pub const ACCESSORY_ADD: u8 = 0x07;
    pub const ACCESSORY_REMOVE: u8 = 0x08;
    pub const JIMINY_TOGGLE: u8 = 0x09;
    pub const COLLISION_TOGGLE: u8 = 0x0A;
    pub const CHAT_MESSAGE: u8 = 0x0B;
    pub const AUDIO_FRAME: u8 = 0x0C;
}

/// Errors raised while adding or stripping the length prefix
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("packet too short to contain length header ({len} bytes)")]
    TooShort { len: usize },
    #[error("packet length mismatch: expected {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("packet carries no opcode")]
    MissingOpcode,
    #[error("message of {len} bytes does not fit a u16 length prefix")]
    Oversized { len: usize },
}

/// Errors raised while decoding a deframed message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("opcode {opcode:#04x} needs at least {needed} body bytes, got {actual}")]
    Truncated {
        opcode: u8,
        needed: usize,
        actual: usize,
    },
}

/// Prepends the little-endian length prefix to an encoded message.
pub fn frame(message: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = message.len() + LENGTH_PREFIX_SIZE;
    let declared = u16::try_from(total).map_err(|_| FrameError::Oversized { len: total })?;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&declared.to_le_bytes());
    out.extend_from_slice(message);
    Ok(out)
}

/// Validates the length prefix and returns the message (opcode onwards).
///
/// This is an integrity check, not stream reassembly: a datagram is either
/// exactly one message or it is rejected.
pub fn deframe(datagram: &[u8]) -> Result<&[u8], FrameError> {
    if datagram.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::TooShort {
            len: datagram.len(),
        });
    }

    let declared = u16::from_le_bytes([datagram[0], datagram[1]]) as usize;
    if declared != datagram.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: datagram.len(),
        });
    }

    let message = &datagram[LENGTH_PREFIX_SIZE..];
    if message.is_empty() {
        return Err(FrameError::MissingOpcode);
    }
    Ok(message)
}

/// Avatar tint chosen by the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.r, self.g, self.b)
    }
}

/// Messages sent by a client to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    InfoUpdate {
        color: Rgb,
        name: String,
    },
    PoseUpdate {
        kickoff: u8,
        sequence: u16,
        pose: Vec<u8>,
    },
    WorldEvent {
        sequence: u16,
        event: Vec<u8>,
    },
    /// `data` starts with the accessory slot id
    AccessoryAdd {
        data: Vec<u8>,
    },
    AccessoryRemove {
        data: Vec<u8>,
    },
    JiminyToggle {
        enabled: bool,
    },
    CollisionToggle {
        enabled: bool,
    },
    ChatMessage {
        text: Vec<u8>,
    },
    AudioFrame {
        audio: Vec<u8>,
    },
}

impl ClientMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ClientMessage::InfoUpdate { .. } => opcode::INFO_UPDATE,
            ClientMessage::PoseUpdate { .. } => opcode::POSE_UPDATE,
            ClientMessage::WorldEvent { .. } => opcode::WORLD_EVENT,
            ClientMessage::AccessoryAdd { .. } => opcode::ACCESSORY_ADD,
            ClientMessage::AccessoryRemove { .. } => opcode::ACCESSORY_REMOVE,
            ClientMessage::JiminyToggle { .. } => opcode::JIMINY_TOGGLE,
            ClientMessage::CollisionToggle { .. } => opcode::COLLISION_TOGGLE,
            ClientMessage::ChatMessage { .. } => opcode::CHAT_MESSAGE,
            ClientMessage::AudioFrame { .. } => opcode::AUDIO_FRAME,
        }
    }

    /// Encodes the message without the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            ClientMessage::InfoUpdate { color, name } => {
                out.extend_from_slice(&[color.r, color.g, color.b]);
                out.extend_from_slice(name.as_bytes());
            }
            ClientMessage::PoseUpdate {
                kickoff,
                sequence,
                pose,
            } => {
                out.push(*kickoff);
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(pose);
            }
            ClientMessage::WorldEvent { sequence, event } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(event);
            }
            ClientMessage::AccessoryAdd { data } | ClientMessage::AccessoryRemove { data } => {
                out.extend_from_slice(data);
            }
            ClientMessage::JiminyToggle { enabled } | ClientMessage::CollisionToggle { enabled } => {
                out.push(u8::from(*enabled));
            }
            ClientMessage::ChatMessage { text } => out.extend_from_slice(text),
            ClientMessage::AudioFrame { audio } => out.extend_from_slice(audio),
        }
        out
    }

    /// Decodes a deframed message (opcode first).
    pub fn decode(message: &[u8]) -> Result<Self, DecodeError> {
        let (&op, body) = message
            .split_first()
            .ok_or(DecodeError::Truncated {
                opcode: 0,
                needed: 1,
                actual: 0,
            })?;

        let decoded = match op {
            opcode::INFO_UPDATE => {
                require(op, body, 3)?;
                ClientMessage::InfoUpdate {
                    color: Rgb::new(body[0], body[1], body[2]),
                    name: String::from_utf8_lossy(&body[3..]).into_owned(),
                }
            }
            opcode::POSE_UPDATE => {
                require(op, body, 3)?;
                ClientMessage::PoseUpdate {
                    kickoff: body[0],
                    sequence: u16::from_le_bytes([body[1], body[2]]),
                    pose: body[3..].to_vec(),
                }
            }
            opcode::WORLD_EVENT => {
                require(op, body, 2)?;
                ClientMessage::WorldEvent {
                    sequence: u16::from_le_bytes([body[0], body[1]]),
                    event: body[2..].to_vec(),
                }
            }
            opcode::ACCESSORY_ADD => {
                require(op, body, 1)?;
                ClientMessage::AccessoryAdd {
                    data: body.to_vec(),
                }
            }
            opcode::ACCESSORY_REMOVE => {
                require(op, body, 1)?;
                ClientMessage::AccessoryRemove {
                    data: body.to_vec(),
                }
            }
            opcode::JIMINY_TOGGLE => {
                require(op, body, 1)?;
                ClientMessage::JiminyToggle {
                    enabled: body[0] != 0,
                }
            }
            opcode::COLLISION_TOGGLE => {
                require(op, body, 1)?;
                ClientMessage::CollisionToggle {
                    enabled: body[0] != 0,
                }
            }
            opcode::CHAT_MESSAGE => ClientMessage::ChatMessage {
                text: body.to_vec(),
            },
            opcode::AUDIO_FRAME => ClientMessage::AudioFrame {
                audio: body.to_vec(),
            },
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(decoded)
    }
}

/// Messages sent by the server to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    IdentityAssign {
        id: ClientId,
    },
    PeerAnnounce {
        id: ClientId,
    },
    PeerDisconnect {
        id: ClientId,
    },
    InfoUpdate {
        id: ClientId,
        color: Rgb,
        name: String,
    },
    PoseUpdate {
        id: ClientId,
        kickoff: u8,
        sequence: u16,
        pose: Vec<u8>,
    },
    WorldEvent {
        id: ClientId,
        sequence: u16,
        event: Vec<u8>,
    },
    AccessoryAdd {
        id: ClientId,
        data: Vec<u8>,
    },
    AccessoryRemove {
        id: ClientId,
        data: Vec<u8>,
    },
    JiminyToggle {
        id: ClientId,
        enabled: bool,
    },
    CollisionToggle {
        id: ClientId,
        enabled: bool,
    },
    ChatMessage {
        id: ClientId,
        text: Vec<u8>,
    },
    AudioFrame {
        id: ClientId,
        audio: Vec<u8>,
    },
}

impl ServerMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ServerMessage::IdentityAssign { .. } => opcode::IDENTITY_ASSIGN,
            ServerMessage::PeerAnnounce { .. } => opcode::PEER_ANNOUNCE,
            ServerMessage::PeerDisconnect { .. } => opcode::PEER_DISCONNECT,
            ServerMessage::InfoUpdate { .. } => opcode::INFO_UPDATE,
            ServerMessage::PoseUpdate { .. } => opcode::POSE_UPDATE,
            ServerMessage::WorldEvent { .. } => opcode::WORLD_EVENT,
            ServerMessage::AccessoryAdd { .. } => opcode::ACCESSORY_ADD,
            ServerMessage::AccessoryRemove { .. } => opcode::ACCESSORY_REMOVE,
            ServerMessage::JiminyToggle { .. } => opcode::JIMINY_TOGGLE,
            ServerMessage::CollisionToggle { .. } => opcode::COLLISION_TOGGLE,
            ServerMessage::ChatMessage { .. } => opcode::CHAT_MESSAGE,
            ServerMessage::AudioFrame { .. } => opcode::AUDIO_FRAME,
        }
    }

    /// Id of the client this message describes.
    pub fn client_id(&self) -> ClientId {
        match self {
            ServerMessage::IdentityAssign { id }
            | ServerMessage::PeerAnnounce { id }
            | ServerMessage::PeerDisconnect { id }
            | ServerMessage::InfoUpdate { id, .. }
            | ServerMessage::PoseUpdate { id, .. }
            | ServerMessage::WorldEvent { id, .. }
            | ServerMessage::AccessoryAdd { id, .. }
            | ServerMessage::AccessoryRemove { id, .. }
            | ServerMessage::JiminyToggle { id, .. }
            | ServerMessage::CollisionToggle { id, .. }
            | ServerMessage::ChatMessage { id, .. }
            | ServerMessage::AudioFrame { id, .. } => *id,
        }
    }

    /// Encodes the message without the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode(), self.client_id()];
        match self {
            ServerMessage::IdentityAssign { .. }
            | ServerMessage::PeerAnnounce { .. }
            | ServerMessage::PeerDisconnect { .. } => {}
            ServerMessage::InfoUpdate { color, name, .. } => {
                out.extend_from_slice(&[color.r, color.g, color.b]);
                out.extend_from_slice(name.as_bytes());
            }
            ServerMessage::PoseUpdate {
                kickoff,
                sequence,
                pose,
                ..
            } => {
                out.push(*kickoff);
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(pose);
            }
            ServerMessage::WorldEvent {
                sequence, event, ..
            } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(event);
            }
            ServerMessage::AccessoryAdd { data, .. } | ServerMessage::AccessoryRemove { data, .. } => {
                out.extend_from_slice(data)
            }
            ServerMessage::JiminyToggle { enabled, .. }
            | ServerMessage::CollisionToggle { enabled, .. } => out.push(u8::from(*enabled)),
            ServerMessage::ChatMessage { text, .. } => out.extend_from_slice(text),
            ServerMessage::AudioFrame { audio, .. } => out.extend_from_slice(audio),
        }
        out
    }

    /// Decodes a deframed message (opcode first). Used by clients.
    pub fn decode(message: &[u8]) -> Result<Self, DecodeError> {
        let Some((&op, rest)) = message.split_first() else {
            return Err(DecodeError::Truncated {
                opcode: 0,
                needed: 1,
                actual: 0,
            });
        };
        if !(opcode::IDENTITY_ASSIGN..=opcode::AUDIO_FRAME).contains(&op) {
            return Err(DecodeError::UnknownOpcode(op));
        }
        require(op, rest, 1)?;
        let id = rest[0];
        let body = &rest[1..];

        let decoded = match op {
            opcode::IDENTITY_ASSIGN => ServerMessage::IdentityAssign { id },
            opcode::PEER_ANNOUNCE => ServerMessage::PeerAnnounce { id },
            opcode::PEER_DISCONNECT => ServerMessage::PeerDisconnect { id },
            opcode::INFO_UPDATE => {
                require(op, rest, 4)?;
                ServerMessage::InfoUpdate {
                    id,
                    color: Rgb::new(body[0], body[1], body[2]),
                    name: String::from_utf8_lossy(&body[3..]).into_owned(),
                }
            }
            opcode::POSE_UPDATE => {
                require(op, rest, 4)?;
                ServerMessage::PoseUpdate {
                    id,
                    kickoff: body[0],
                    sequence: u16::from_le_bytes([body[1], body[2]]),
                    pose: body[3..].to_vec(),
                }
            }
            opcode::WORLD_EVENT => {
                require(op, rest, 3)?;
                ServerMessage::WorldEvent {
                    id,
                    sequence: u16::from_le_bytes([body[0], body[1]]),
                    event: body[2..].to_vec(),
                }
            }
            opcode::ACCESSORY_ADD => ServerMessage::AccessoryAdd {
                id,
                data: body.to_vec(),
            },
            opcode::ACCESSORY_REMOVE => ServerMessage::AccessoryRemove {
                id,
                data: body.to_vec(),
            },
            opcode::JIMINY_TOGGLE => {
                require(op, rest, 2)?;
                ServerMessage::JiminyToggle {
                    id,
                    enabled: body[0] != 0,
                }
            }
            opcode::COLLISION_TOGGLE => {
                require(op, rest, 2)?;
                ServerMessage::CollisionToggle {
                    id,
                    enabled: body[0] != 0,
                }
            }
            opcode::CHAT_MESSAGE => ServerMessage::ChatMessage {
                id,
                text: body.to_vec(),
            },
            _ => ServerMessage::AudioFrame {
                id,
                audio: body.to_vec(),
            },
        };
        Ok(decoded)
    }
}

fn require(opcode: u8, body: &[u8], needed: usize) -> Result<(), DecodeError> {
    if body.len() < needed {
        Err(DecodeError::Truncated {
            opcode,
            needed,
            actual: body.len(),
        })
    } else {
        Ok(())
    }
}
