pub mod pose;
pub mod protocol;
pub mod sequence;
pub mod transport;

pub use pose::{position_from_pose, Vec3};
pub use protocol::{
    deframe, frame, ClientId, ClientMessage, DecodeError, FrameError, Rgb, ServerMessage,
    INVALID_CLIENT_ID, MAX_CLIENTS,
};
pub use sequence::{is_newer, SequenceGate};

/// Version tag clients prepend to the password in the connect request.
pub const PROTOCOL_VERSION: &str = "104";

/// Password value meaning "no password set".
pub const DEFAULT_PASSWORD: &str = "cuzzillobochfoddy";

pub const DEFAULT_PORT: u16 = 7777;

/// Builds the handshake string a client offers when connecting.
pub fn connection_key(password: &str) -> String {
    format!("{}{}", PROTOCOL_VERSION, password)
}
