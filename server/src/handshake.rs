//! Connection request validation
//!
//! A client offers `PROTOCOL_VERSION + password` as its connect key. Anything
//! else is refused; whether the key starts with the right version decides if
//! the client is told "wrong password" or "incompatible version".

use shared::transport::RejectReason;
use shared::PROTOCOL_VERSION;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("client offered an incorrect password")]
    WrongPassword,
    #[error("client version is not compatible with this server, or the request is invalid")]
    IncompatibleVersion,
}

impl HandshakeError {
    pub fn reject_reason(self) -> RejectReason {
        match self {
            HandshakeError::WrongPassword => RejectReason::WrongPassword,
            HandshakeError::IncompatibleVersion => RejectReason::IncompatibleVersion,
        }
    }
}

/// Checks an offered key against the configured password.
///
/// The error never carries the offered key, so it is safe to log.
pub fn verify_key(offered: &str, password: &str) -> Result<(), HandshakeError> {
    match offered.strip_prefix(PROTOCOL_VERSION) {
        Some(rest) if rest == password => Ok(()),
        Some(_) => Err(HandshakeError::WrongPassword),
        None => Err(HandshakeError::IncompatibleVersion),
    }
}
