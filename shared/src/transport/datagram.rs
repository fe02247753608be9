//! Transport-level datagrams
//!
//! Game frames ride inside `Reliable` / `Unreliable` datagrams; everything
//! else is connection management. Datagrams are serde types encoded with
//! bincode.

use crate::transport::RejectReason;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    // Connection management
    /// `nonce` is fresh per connection attempt, so a client restarting on the
    /// same address can be told apart from a retry
    Connect { key: String, nonce: u64 },
    Accept,
    Reject { reason: RejectReason },
    Disconnect,
    Ping,

    // Payload carriers
    Reliable { sequence: u16, payload: Vec<u8> },
    Ack { sequence: u16 },
    Unreliable { sequence: u16, payload: Vec<u8> },
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_datagram_roundtrip() {
        let datagram = Datagram::Reliable {
            sequence: 513,
            payload: vec![4, 0, 0x09, 1],
        };
        let bytes = datagram.encode().unwrap();
        assert_eq!(Datagram::decode(&bytes).unwrap(), datagram);
    }

    #[test]
    fn test_connect_carries_key() {
        let bytes = Datagram::Connect {
            key: "104secret".to_string(),
            nonce: 99,
        }
        .encode()
        .unwrap();

        match Datagram::decode(&bytes).unwrap() {
            Datagram::Connect { key, nonce } => {
                assert_eq!(key, "104secret");
                assert_eq!(nonce, 99);
            }
            other => panic!("Unexpected datagram {:?}", other),
        }
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Datagram::decode(&[]).is_err());
        assert!(Datagram::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
