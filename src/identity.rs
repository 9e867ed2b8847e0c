use std::{fmt, ops::Not};

use blake2::{Blake2s256, Digest};

/// The length of a [`PeerId`] in bytes.
pub const PEER_ID_LEN: usize = 32;

/// A content-addressed identity of a peer: the BLAKE2s-256 digest of its static public key.
///
/// It is independent of the network address the peer happens to be connected from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Derives the identity from a peer's static public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&Blake2s256::digest(public_key));
        Self(id)
    }

    /// Returns the raw digest.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(digest: [u8; PEER_ID_LEN]) -> Self {
        Self(digest)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the first 8 bytes are plenty to tell peers apart in the logs
        write!(f, "PeerId({}..)", hex::encode(&self.0[..8]))
    }
}

/// Indicates who was the initiator and who was the responder when the connection was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionSide {
    /// The side that initiated the connection.
    Initiator,
    /// The side that accepted the connection.
    Responder,
}

impl Not for ConnectionSide {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}
