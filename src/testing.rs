//! Test doubles for the external session collaborator; not meant for production use, as the
//! "encryption" is a keyed XOR and the "signature" a keyed hash.

use std::net::SocketAddr;

use blake2::{Blake2s256, Digest};
use bytes::{Bytes, BytesMut};
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;

use crate::{BufferPool, ConnectionSide, Established, Peer, Session, SessionError};

/// A deterministic, insecure [`Session`] keyed to a pair of fake public keys.
pub struct MockSession {
    local_key: Vec<u8>,
    remote_key: Vec<u8>,
    secret: [u8; 32],
    /// Makes both encryption and decryption fail, while signatures keep working.
    broken: bool,
}

impl MockSession {
    /// Creates a session as seen by the owner of `local_key`, talking to the owner of `remote_key`.
    pub fn new(local_key: &[u8], remote_key: &[u8]) -> Self {
        // both sides need to arrive at the same secret
        let (lo, hi) = if local_key <= remote_key {
            (local_key, remote_key)
        } else {
            (remote_key, local_key)
        };
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&Blake2s256::new().chain_update(lo).chain_update(hi).finalize());

        Self {
            local_key: local_key.to_vec(),
            remote_key: remote_key.to_vec(),
            secret,
            broken: false,
        }
    }

    /// Creates a session whose every encryption and decryption attempt fails.
    pub fn broken(local_key: &[u8], remote_key: &[u8]) -> Self {
        Self {
            broken: true,
            ..Self::new(local_key, remote_key)
        }
    }

    fn keystream(&self, dst: &mut BytesMut, src: &[u8]) {
        dst.extend(src.iter().zip(self.secret.iter().cycle()).map(|(b, k)| b ^ k));
    }

    fn mac(key: &[u8], digest: &[u8]) -> [u8; 32] {
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&Blake2s256::new().chain_update(key).chain_update(digest).finalize());
        mac
    }
}

impl Session for MockSession {
    fn remote_public_key(&self) -> &[u8] {
        &self.remote_key
    }

    fn encrypt(&self, dst: &mut BytesMut, plaintext: &[u8]) -> Result<(), SessionError> {
        if self.broken {
            return Err(SessionError::new("the cipher is broken"));
        }
        self.keystream(dst, plaintext);
        Ok(())
    }

    fn decrypt(&self, dst: &mut BytesMut, digest: &[u8]) -> Result<(), SessionError> {
        if self.broken {
            return Err(SessionError::new("the cipher is broken"));
        }
        self.keystream(dst, digest);
        Ok(())
    }

    fn sign(&self, digest: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&Self::mac(&self.local_key, digest))
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        Self::mac(&self.remote_key, digest)[..] == *signature
    }
}

/// Creates two [`Peer`]s connected over an in-memory duplex stream.
pub fn peer_pair(pool: &BufferPool, max_payload_size: usize) -> (Peer, Peer) {
    let (a_stream, b_stream) = duplex(64 * 1024);
    let a_addr: SocketAddr = ([127, 0, 0, 1], 10_001).into();
    let b_addr: SocketAddr = ([127, 0, 0, 1], 10_002).into();

    let a = Peer::new(
        b_addr,
        ConnectionSide::Initiator,
        Established::new(MockSession::new(b"alice", b"bob"), a_stream),
        pool.clone(),
        max_payload_size,
        CancellationToken::new(),
    );
    let b = Peer::new(
        a_addr,
        ConnectionSide::Responder,
        Established::new(MockSession::new(b"bob", b"alice"), b_stream),
        pool.clone(),
        max_payload_size,
        CancellationToken::new(),
    );

    (a, b)
}

/// Creates a [`Peer`] whose remote end is handed out raw, so tests can write arbitrary bytes.
pub fn peer_with_raw_remote(
    pool: &BufferPool,
    max_payload_size: usize,
) -> (Peer, MockSession, tokio::io::DuplexStream) {
    let (local, remote) = duplex(64 * 1024);
    let addr: SocketAddr = ([127, 0, 0, 1], 10_003).into();

    let peer = Peer::new(
        addr,
        ConnectionSide::Responder,
        Established::new(MockSession::new(b"local", b"remote"), local),
        pool.clone(),
        max_payload_size,
        CancellationToken::new(),
    );

    (peer, MockSession::new(b"remote", b"local"), remote)
}
