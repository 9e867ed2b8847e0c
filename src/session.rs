use std::{fmt, io, net::SocketAddr};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{error::SessionError, ConnectionSide};

#[cfg(doc)]
use crate::{Config, Peer, Transport};

/// The read half of an established stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
/// The write half of an established stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// The cryptographic capability of an established secure session, keyed to a single remote peer.
///
/// All the methods take `&self`, as a [`Peer`] may be sending and receiving at the same time;
/// implementations keep any per-direction state (e.g. nonces) internally synchronized.
pub trait Session: Send + Sync + 'static {
    /// The remote peer's static public key, as learned during the handshake.
    fn remote_public_key(&self) -> &[u8];

    /// Encrypts `plaintext`, appending the resulting digest to `dst`.
    fn encrypt(&self, dst: &mut BytesMut, plaintext: &[u8]) -> Result<(), SessionError>;

    /// Decrypts `digest`, appending the resulting plaintext to `dst`.
    fn decrypt(&self, dst: &mut BytesMut, digest: &[u8]) -> Result<(), SessionError>;

    /// Signs a digest with the local signing key.
    fn sign(&self, digest: &[u8]) -> Bytes;

    /// Checks that `signature` was produced over `digest` by the remote peer.
    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool;
}

/// The product of a successful handshake: the session's crypto capability and the two halves of
/// the duplex stream it secures.
///
/// A [`Peer`] takes it over, putting the stream halves behind a [`Transport`].
pub struct Established {
    pub session: Box<dyn Session>,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Established {
    /// Splits the `stream` and pairs it with the `session`.
    pub fn new<S>(session: impl Session, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (reader, writer) = split(stream);

        Self {
            session: Box::new(session),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field(
                "remote_public_key",
                &hex::encode(self.session.remote_public_key()),
            )
            .finish_non_exhaustive()
    }
}

/// Establishes a secure session over a freshly accepted or dialed connection; the key exchange
/// itself is up to the implementor.
///
/// The handshake is bounded by [`Config::handshake_timeout_ms`].
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Performs the handshake; `side` is the node's own side of the connection.
    async fn perform_handshake(
        &self,
        addr: SocketAddr,
        stream: TcpStream,
        side: ConnectionSide,
    ) -> io::Result<Established>;
}
