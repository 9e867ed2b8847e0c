use std::{io, net::SocketAddr};

use thiserror::Error;

#[cfg(doc)]
use crate::{Node, Peer};

/// A convenience alias for results returned by `peerwire`.
pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by the crypto half of a [`Session`](crate::Session).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SessionError(pub String);

impl SessionError {
    /// Creates a new [`SessionError`] with the given description.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The coarse classification of an [`Error`], deciding how the owning worker reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The remote end is gone or the transport failed hard; the peer gets torn down.
    Disconnect,
    /// A passing I/O or session-level hiccup; the connection is left as it is.
    Transient,
    /// The remote sent something unacceptable; the packet is rejected, the peer stays connected.
    Protocol,
}

/// Everything that can go wrong in `peerwire`.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream was closed by either side or the transport reported a hard failure.
    #[error("peer disconnected: {0}")]
    Disconnected(#[source] io::Error),
    /// An I/O error that doesn't indicate a dead connection.
    #[error("transient i/o error: {0}")]
    Transient(#[source] io::Error),
    /// The signature of an inbound packet doesn't match its digest.
    #[error("invalid signature on an inbound packet")]
    SignatureVerificationFailed,
    /// A frame declared (or would require) a payload larger than `Config::max_payload_size`.
    #[error("a payload of {declared}B exceeds the {max}B limit")]
    MaxPayloadExceeded { declared: usize, max: usize },
    /// A frame's payload couldn't be deserialized into a packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// The session failed to encrypt an outbound message.
    #[error("couldn't encrypt a message: {0}")]
    Encrypt(#[source] SessionError),
    /// The session failed to decrypt an inbound digest.
    #[error("couldn't decrypt a message: {0}")]
    Decrypt(#[source] SessionError),
    /// The listening socket couldn't be bound.
    #[error("couldn't bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The listener couldn't be started.
    #[error("couldn't start listening: {0}")]
    Listen(&'static str),
    /// An outbound connection couldn't be established.
    #[error("couldn't dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The secure session couldn't be established.
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Admission control refused a new connection.
    #[error("maximum number of peers ({0}) reached")]
    TooManyPeers(usize),
    /// The address is already connected or in the process of connecting.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    /// There is no registered peer with the given address.
    #[error("no peer registered as {0}")]
    UnknownPeer(SocketAddr),
    /// The [`Node`] has been shut down.
    #[error("the node is closed")]
    Closed,
}

impl Error {
    /// Returns the [`ErrorClass`] of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Disconnected(_) | Self::Closed => ErrorClass::Disconnect,
            Self::SignatureVerificationFailed
            | Self::MaxPayloadExceeded { .. }
            | Self::MalformedPacket(_) => ErrorClass::Protocol,
            _ => ErrorClass::Transient,
        }
    }

    /// Checks whether the error is fatal to the [`Peer`] it originated from.
    pub fn is_disconnect(&self) -> bool {
        self.class() == ErrorClass::Disconnect
    }
}
