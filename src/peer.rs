use std::{fmt, io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    packet::{self, Packet, FRAME_HEADER_LEN},
    transport::{Transport, TransportError},
    BufferPool, ConnectionSide, Error, Established, PeerId, Result, Session, Stats,
};

#[cfg(doc)]
use crate::{Config, RoutingTable};

/// A remote peer with an established secure session.
///
/// Messages are exchanged via [`Peer::send`] and [`Peer::receive`], which take care of the framing,
/// the encryption and the signatures. A send and a receive may run concurrently, while multiple
/// sends (or receives) are carried out one at a time.
///
/// A node keeps its peers in a [`RoutingTable`], under the address they are connected from.
pub struct Peer {
    /// The peer's identity, derived from its static public key.
    id: PeerId,
    /// The address the peer is registered under.
    addr: SocketAddr,
    /// The side of the connection from the peer's perspective.
    side: ConnectionSide,
    /// The crypto half of the session.
    session: Box<dyn Session>,
    /// The I/O half of the session.
    transport: Transport,
    /// The pool shared with the other peers of the node.
    pool: BufferPool,
    /// The admission bound on inbound frame payloads; see [`Config::max_payload_size`].
    max_payload_size: usize,
    /// The peer's own message stats.
    stats: Stats,
    /// The owning node's stats, if there is one.
    node_stats: Option<Arc<Stats>>,
    /// The tracing span.
    span: Span,
}

impl Peer {
    /// Creates a peer over an established session; cancelling `closed` closes its transport.
    pub fn new(
        addr: SocketAddr,
        side: ConnectionSide,
        established: Established,
        pool: BufferPool,
        max_payload_size: usize,
        closed: CancellationToken,
    ) -> Self {
        let Established {
            session,
            reader,
            writer,
        } = established;
        let id = PeerId::from_public_key(session.remote_public_key());

        Self {
            id,
            addr,
            side,
            session,
            transport: Transport::new(reader, writer, closed),
            pool,
            max_payload_size,
            stats: Default::default(),
            node_stats: None,
            span: debug_span!("peer", %addr),
        }
    }

    /// Makes the peer also account its traffic in the stats of the owning node, and log within
    /// the node's span.
    pub(crate) fn with_node(mut self, stats: Arc<Stats>, node_span: &Span) -> Self {
        self.node_stats = Some(stats);
        self.span = debug_span!(parent: node_span, "peer", addr = %self.addr);
        self
    }

    /// Returns the peer's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Returns the address the peer is registered under.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the side of the connection from the peer's perspective.
    pub fn side(&self) -> ConnectionSide {
        self.side
    }

    /// Returns the peer's static public key.
    pub fn remote_public_key(&self) -> &[u8] {
        self.session.remote_public_key()
    }

    /// Returns the peer's message stats.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the tracing [`Span`] associated with the peer.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Sets the deadline for all the subsequent reads and writes; once it passes, the connection
    /// is considered dead.
    pub fn set_deadline(&self, deadline: Instant) {
        self.transport.set_deadline(deadline);
    }

    /// Encrypts, signs and sends a message; returns the number of bytes written to the stream,
    /// including the frame header.
    ///
    /// Partial writes are not retried; if the stream turns out to be closed, so is the peer.
    pub async fn send(&self, message: &[u8]) -> Result<usize> {
        let mut digest = self.pool.get_with_capacity(message.len());
        self.session
            .encrypt(&mut digest, message)
            .map_err(Error::Encrypt)?;
        let signature = self.session.sign(&digest);

        // a conforming receiver would reject a larger frame anyway
        let payload_len = packet::encoded_len(signature.len(), digest.len());
        if payload_len > self.max_payload_size {
            return Err(Error::MaxPayloadExceeded {
                declared: payload_len,
                max: self.max_payload_size,
            });
        }

        let mut frame = self.pool.get_with_capacity(FRAME_HEADER_LEN + payload_len);
        let len = packet::encode_frame(&signature, &digest, &mut frame)?;

        if let Err(e) = self.transport.write_all(&frame).await {
            return Err(self.on_transport_error(e).await);
        }

        trace!(parent: &self.span, "sent {len}B");
        self.stats.register_sent_message(len);
        if let Some(ref stats) = self.node_stats {
            stats.register_sent_message(len);
        }

        Ok(len)
    }

    /// Waits for the next message, then verifies and decrypts it.
    ///
    /// Returns `Ok(None)` for an empty frame. Rejected packets ([`Error::SignatureVerificationFailed`],
    /// [`Error::MaxPayloadExceeded`], [`Error::MalformedPacket`]) and [`Error::Decrypt`] failures
    /// leave the connection open; if the stream turns out to be closed, so is the peer.
    pub async fn receive(&self) -> Result<Option<Bytes>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = self.transport.read_exact(&mut header).await {
            return Err(self.on_transport_error(e).await);
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            trace!(parent: &self.span, "received an empty frame");
            return Ok(None);
        }
        if len > self.max_payload_size {
            return Err(Error::MaxPayloadExceeded {
                declared: len,
                max: self.max_payload_size,
            });
        }

        let mut payload = self.pool.get_with_capacity(len);
        payload.resize(len, 0);
        if let Err(e) = self.transport.read_exact(&mut payload).await {
            return Err(self.on_transport_error(e).await);
        }

        let packet = Packet::decode(&payload)?;
        // never attempt to decrypt unauthenticated data
        if !self.session.verify(&packet.digest, &packet.signature) {
            return Err(Error::SignatureVerificationFailed);
        }

        let mut plaintext = self.pool.get_with_capacity(packet.digest.len());
        self.session
            .decrypt(&mut plaintext, &packet.digest)
            .map_err(Error::Decrypt)?;

        let frame_len = FRAME_HEADER_LEN + len;
        trace!(parent: &self.span, "received {frame_len}B");
        self.stats.register_received_message(frame_len);
        if let Some(ref stats) = self.node_stats {
            stats.register_received_message(frame_len);
        }

        Ok(Some(Bytes::copy_from_slice(&plaintext)))
    }

    /// Closes the session; any pending I/O is interrupted. Closing an already closed peer is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        if !self.transport.is_closed() {
            debug!(parent: &self.span, "closing the session");
        }
        self.transport.close().await
    }

    /// Checks whether the peer's session has been closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Closes the session if the error indicates a dead stream.
    async fn on_transport_error(&self, e: TransportError) -> Error {
        if e.is_disconnect() {
            if let Err(close_err) = self.close().await {
                trace!(parent: &self.span, "couldn't shut the stream down cleanly: {close_err}");
            }
        }

        e.into()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}
