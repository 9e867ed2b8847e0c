use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{timeout, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::*;

use crate::{
    events::Events, BufferPool, Broker, Config, ConnectionSide, Error, Handshake, Peer, Result,
    RoutingTable, Signal, Stats,
};

/// A sequential numeric identifier assigned to `Node`s that were not provided with a name.
static SEQUENTIAL_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// The number of consecutive transient read errors after which a peer is dropped.
const MAX_TRANSIENT_ERRORS: u32 = 8;

/// The pause after a transient read error, multiplied by the number of consecutive ones.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// The central object responsible for handling connections.
#[derive(Clone)]
pub struct Node(Arc<InnerNode>);

impl Deref for Node {
    type Target = Arc<InnerNode>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The actual node object that gets wrapped in an Arc in the Node.
#[doc(hidden)]
pub struct InnerNode {
    /// The tracing span.
    span: Span,
    /// The node's configuration.
    config: Config,
    /// The node's current listening address.
    listening_addr: RwLock<Option<SocketAddr>>,
    /// Establishes the secure sessions.
    handshake: Box<dyn Handshake>,
    /// A list of connections that have not been finalized yet.
    connecting: Mutex<HashSet<SocketAddr>>,
    /// The registry of live peers.
    routing: RoutingTable,
    /// The broker and the node's own subscriber.
    events: Events,
    /// The buffers shared by all the peers.
    pool: BufferPool,
    /// Cancelled once the node is shut down; every peer's transport observes a child token.
    closed: CancellationToken,
    /// Set by the first call to `Node::shut_down`.
    shutting_down: AtomicBool,
    /// The accept loop, the inbound connection requests and the reader loops.
    tasks: TaskTracker,
    /// Collects statistics related to the node itself.
    stats: Arc<Stats>,
}

// A helper object which ensures that a connecting entry is unique and eventually cleaned up.
struct ConnectionGuard<'a> {
    addr: SocketAddr,
    connecting: &'a Mutex<HashSet<SocketAddr>>,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.connecting.lock().remove(&self.addr);
    }
}

impl Node {
    /// Creates a new [`Node`] using the given [`Config`] and a [`Handshake`] implementation.
    pub fn new(mut config: Config, handshake: impl Handshake) -> Self {
        // if there is no pre-configured name, assign a sequential numeric identifier
        let name = config
            .name
            .get_or_insert_with(|| SEQUENTIAL_NODE_ID.fetch_add(1, SeqCst).to_string())
            .clone();

        // create a tracing span containing the node's name
        let span = create_span(&name);

        let node = Node(Arc::new(InnerNode {
            span,
            listening_addr: Default::default(),
            handshake: Box::new(handshake),
            connecting: Default::default(),
            routing: Default::default(),
            events: Events::new(config.signal_queue_depth),
            pool: BufferPool::new(config.buffer_size, config.pool_max_idle),
            closed: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            stats: Default::default(),
            config,
        }));

        debug!(parent: node.span(), "the node is ready");

        node
    }

    /// Starts listening for inbound connections; returns the actual bound address, which will
    /// differ from the one in [`Config::listener_addr`] if that one's port was unspecified (i.e. `0`).
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(Error::Listen("the node is closed"));
        }
        let listener_addr = self
            .config
            .listener_addr
            .ok_or(Error::Listen("Config::listener_addr is not set"))?;
        if self.listening_addr.read().is_some() {
            return Err(Error::Listen("already listening"));
        }

        let listener = TcpListener::bind(listener_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: listener_addr,
                source,
            })?;
        // discover the port if it was unspecified
        let port = listener
            .local_addr()
            .map_err(|source| Error::Bind {
                addr: listener_addr,
                source,
            })?
            .port();
        let new_listening_addr = (listener_addr.ip(), port).into();

        {
            let mut listening_addr = self.listening_addr.write();
            if listening_addr.is_some() {
                return Err(Error::Listen("already listening"));
            }
            *listening_addr = Some(new_listening_addr);
        }

        // spawn a task responsible for listening for inbound connections
        let node = self.clone();
        self.tasks.spawn(async move {
            trace!(parent: node.span(), "spawned the listening task");
            loop {
                tokio::select! {
                    _ = node.closed.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, addr)) => {
                            // handle connection requests asynchronously
                            let node_clone = node.clone();
                            node.tasks.spawn(async move {
                                node_clone.handle_connection_request(stream, addr).await
                            });
                        }
                        Err(e) => {
                            error!(parent: node.span(), "couldn't accept a connection: {e}");
                        }
                    }
                }
            }
            trace!(parent: node.span(), "the listening task is finished");
        });
        debug!(parent: self.span(), "listening on {new_listening_addr}");

        Ok(new_listening_addr)
    }

    /// Processes a single inbound connection request. Only used in [`Node::start_listening`].
    async fn handle_connection_request(&self, stream: TcpStream, addr: SocketAddr) {
        debug!(parent: self.span(), "tentatively accepted a connection from {addr}");

        // check if no connection-related limits are breached, and mark the connection as connecting
        let guard = match self.admit(addr) {
            Ok(guard) => guard,
            Err(e) => {
                debug!(parent: self.span(), "rejecting the connection from {addr}: {e}");
                return;
            }
        };

        // finalize the connection
        if let Err(e) = self
            .establish(stream, addr, ConnectionSide::Responder, guard)
            .await
        {
            error!(parent: self.span(), "couldn't accept a connection from {addr}: {e}");
        }
    }

    /// Returns the name assigned to the node.
    #[inline]
    pub fn name(&self) -> &str {
        // always set by Node::new
        self.config.name.as_deref().unwrap_or_default()
    }

    /// Returns a reference to the node's config.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the node's stats.
    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the tracing [`Span`] associated with the node.
    #[inline]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the node's current listening address, if it is listening.
    pub fn listening_addr(&self) -> Option<SocketAddr> {
        *self.listening_addr.read()
    }

    /// Returns the node's [`Broker`], so that additional [`Subscriber`](crate::Subscriber)s can
    /// be registered for selected events.
    pub fn broker(&self) -> &Broker {
        self.events.broker()
    }

    /// Returns a receiver of all the node's [`Signal`]s; returns `None` if it was already handed out.
    ///
    /// note: It needs to be called within a `tokio` runtime.
    pub fn signals(&self) -> Option<mpsc::Receiver<Signal>> {
        let (tx, rx) = mpsc::channel(self.config.signal_queue_depth.max(1));
        self.events.listen(tx).then_some(rx)
    }

    /// Returns the peer registry.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Checks whether the node has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Checks whether the node can handle an additional connection with the given address and, if
    /// so, marks it as connecting.
    fn admit(&self, addr: SocketAddr) -> Result<ConnectionGuard<'_>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        // the limits are checked and the slot is taken under a single lock
        let mut connecting = self.connecting.lock();
        if self.routing.contains(addr) || connecting.contains(&addr) {
            return Err(Error::AlreadyConnected(addr));
        }

        let num_connecting = connecting.len();
        let limit = self.config.max_peers_connected as usize;
        if self.num_connected() + num_connecting >= limit {
            warn!(parent: self.span(), "maximum number of peers ({limit}) reached");
            return Err(Error::TooManyPeers(limit));
        }

        let limit = self.config.max_connecting as usize;
        if num_connecting >= limit {
            warn!(parent: self.span(), "maximum number of pending connections ({limit}) reached");
            return Err(Error::TooManyPeers(limit));
        }

        connecting.insert(addr);

        Ok(ConnectionGuard {
            addr,
            connecting: &self.connecting,
        })
    }

    // A helper method to facilitate a common potential disconnect at the callsite.
    async fn create_stream(&self, addr: SocketAddr) -> Result<TcpStream> {
        match timeout(
            Duration::from_millis(self.config.connection_timeout_ms.into()),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(Error::Dial { addr, source }),
            Err(_) => Err(Error::Dial {
                addr,
                source: io::ErrorKind::TimedOut.into(),
            }),
        }
    }

    /// Connects to the provided `SocketAddr`, returning the resulting [`Peer`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Peer>> {
        // a simple self-connect attempt check
        if let Some(listening_addr) = self.listening_addr() {
            if addr == listening_addr
                || addr.ip().is_loopback() && addr.port() == listening_addr.port()
            {
                error!(parent: self.span(), "can't connect to node's own listening address ({addr})");
                return Err(Error::Dial {
                    addr,
                    source: io::ErrorKind::AddrInUse.into(),
                });
            }
        }

        // a shutdown waits for the connection to either be registered or fail
        let _task = self.tasks.token();

        // make sure connection-related limits are not breached, and mark the connection as connecting
        let guard = self.admit(addr).inspect_err(|e| {
            error!(parent: self.span(), "refusing to connect to {addr}: {e}");
        })?;

        // attempt to physically connect to the specified address
        let stream = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::Closed),
            res = self.create_stream(addr) => res?,
        };

        // attempt to finalize the connection
        self.establish(stream, addr, ConnectionSide::Initiator, guard)
            .await
            .inspect_err(|e| {
                error!(parent: self.span(), "couldn't connect to {addr}: {e}");
            })
    }

    /// Performs the handshake over a freshly acquired stream and registers the resulting peer.
    async fn establish(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        own_side: ConnectionSide,
        guard: ConnectionGuard<'_>,
    ) -> Result<Arc<Peer>> {
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let established = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::Closed),
            res = timeout(handshake_timeout, self.handshake.perform_handshake(addr, stream, own_side)) => {
                match res {
                    Ok(Ok(established)) => established,
                    Ok(Err(source)) => return Err(Error::Handshake { addr, source }),
                    Err(_) => return Err(Error::Handshake { addr, source: io::ErrorKind::TimedOut.into() }),
                }
            }
        };
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let peer = Peer::new(
            addr,
            !own_side,
            established,
            self.pool.clone(),
            self.config.max_payload_size,
            self.closed.child_token(),
        )
        .with_node(self.stats.clone(), self.span());
        peer.set_deadline(Instant::now() + self.config.peer_deadline);

        // connecting -> connected
        let peer = self.routing.add(Arc::new(peer));
        drop(guard);

        // a shutdown may have snapshotted the registry before the peer was added
        if self.is_closed() {
            self.routing.evict(&peer);
            if let Err(e) = peer.close().await {
                trace!(parent: peer.span(), "couldn't close the session cleanly: {e}");
            }
            return Err(Error::Closed);
        }

        debug!(parent: self.span(), "fully connected to {addr} ({})", peer.id());
        self.events.peer_connected(&peer);

        let node = self.clone();
        let reader = peer.clone();
        self.tasks.spawn(async move { node.read_from(reader).await });

        Ok(peer)
    }

    /// Receives messages from the peer until it disconnects, then tears it down.
    async fn read_from(&self, peer: Arc<Peer>) {
        trace!(parent: peer.span(), "spawned the reader loop");

        let mut transient_errors = 0;
        loop {
            peer.set_deadline(Instant::now() + self.config.peer_deadline);

            let res = peer.receive().await;
            if !matches!(res, Err(Error::Transient(_))) {
                transient_errors = 0;
            }

            match res {
                Ok(Some(message)) => self.events.message_received(&peer, message),
                Ok(None) => {}
                Err(e) if e.is_disconnect() => {
                    debug!(parent: peer.span(), "{e}");
                    break;
                }
                Err(e @ Error::MaxPayloadExceeded { .. }) => {
                    // the declared payload was left unread, so the framing is lost
                    warn!(parent: peer.span(), "{e}; dropping the connection");
                    self.register_failure(&peer);
                    break;
                }
                Err(Error::Transient(e)) => {
                    transient_errors += 1;
                    if transient_errors >= MAX_TRANSIENT_ERRORS {
                        warn!(parent: peer.span(), "couldn't read from the stream {transient_errors} times in a row ({e}); dropping the connection");
                        self.register_failure(&peer);
                        break;
                    }
                    warn!(parent: peer.span(), "couldn't read from the stream: {e}");
                    tokio::time::sleep(TRANSIENT_BACKOFF * transient_errors).await;
                }
                Err(e) => {
                    warn!(parent: peer.span(), "rejected an inbound packet: {e}");
                    self.register_failure(&peer);
                }
            }
        }

        self.tear_down(&peer).await;
        trace!(parent: peer.span(), "the reader loop is finished");
    }

    fn register_failure(&self, peer: &Peer) {
        peer.stats().register_failure();
        self.stats.register_failure();
    }

    /// Closes the peer's session, removes it from the registry and announces the disconnect.
    async fn tear_down(&self, peer: &Arc<Peer>) {
        if let Err(e) = peer.close().await {
            trace!(parent: peer.span(), "couldn't close the session cleanly: {e}");
        }
        // a peer that has replaced this one under the same address stays registered
        self.routing.evict(peer);
        debug!(parent: self.span(), "disconnected from {}", peer.addr());

        self.events.peer_disconnected(peer);
    }

    /// Disconnects from the provided `SocketAddr`; returns `true` if it was connected.
    ///
    /// The peer is unregistered at once; the [`Event::PeerDisconnected`](crate::Event) signal
    /// follows as soon as its reader loop notices.
    pub async fn disconnect(&self, addr: SocketAddr) -> bool {
        let Some(peer) = self.routing.query(addr) else {
            debug!(parent: self.span(), "couldn't disconnect from {addr}, as it wasn't connected");
            return false;
        };

        debug!(parent: self.span(), "disconnecting from {addr}");
        self.routing.evict(&peer);
        if let Err(e) = peer.close().await {
            trace!(parent: peer.span(), "couldn't close the session cleanly: {e}");
        }

        true
    }

    /// Sends a message to the peer registered under the given address.
    pub async fn send(&self, addr: SocketAddr, message: &[u8]) -> Result<usize> {
        let peer = self.routing.query(addr).ok_or(Error::UnknownPeer(addr))?;
        peer.send(message).await
    }

    /// Sends a message to every registered peer concurrently; returns the number of successful sends.
    pub async fn broadcast(&self, message: &[u8]) -> usize {
        let peers = self.routing.snapshot();
        let results = join_all(peers.iter().map(|peer| peer.send(message))).await;

        peers
            .iter()
            .zip(results)
            .filter(|(peer, res)| match res {
                Ok(_) => true,
                Err(e) => {
                    warn!(parent: peer.span(), "couldn't broadcast a message: {e}");
                    false
                }
            })
            .count()
    }

    /// Returns the peer registered under the given address.
    pub fn peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.routing.query(addr)
    }

    /// Returns a list containing addresses of active connections.
    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.routing.addrs()
    }

    /// Checks whether the provided address is connected.
    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.routing.contains(addr)
    }

    /// Checks if the node is currently setting up a connection with the provided address.
    pub fn is_connecting(&self, addr: SocketAddr) -> bool {
        self.connecting.lock().contains(&addr)
    }

    /// Returns the number of active connections.
    pub fn num_connected(&self) -> usize {
        self.routing.len()
    }

    /// Returns the number of connections that are currently being set up.
    pub fn num_connecting(&self) -> usize {
        self.connecting.lock().len()
    }

    /// Gracefully shuts the node down; subsequent calls are no-ops.
    ///
    /// All the sessions are closed and every worker exits on its own; once they are all done, the
    /// broker is flushed. The signal channels stay open.
    pub async fn shut_down(&self) {
        if self.shutting_down.swap(true, AcqRel) {
            debug!(parent: self.span(), "already shut down");
            return;
        }
        debug!(parent: self.span(), "shutting down");

        // stops the accept loop and interrupts any pending peer I/O
        self.closed.cancel();

        // close all the sessions independently of one another
        let peers = self.routing.snapshot();
        let results = join_all(peers.iter().map(|peer| peer.close())).await;
        for (peer, res) in peers.iter().zip(results) {
            if let Err(e) = res {
                warn!(parent: peer.span(), "couldn't close the session cleanly: {e}");
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        *self.listening_addr.write() = None;

        self.events.flush();
        debug!(parent: self.span(), "the node is shut down");
    }
}

/// Creates the node's tracing span based on its name, at the most verbose enabled level.
fn create_span(node_name: &str) -> Span {
    let span = trace_span!("node", name = node_name);
    if !span.is_disabled() {
        return span;
    }
    let span = debug_span!("node", name = node_name);
    if !span.is_disabled() {
        return span;
    }
    let span = info_span!("node", name = node_name);
    if !span.is_disabled() {
        return span;
    }
    let span = warn_span!("node", name = node_name);
    if !span.is_disabled() {
        return span;
    }

    error_span!("node", name = node_name)
}
