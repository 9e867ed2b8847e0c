use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

#[cfg(doc)]
use crate::{BufferPool, Node, Peer, Subscriber};

/// The node's configuration. See the source of [`Config::default`] for the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// A user-friendly identifier of the node. It is visible in the logs, where it allows nodes to be
    /// distinguished more easily if multiple are run at the same time.
    ///
    /// note: If set to `None` when the node is created, it will be set to a sequential number.
    pub name: Option<String>,
    /// The IP address and port the node's listener binds to; it is only used once
    /// [`Node::start_listening`] is called.
    ///
    /// note: If the port is set to `0`, the OS picks a random available one.
    pub listener_addr: Option<SocketAddr>,
    /// The upper bound on the number of concurrently registered peers; new connections are refused
    /// before a [`Peer`] is built once it is reached.
    pub max_peers_connected: u16,
    /// The maximum number of connections that can be in the process of being set up at once.
    pub max_connecting: u16,
    /// The maximum time (in milliseconds) allowed to establish a raw (before the handshake) connection.
    pub connection_timeout_ms: u16,
    /// The maximum time (in milliseconds) allowed for the session handshake.
    pub handshake_timeout_ms: u64,
    /// How long a peer may stay idle before its connection times out and is considered dead.
    pub peer_deadline: Duration,
    /// The largest frame payload (in bytes) a [`Peer`] accepts; larger declared lengths are rejected
    /// without allocating or reading them.
    pub max_payload_size: usize,
    /// The base capacity of the buffers handed out by the [`BufferPool`].
    pub buffer_size: usize,
    /// The maximum number of idle buffers the [`BufferPool`] retains.
    pub pool_max_idle: usize,
    /// The minimum depth of each [`Subscriber`]'s signal queue, rounded up to the next power of
    /// two; once the queue is full, the oldest queued signals are dropped in favor of new ones.
    pub signal_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            listener_addr: Some((IpAddr::V4(Ipv4Addr::LOCALHOST), 0).into()),
            max_peers_connected: 100,
            max_connecting: 50,
            connection_timeout_ms: 1_000,
            handshake_timeout_ms: 3_000,
            peer_deadline: Duration::from_secs(1_800),
            max_payload_size: 4 * 1024 * 1024,
            buffer_size: 64 * 1024,
            pool_max_idle: 64,
            signal_queue_depth: 1024,
        }
    }
}
