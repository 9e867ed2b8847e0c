//! A secured peer-to-peer transport layer: length-prefixed frames carrying signed, encrypted
//! packets, a concurrent registry of live peers, and lifecycle events delivered to subscribers.

mod broker;
mod config;
mod error;
mod events;
mod identity;
mod node;
pub mod packet;
mod peer;
mod pool;
mod router;
mod session;
mod stats;
#[cfg(any(test, feature = "test"))]
pub mod testing;
mod transport;

pub use broker::{Broker, Event, Header, Signal, Subscriber};
pub use config::Config;
pub use error::{Error, ErrorClass, Result, SessionError};
pub use identity::{ConnectionSide, PeerId, PEER_ID_LEN};
pub use node::Node;
pub use peer::Peer;
pub use pool::{BufferPool, PooledBuffer};
pub use router::RoutingTable;
pub use session::{BoxedReader, BoxedWriter, Established, Handshake, Session};
pub use stats::Stats;
pub use transport::{Transport, TransportError};
