use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::*;

use crate::{Broker, Event, Header, Peer, Signal, Subscriber};

/// The node's event plumbing: a [`Broker`] and the node's own [`Subscriber`], registered for every
/// [`Event`].
pub(crate) struct Events {
    broker: Broker,
    subscriber: Arc<Subscriber>,
}

impl Events {
    pub(crate) fn new(queue_depth: usize) -> Self {
        let broker = Broker::new();
        let subscriber = Subscriber::new(queue_depth);
        for event in Event::ALL {
            broker.register(event, &subscriber);
        }

        Self { broker, subscriber }
    }

    pub(crate) fn broker(&self) -> &Broker {
        &self.broker
    }

    pub(crate) fn peer_connected(&self, peer: &Peer) {
        self.publish(peer, Event::PeerConnected, lifecycle_payload(peer));
    }

    pub(crate) fn message_received(&self, peer: &Peer, message: Bytes) {
        self.publish(peer, Event::MessageReceived, message);
    }

    pub(crate) fn peer_disconnected(&self, peer: &Peer) {
        self.publish(peer, Event::PeerDisconnected, lifecycle_payload(peer));
    }

    /// Forwards the node's own signals to `outlet`; only the first call has any effect.
    pub(crate) fn listen(&self, outlet: mpsc::Sender<Signal>) -> bool {
        self.subscriber.listen(outlet)
    }

    pub(crate) fn flush(&self) {
        self.broker.flush();
    }

    fn publish(&self, peer: &Peer, event: Event, payload: Bytes) {
        let header = Header {
            peer: peer.id(),
            addr: peer.addr(),
            event,
        };
        let delivered = self.broker.publish(Signal::new(header, payload));
        trace!(parent: peer.span(), "published {event:?} to {delivered} subscriber(s)");
    }
}

/// Lifecycle events carry the peer's socket address.
fn lifecycle_payload(peer: &Peer) -> Bytes {
    Bytes::from(peer.addr().to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{testing::peer_pair, BufferPool};

    async fn next(rx: &mut mpsc::Receiver<Signal>) -> Signal {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn lifecycle_signals() {
        let events = Events::new(16);
        let (peer, _remote) = peer_pair(&BufferPool::new(64, 4), 1024);

        let (tx, mut rx) = mpsc::channel(16);
        assert!(events.listen(tx));

        events.peer_connected(&peer);
        events.message_received(&peer, Bytes::from_static(b"hi"));
        events.peer_disconnected(&peer);

        let connected = next(&mut rx).await;
        assert_eq!(connected.event(), Event::PeerConnected);
        assert_eq!(connected.peer(), peer.id());
        assert_eq!(&connected.payload()[..], b"127.0.0.1:10002");

        let message = next(&mut rx).await;
        assert_eq!(message.event(), Event::MessageReceived);
        assert_eq!(&message.payload()[..], b"hi");

        let disconnected = next(&mut rx).await;
        assert_eq!(disconnected.event(), Event::PeerDisconnected);
        assert_eq!(disconnected.addr(), peer.addr());
    }

    #[test]
    fn registered_for_everything() {
        let events = Events::new(1);
        for event in Event::ALL {
            assert_eq!(events.broker().num_subscribers(event), 1);
        }

        events.flush();
        for event in Event::ALL {
            assert_eq!(events.broker().num_subscribers(event), 0);
        }
    }
}
