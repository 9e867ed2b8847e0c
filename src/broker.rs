use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::*;

use crate::PeerId;

/// A sequential identifier assigned to every [`Subscriber`].
static SUBSCRIBER_ID: AtomicUsize = AtomicUsize::new(0);

/// The kinds of lifecycle events emitted by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    /// A peer has connected; the payload is its socket address.
    PeerConnected = 0,
    /// A message was received from a peer; the payload is the message.
    MessageReceived = 1,
    /// A peer has disconnected; the payload is its socket address.
    PeerDisconnected = 2,
}

impl Event {
    /// All the event kinds.
    pub const ALL: [Event; 3] = [
        Event::PeerConnected,
        Event::MessageReceived,
        Event::PeerDisconnected,
    ];
}

impl From<Event> for u8 {
    fn from(event: Event) -> Self {
        event as u8
    }
}

impl TryFrom<u8> for Event {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PeerConnected),
            1 => Ok(Self::MessageReceived),
            2 => Ok(Self::PeerDisconnected),
            other => Err(other),
        }
    }
}

/// Describes the origin and kind of a [`Signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// The identity of the peer the event concerns.
    pub peer: PeerId,
    /// The address of the peer the event concerns.
    pub addr: SocketAddr,
    /// The kind of the event.
    pub event: Event,
}

/// A notification about a single event, along with its payload.
#[derive(Clone, Debug)]
pub struct Signal {
    header: Header,
    payload: Bytes,
}

impl Signal {
    /// Creates a signal from its header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Returns the signal's header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the event the signal is about.
    pub fn event(&self) -> Event {
        self.header.event
    }

    /// Returns the identity of the peer the signal concerns.
    pub fn peer(&self) -> PeerId {
        self.header.peer
    }

    /// Returns the socket address of the peer the signal concerns.
    pub fn addr(&self) -> SocketAddr {
        self.header.addr
    }

    /// The peer's socket address for lifecycle events, the message for [`Event::MessageReceived`].
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the signal, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Receives the [`Signal`]s the [`Broker`] delivers to it and forwards them to an external channel.
///
/// Each subscriber owns a bounded queue; when its consumer falls behind, the oldest queued signals
/// are dropped, so publishers never wait for a slow consumer.
pub struct Subscriber {
    id: usize,
    /// The sending end of the queue; gone once the subscriber is flushed.
    queue: Mutex<Option<broadcast::Sender<Signal>>>,
    /// The receiving end of the queue; taken over by the forwarding task on `listen`.
    inbox: Mutex<Option<broadcast::Receiver<Signal>>>,
    /// Keeps the external channel open for as long as the subscriber exists.
    outlet: Mutex<Option<mpsc::Sender<Signal>>>,
}

impl Subscriber {
    /// Creates a subscriber with a queue of at least the given depth (and at least 1), rounded up
    /// to the next power of two.
    pub fn new(queue_depth: usize) -> Arc<Self> {
        let (queue, inbox) = broadcast::channel(queue_depth.max(1));

        Arc::new(Self {
            id: SUBSCRIBER_ID.fetch_add(1, Relaxed),
            queue: Mutex::new(Some(queue)),
            inbox: Mutex::new(Some(inbox)),
            outlet: Default::default(),
        })
    }

    /// Returns the subscriber's unique identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Starts forwarding all the received signals (including those already queued) to `outlet`;
    /// returns `false` if the subscriber is already forwarding them elsewhere.
    ///
    /// note: It needs to be called within a `tokio` runtime.
    pub fn listen(&self, outlet: mpsc::Sender<Signal>) -> bool {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("subscriber {} already has a listener", self.id);
            return false;
        };
        *self.outlet.lock() = Some(outlet.clone());

        let id = self.id;
        tokio::spawn(async move {
            trace!("subscriber {id} is forwarding signals");
            loop {
                match inbox.recv().await {
                    Ok(signal) => {
                        if outlet.send(signal).await.is_err() {
                            debug!("the consumer of subscriber {id} is gone");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("subscriber {id} dropped {n} signal(s) due to a slow consumer");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!("subscriber {id} stopped forwarding signals");
        });

        true
    }

    /// Queues a signal; returns `false` if it can't be delivered.
    fn deliver(&self, signal: Signal) -> bool {
        match self.queue.lock().as_ref() {
            Some(queue) => queue.send(signal).is_ok(),
            None => false,
        }
    }

    /// Stops accepting signals; the ones already queued are still forwarded.
    fn flush(&self) {
        self.queue.lock().take();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("listening", &self.inbox.lock().is_none())
            .finish()
    }
}

/// Distributes [`Signal`]s to the [`Subscriber`]s registered for their [`Event`]s.
#[derive(Default)]
pub struct Broker {
    topics: RwLock<HashMap<Event, Vec<Arc<Subscriber>>>>,
    flushed: AtomicBool,
}

impl Broker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a subscriber for an event; returns `false` if it already was registered for it, or
    /// if the broker has been flushed.
    pub fn register(&self, event: Event, subscriber: &Arc<Subscriber>) -> bool {
        if self.is_flushed() {
            return false;
        }

        let mut topics = self.topics.write();
        let subscribers = topics.entry(event).or_default();
        if subscribers.iter().any(|sub| sub.id == subscriber.id) {
            return false;
        }
        subscribers.push(subscriber.clone());

        true
    }

    /// Unregisters a subscriber from an event; returns `false` if it wasn't registered for it.
    pub fn unregister(&self, event: Event, subscriber: &Subscriber) -> bool {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(&event) else {
            return false;
        };
        let count = subscribers.len();
        subscribers.retain(|sub| sub.id != subscriber.id);

        subscribers.len() != count
    }

    /// Hands the signal to every subscriber registered for its event; returns the number of
    /// subscribers it was queued for. It never waits for any consumer.
    pub fn publish(&self, signal: Signal) -> usize {
        let topics = self.topics.read();
        let Some(subscribers) = topics.get(&signal.event()) else {
            return 0;
        };

        subscribers
            .iter()
            .filter(|sub| sub.deliver(signal.clone()))
            .count()
    }

    /// Returns the number of subscribers registered for an event.
    pub fn num_subscribers(&self, event: Event) -> usize {
        self.topics.read().get(&event).map_or(0, Vec::len)
    }

    /// Releases all the registrations and stops accepting new signals; the already queued ones are
    /// still forwarded and the external channels remain open. Only the first call has any effect.
    pub fn flush(&self) {
        if self.flushed.swap(true, AcqRel) {
            return;
        }

        let topics = std::mem::take(&mut *self.topics.write());
        let mut flushed = HashSet::new();
        for subscriber in topics.into_values().flatten() {
            if flushed.insert(subscriber.id) {
                subscriber.flush();
            }
        }
    }

    /// Checks whether the broker has been flushed.
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Acquire)
    }
}
