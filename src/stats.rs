use std::{
    sync::atomic::{AtomicU64, Ordering::Relaxed},
    time::Instant,
};

/// Message and byte counters for a single direction.
#[derive(Debug, Default)]
struct Traffic {
    msgs: AtomicU64,
    bytes: AtomicU64,
}

impl Traffic {
    fn register(&self, size: usize) {
        self.msgs.fetch_add(1, Relaxed);
        self.bytes.fetch_add(size as u64, Relaxed);
    }

    fn load(&self) -> (u64, u64) {
        (self.msgs.load(Relaxed), self.bytes.load(Relaxed))
    }
}

/// Contains basic statistics related to a node or a single peer.
#[derive(Debug)]
pub struct Stats {
    /// The creation time.
    created: Instant,
    /// Outbound messages, framing included.
    sent: Traffic,
    /// Inbound messages that were verified and decrypted, framing included.
    received: Traffic,
    /// The number of rejected inbound packets.
    failures: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            created: Instant::now(),
            sent: Default::default(),
            received: Default::default(),
            failures: Default::default(),
        }
    }
}

impl Stats {
    /// Registers a sent message of the provided `size` in bytes.
    pub fn register_sent_message(&self, size: usize) {
        self.sent.register(size);
    }

    /// Registers a received message of the provided `size` in bytes.
    pub fn register_received_message(&self, size: usize) {
        self.received.register(size);
    }

    /// Registers a rejected inbound packet.
    pub fn register_failure(&self) {
        self.failures.fetch_add(1, Relaxed);
    }

    /// Returns the creation time of the node or peer.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns the number of sent messages and their collective size in bytes.
    pub fn sent(&self) -> (u64, u64) {
        self.sent.load()
    }

    /// Returns the number of received messages and their collective size in bytes.
    pub fn received(&self) -> (u64, u64) {
        self.received.load()
    }

    /// Returns the number of rejected inbound packets.
    pub fn failures(&self) -> u64 {
        self.failures.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = Stats::default();
        stats.register_sent_message(10);
        stats.register_sent_message(5);
        stats.register_received_message(7);
        stats.register_failure();

        assert_eq!(stats.sent(), (2, 15));
        assert_eq!(stats.received(), (1, 7));
        assert_eq!(stats.failures(), 1);
        assert!(stats.created() <= Instant::now());
    }
}
