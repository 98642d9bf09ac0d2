//! Identity types for the relay
//!
//! Connection ids are 64-bit counters scoped to one relay instance.
//! Topic ids are 32-byte digests so that every user-supplied topic string
//! maps onto the fixed-width key the discovery overlay expects.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Width of a topic identifier in bytes
pub const TOPIC_ID_LEN: usize = 32;

/// Connection identity - assigned when a peer connects, never reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const ZERO: ConnectionId = ConnectionId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic allocator for [`ConnectionId`]s.
///
/// Ids start at 1 and only ever increase, so an id stays unique for the
/// lifetime of the allocator even after its connection is gone.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hand out the next unused id
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic identity - the fixed-width rendezvous key on the overlay
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicId([u8; TOPIC_ID_LEN]);

impl TopicId {
    /// Derive a topic id from an arbitrary topic string.
    ///
    /// SHA-256 of the UTF-8 bytes: any input length maps to 32 bytes and
    /// distinct strings sharing a long prefix still yield distinct ids.
    pub fn derive(topic: &str) -> Self {
        let digest = Sha256::digest(topic.as_bytes());
        let mut id = [0u8; TOPIC_ID_LEN];
        id.copy_from_slice(&digest);
        TopicId(id)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; TOPIC_ID_LEN]) -> Self {
        TopicId(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TOPIC_ID_LEN] {
        &self.0
    }

    /// Short hex prefix for log lines
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}..)", self.short())
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocator_never_reuses() {
        let alloc = ConnectionIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();

        assert_eq!(a, ConnectionId::new(1));
        assert!(a < b && b < c);
        assert_eq!(alloc.issued(), 3);
    }

    #[test]
    fn test_topic_derivation_is_stable() {
        let a = TopicId::derive("p2p-screen-sharing");
        let b = TopicId::derive("p2p-screen-sharing");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), TOPIC_ID_LEN);
    }

    #[test]
    fn test_topic_long_inputs_do_not_collide() {
        // Both strings agree on their first 32 bytes; truncation would collide
        let prefix = "x".repeat(TOPIC_ID_LEN);
        let a = TopicId::derive(&format!("{}-alpha", prefix));
        let b = TopicId::derive(&format!("{}-beta", prefix));
        assert_ne!(a, b);
    }

    #[test]
    fn test_topic_display_is_hex() {
        let id = TopicId::from_bytes([0xAB; TOPIC_ID_LEN]);
        let text = id.to_string();
        assert_eq!(text.len(), TOPIC_ID_LEN * 2);
        assert!(text.starts_with("abab"));
        assert_eq!(id.short(), "abababab");
    }

    proptest! {
        #[test]
        fn prop_topics_sharing_a_prefix_stay_distinct(
            prefix in "[a-z0-9-]{32,64}",
            a in "[a-z]{1,8}",
            b in "[a-z]{1,8}",
        ) {
            prop_assume!(a != b);
            let x = TopicId::derive(&format!("{}{}", prefix, a));
            let y = TopicId::derive(&format!("{}{}", prefix, b));
            prop_assert_ne!(x, y);
            prop_assert_eq!(x, TopicId::derive(&format!("{}{}", prefix, a)));
        }
    }
}
