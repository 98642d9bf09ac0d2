//! In-process overlay
//!
//! Every [`MemoryOverlay`] endpoint created from the same [`MemoryNetwork`]
//! can rendezvous on a topic. Joining connects the newcomer to every
//! endpoint already registered there, handing each side one end of a
//! duplex [`MemoryTransport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use swarmcast_core::{SwarmcastError, SwarmcastResult, TopicId};

use crate::{
    Discovery, IncomingPeer, JoinMode, Overlay, PeerInfo, PeerTransport, Registration,
    TransportEvent,
};

/// One end of an in-process duplex stream
pub struct MemoryTransport {
    to_peer: mpsc::UnboundedSender<TransportEvent>,
    to_self: mpsc::UnboundedSender<TransportEvent>,
    ended: AtomicBool,
    written: AtomicU64,
}

impl MemoryTransport {
    /// Messages written so far
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn write(&self, data: Bytes) -> SwarmcastResult<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(SwarmcastError::TransportClosed("stream ended".into()));
        }
        self.to_peer
            .send(TransportEvent::Data(data))
            .map_err(|_| SwarmcastError::TransportClosed("peer gone".into()))?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        // Both ends observe the close, like a socket pair
        let _ = self.to_peer.send(TransportEvent::Closed);
        let _ = self.to_self.send(TransportEvent::Closed);
    }

    fn is_open(&self) -> bool {
        !self.ended.load(Ordering::Acquire) && !self.to_peer.is_closed()
    }
}

/// Build a connected pair of in-process peers
pub fn duplex(a_info: PeerInfo, b_info: PeerInfo) -> (IncomingPeer, IncomingPeer) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = MemoryTransport {
        to_peer: b_tx.clone(),
        to_self: a_tx.clone(),
        ended: AtomicBool::new(false),
        written: AtomicU64::new(0),
    };
    let b = MemoryTransport {
        to_peer: a_tx,
        to_self: b_tx,
        ended: AtomicBool::new(false),
        written: AtomicU64::new(0),
    };

    (
        IncomingPeer {
            transport: Arc::new(a),
            events: a_rx,
            info: a_info,
        },
        IncomingPeer {
            transport: Arc::new(b),
            events: b_rx,
            info: b_info,
        },
    )
}

struct Member {
    endpoint: u64,
    key: [u8; 32],
    incoming: mpsc::UnboundedSender<IncomingPeer>,
}

#[derive(Default)]
struct NetworkInner {
    topics: HashMap<TopicId, Vec<Member>>,
    next_endpoint: u64,
}

/// Shared rendezvous table
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint on this network
    pub fn endpoint(&self) -> MemoryOverlay {
        let mut inner = self.inner.lock();
        inner.next_endpoint += 1;
        let endpoint = inner.next_endpoint;

        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&endpoint.to_le_bytes());

        MemoryOverlay {
            network: self.clone(),
            endpoint,
            key,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Endpoints currently registered on a topic
    pub fn members(&self, topic: &TopicId) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, Vec::len)
    }
}

/// One endpoint of a [`MemoryNetwork`]
pub struct MemoryOverlay {
    network: MemoryNetwork,
    endpoint: u64,
    key: [u8; 32],
    destroyed: AtomicBool,
}

impl MemoryOverlay {
    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    fn remove_from(&self, topics: &mut HashMap<TopicId, Vec<Member>>, topic: &TopicId) -> bool {
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m.endpoint != self.endpoint);
        let removed = members.len() != before;
        if members.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

struct MemoryDiscovery {
    topic: TopicId,
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    fn topic(&self) -> TopicId {
        self.topic
    }

    async fn flushed(&self) -> SwarmcastResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    async fn join(&self, topic: TopicId, mode: JoinMode) -> SwarmcastResult<Registration> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SwarmcastError::DiscoveryFailed("overlay destroyed".into()));
        }

        let mut inner = self.network.inner.lock();
        let members = inner.topics.entry(topic).or_default();
        if members.iter().any(|m| m.endpoint == self.endpoint) {
            return Err(SwarmcastError::DiscoveryFailed(format!(
                "topic {} already registered",
                topic.short()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        if mode.client {
            members.retain(|m| !m.incoming.is_closed());
            for member in members.iter() {
                let (ours, theirs) = duplex(
                    PeerInfo::new(member.key, true),
                    PeerInfo::new(self.key, false),
                );
                if member.incoming.send(theirs).is_ok() {
                    let _ = tx.send(ours);
                }
            }
            debug!(topic = %topic.short(), peers = members.len(), "connected to announced peers");
        }

        if mode.server {
            members.push(Member {
                endpoint: self.endpoint,
                key: self.key,
                incoming: tx,
            });
        }

        info!(topic = %topic.short(), endpoint = self.endpoint, "joined topic");
        Ok(Registration {
            discovery: Box::new(MemoryDiscovery { topic }),
            incoming: rx,
        })
    }

    async fn leave(&self, topic: TopicId) -> SwarmcastResult<()> {
        let mut inner = self.network.inner.lock();
        if self.remove_from(&mut inner.topics, &topic) {
            info!(topic = %topic.short(), endpoint = self.endpoint, "left topic");
        }
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.network.inner.lock();
        let topics: Vec<TopicId> = inner.topics.keys().copied().collect();
        for topic in topics {
            self.remove_from(&mut inner.topics, &topic);
        }
        debug!(endpoint = self.endpoint, "overlay destroyed");
    }
}
