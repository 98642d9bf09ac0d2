//! Overlay and transport contracts

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use swarmcast_core::{SwarmcastResult, TopicId};

/// Roles announced when joining a topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinMode {
    /// Look up other peers announcing the topic
    pub client: bool,
    /// Announce ourselves so others can connect
    pub server: bool,
}

impl JoinMode {
    pub fn both() -> Self {
        Self {
            client: true,
            server: true,
        }
    }
}

impl Default for JoinMode {
    fn default() -> Self {
        Self::both()
    }
}

/// What the overlay tells us about a remote peer
#[derive(Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote_key: [u8; 32],
    /// We initiated the connection
    pub client: bool,
}

impl PeerInfo {
    pub fn new(remote_key: [u8; 32], client: bool) -> Self {
        Self { remote_key, client }
    }

    pub fn short_key(&self) -> String {
        self.remote_key[..4]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}.., client={})", self.short_key(), self.client)
    }
}

/// Inbound transport events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One message-framed block
    Data(Bytes),
    /// Stream closed (locally or by the remote)
    Closed,
    /// Stream failed
    Error(String),
}

/// Inbound event stream of one transport
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// An established, message-framed stream to one peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Write one message
    async fn write(&self, data: Bytes) -> SwarmcastResult<()>;

    /// Gracefully end the stream. Ending twice is a no-op.
    async fn end(&self);

    fn is_open(&self) -> bool;
}

/// A connection handed over by the overlay
pub struct IncomingPeer {
    pub transport: Arc<dyn PeerTransport>,
    pub events: TransportEvents,
    pub info: PeerInfo,
}

impl fmt::Debug for IncomingPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingPeer")
            .field("info", &self.info)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

/// Handle for one topic registration
#[async_trait]
pub trait Discovery: Send + Sync {
    fn topic(&self) -> TopicId;

    /// Resolves once we are announced and reachable on the topic
    async fn flushed(&self) -> SwarmcastResult<()>;
}

/// Result of joining a topic
pub struct Registration {
    pub discovery: Box<dyn Discovery>,
    /// Connections made on behalf of this registration
    pub incoming: mpsc::UnboundedReceiver<IncomingPeer>,
}

/// The discovery / transport overlay
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Register for a topic. At most one registration per topic is live.
    async fn join(&self, topic: TopicId, mode: JoinMode) -> SwarmcastResult<Registration>;

    /// Drop the registration for a topic. Leaving an unknown topic is a no-op.
    async fn leave(&self, topic: TopicId) -> SwarmcastResult<()>;

    /// Tear the overlay down
    async fn destroy(&self);
}
