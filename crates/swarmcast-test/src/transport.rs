//! Scriptable peer transports
//!
//! A [`TestTransport`] is the relay's end of a connection. The test keeps
//! the matching [`PeerHandle`] to play the remote side: inject inbound
//! blocks, close the stream, and inspect what the relay wrote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;

use swarmcast_core::{MediaChunk, SwarmcastError, SwarmcastResult};
use swarmcast_transport::{IncomingPeer, PeerInfo, PeerTransport, TransportEvent};

/// How writes to a test transport behave
#[derive(Clone, Debug)]
pub enum WriteBehavior {
    /// Every write succeeds
    Deliver,
    /// Every write fails
    Fail,
    /// Writes never complete
    Hang,
    /// Writes fail at random with a seeded generator
    Flaky { failure_rate: f64, seed: u64 },
}

pub struct TestTransport {
    behavior: WriteBehavior,
    rng: Mutex<StdRng>,
    writes: Mutex<Vec<(Instant, Bytes)>>,
    ended: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TestTransport {
    fn fails_now(&self) -> bool {
        match &self.behavior {
            WriteBehavior::Deliver | WriteBehavior::Hang => false,
            WriteBehavior::Fail => true,
            WriteBehavior::Flaky { failure_rate, .. } => {
                self.rng.lock().gen_bool(failure_rate.clamp(0.0, 1.0))
            }
        }
    }
}

#[async_trait]
impl PeerTransport for TestTransport {
    async fn write(&self, data: Bytes) -> SwarmcastResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(SwarmcastError::TransportClosed("stream ended".into()));
        }
        if matches!(self.behavior, WriteBehavior::Hang) {
            std::future::pending::<()>().await;
        }
        if self.fails_now() {
            return Err(SwarmcastError::TransportClosed("injected write failure".into()));
        }
        self.writes.lock().push((Instant::now(), data));
        Ok(())
    }

    async fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    fn is_open(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }
}

/// The remote side of a [`TestTransport`]
#[derive(Clone)]
pub struct PeerHandle {
    transport: Arc<TestTransport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    info: PeerInfo,
}

impl PeerHandle {
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Deliver a raw block to the relay
    pub fn send(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::Data(data.into()));
    }

    pub fn send_chunk(&self, chunk: &MediaChunk) {
        self.send(swarmcast_wire::encode(chunk));
    }

    /// The remote closes the stream
    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_string()));
    }

    /// Whether the relay ended the stream
    pub fn is_ended(&self) -> bool {
        self.transport.ended.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(Instant, Bytes)> {
        self.transport.writes.lock().clone()
    }

    /// Everything the relay wrote, parsed back into chunks
    pub fn chunks(&self) -> Vec<MediaChunk> {
        self.transport
            .writes
            .lock()
            .iter()
            .filter_map(|(_, data)| swarmcast_wire::decode(data).ok())
            .collect()
    }

    pub fn video_chunks(&self) -> Vec<MediaChunk> {
        self.chunks()
            .into_iter()
            .filter(|c| c.media_kind() == Some(swarmcast_core::MediaKind::Video))
            .collect()
    }

    /// Arrival times of the video keyframes written so far
    pub fn keyframe_times(&self) -> Vec<Instant> {
        self.transport
            .writes
            .lock()
            .iter()
            .filter(|(_, data)| swarmcast_wire::decode(data).is_ok_and(|c| c.keyframe))
            .map(|(at, _)| *at)
            .collect()
    }
}

/// Build a connection for the relay plus the handle playing its remote
pub fn test_peer(behavior: WriteBehavior, key: u8) -> (IncomingPeer, PeerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let seed = match &behavior {
        WriteBehavior::Flaky { seed, .. } => *seed,
        _ => u64::from(key),
    };
    let transport = Arc::new(TestTransport {
        behavior,
        rng: Mutex::new(StdRng::seed_from_u64(seed)),
        writes: Mutex::new(Vec::new()),
        ended: AtomicBool::new(false),
        events: tx.clone(),
    });
    let info = PeerInfo::new([key; 32], false);

    let handle = PeerHandle {
        transport: Arc::clone(&transport),
        events: tx,
        info: info.clone(),
    };
    let peer = IncomingPeer {
        transport,
        events: rx,
        info,
    };
    (peer, handle)
}
