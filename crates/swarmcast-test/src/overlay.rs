//! Scripted overlay
//!
//! Hands connections to the relay only when the test says so, and can be
//! told to fail joins or announcements.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use swarmcast_core::{SwarmcastError, SwarmcastResult, TopicId};
use swarmcast_transport::{Discovery, IncomingPeer, JoinMode, Overlay, Registration};

#[derive(Debug, Default)]
pub struct OverlayProbe {
    pub joins: AtomicU32,
    pub leaves: AtomicU32,
    pub destroyed: AtomicBool,
}

impl OverlayProbe {
    pub fn joins(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> u32 {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ScriptState {
    incoming: Option<mpsc::UnboundedSender<IncomingPeer>>,
    topic: Option<TopicId>,
    fail_join: bool,
    fail_flush: bool,
}

#[derive(Default)]
pub struct ScriptedOverlay {
    script: Mutex<ScriptState>,
    probe: OverlayProbe,
}

impl ScriptedOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &OverlayProbe {
        &self.probe
    }

    pub fn fail_join(&self, fail: bool) {
        self.script.lock().fail_join = fail;
    }

    pub fn fail_flush(&self, fail: bool) {
        self.script.lock().fail_flush = fail;
    }

    /// Topic of the live registration
    pub fn registered(&self) -> Option<TopicId> {
        self.script.lock().topic
    }

    /// Hand a connection to the relay. False when nobody is registered.
    pub fn connect(&self, peer: IncomingPeer) -> bool {
        match &self.script.lock().incoming {
            Some(incoming) => incoming.send(peer).is_ok(),
            None => false,
        }
    }
}

struct ScriptedDiscovery {
    topic: TopicId,
    fail_flush: bool,
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    fn topic(&self) -> TopicId {
        self.topic
    }

    async fn flushed(&self) -> SwarmcastResult<()> {
        if self.fail_flush {
            return Err(SwarmcastError::DiscoveryFailed("announce timed out".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Overlay for ScriptedOverlay {
    async fn join(&self, topic: TopicId, _mode: JoinMode) -> SwarmcastResult<Registration> {
        self.probe.joins.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.fail_join {
            return Err(SwarmcastError::DiscoveryFailed("bootstrap unreachable".into()));
        }
        if script.topic.is_some() {
            return Err(SwarmcastError::DiscoveryFailed("already registered".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        script.incoming = Some(tx);
        script.topic = Some(topic);
        Ok(Registration {
            discovery: Box::new(ScriptedDiscovery {
                topic,
                fail_flush: script.fail_flush,
            }),
            incoming: rx,
        })
    }

    async fn leave(&self, topic: TopicId) -> SwarmcastResult<()> {
        self.probe.leaves.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.topic == Some(topic) {
            script.topic = None;
            script.incoming = None;
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.probe.destroyed.store(true, Ordering::SeqCst);
        let mut script = self.script.lock();
        script.topic = None;
        script.incoming = None;
    }
}
