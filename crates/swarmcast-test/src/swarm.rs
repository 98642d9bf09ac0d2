//! Multi-relay swarms over the in-process network
//!
//! Every node is a full relay with its own capture and codec; nodes find
//! each other through a shared [`MemoryNetwork`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use swarmcast_codec::DecodedFrame;
use swarmcast_core::{ConnectionId, MediaKind, RelayConfig, SwarmcastResult};
use swarmcast_runtime::SwarmRelay;
use swarmcast_transport::MemoryNetwork;

use crate::{CaptureProbe, CodecLog, LoopbackCodec, SyntheticCapture, SyntheticCaptureConfig};

pub struct SwarmNode {
    pub relay: SwarmRelay,
    pub codec: Arc<LoopbackCodec>,
    pub capture: Arc<CaptureProbe>,
    rendered: mpsc::UnboundedReceiver<DecodedFrame>,
}

impl SwarmNode {
    pub fn new(network: &MemoryNetwork, config: RelayConfig) -> SwarmcastResult<Self> {
        let codec = Arc::new(LoopbackCodec::new());
        let capture = SyntheticCapture::new(SyntheticCaptureConfig::default());
        let probe = capture.probe();

        let relay = SwarmRelay::new(
            config,
            Arc::new(network.endpoint()),
            Arc::new(capture),
            Arc::clone(&codec) as _,
        )?;
        let rendered = relay.render_frames().ok_or_else(|| {
            swarmcast_core::SwarmcastError::InvalidConfig("render output already taken".into())
        })?;

        Ok(Self {
            relay,
            codec,
            capture: probe,
            rendered,
        })
    }

    pub fn codec_log(&self) -> Arc<Mutex<CodecLog>> {
        self.codec.log()
    }

    /// Decoded video frames received since the last call, by connection
    pub fn drain_rendered(&mut self) -> Vec<(ConnectionId, u64)> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rendered.try_recv() {
            if frame.kind == MediaKind::Video {
                let sequence = crate::frame_sequence(&frame.data).unwrap_or_default();
                frames.push((frame.connection, sequence));
            }
        }
        frames
    }
}

/// Build `n` nodes on one network
pub fn swarm(n: usize, config: &RelayConfig) -> SwarmcastResult<(MemoryNetwork, Vec<SwarmNode>)> {
    let network = MemoryNetwork::new();
    let nodes = (0..n)
        .map(|_| SwarmNode::new(&network, config.clone()))
        .collect::<SwarmcastResult<Vec<_>>>()?;
    Ok((network, nodes))
}
