//! Connection sessions
//!
//! A session is the relay's view of one peer connection: the transport,
//! the decoders fed from it and the keyframe gate protecting them.
//!
//! ```text
//! Connecting --activate--> Active --begin_closing--> Closing --close--> Closed
//!      \                      \_________________________close________/
//!       \______________________________close__________________/
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use swarmcast_codec::{DecodeOutcome, DecoderAdapter};
use swarmcast_core::{ConnectionId, MediaChunk, MediaKind, SwarmcastError};
use swarmcast_transport::{PeerInfo, PeerTransport};

use crate::OutboundQueue;

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport established, decoders not yet attached
    Connecting,
    /// Exchanging media
    Active,
    /// Disconnect sent or received, waiting for the transport to end
    Closing,
    /// Removed from the relay, decoders released
    Closed,
}

impl SessionState {
    /// Still holds a usable transport
    pub fn is_open(self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

/// Why a connection left the relay
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport reported a close
    RemoteClosed,
    /// The remote sent a disconnect frame
    RemoteDisconnect,
    /// The transport reported an error
    TransportError(String),
    /// A broadcast write failed or timed out
    WriteFailed(String),
    /// We left the topic
    LocalLeave,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => write!(f, "remote closed"),
            CloseReason::RemoteDisconnect => write!(f, "remote disconnect"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::LocalLeave => write!(f, "local leave"),
        }
    }
}

/// What the session did with one inbound block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncomingAction {
    /// Handed to the decoder
    Decoded { kind: MediaKind, keyframe: bool },
    /// Delta dropped while the keyframe gate is closed
    AwaitingKeyframe,
    /// Decoder rejected the chunk; the gate is closed again
    DecodeFailed(MediaKind),
    /// Not a valid frame; logged and skipped
    Malformed,
    /// No decoder for this media, or the session is not active
    Ignored,
    /// The remote is leaving
    Disconnect,
}

/// Per-session counters
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub frames_in: u64,
    pub bytes_in: u64,
    pub malformed: u64,
    pub decode_failures: u64,
    pub dropped_awaiting_keyframe: u64,
    pub ignored: u64,
}

/// One peer connection
pub struct ConnectionSession {
    id: ConnectionId,
    info: PeerInfo,
    state: SessionState,
    transport: Arc<dyn PeerTransport>,
    video: Option<DecoderAdapter>,
    audio: Option<DecoderAdapter>,
    outbound: Option<OutboundQueue>,
    /// Reader and writer tasks
    tasks: Vec<AbortHandle>,
    stats: SessionStats,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, transport: Arc<dyn PeerTransport>, info: PeerInfo) -> Self {
        Self {
            id,
            info,
            state: SessionState::Connecting,
            transport,
            video: None,
            audio: None,
            outbound: None,
            tasks: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    /// Attach the decoders and start accepting media.
    ///
    /// The video gate is (re)closed here so the first video chunk decoded
    /// on this connection is always a keyframe.
    pub fn activate(&mut self, mut video: DecoderAdapter, audio: Option<DecoderAdapter>) {
        if self.state != SessionState::Connecting {
            debug!(connection = %self.id, state = ?self.state, "activate ignored");
            return;
        }
        video.request_keyframe();
        self.video = Some(video);
        self.audio = audio;
        self.state = SessionState::Active;
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    /// True until a video keyframe has decoded on this connection, and again
    /// after any video decode failure
    pub fn needs_keyframe(&self) -> bool {
        self.video.as_ref().map_or(true, DecoderAdapter::needs_keyframe)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn set_outbound(&mut self, queue: OutboundQueue) {
        self.outbound = Some(queue);
    }

    /// Queue for frames to this peer, if a writer was attached
    pub fn outbound(&self) -> Option<&OutboundQueue> {
        self.outbound.as_ref()
    }

    pub(crate) fn attach_task(&mut self, handle: AbortHandle) {
        self.tasks.push(handle);
    }

    pub(crate) fn take_tasks(&mut self) -> Vec<AbortHandle> {
        std::mem::take(&mut self.tasks)
    }

    /// Route one inbound block
    pub fn handle_incoming(&mut self, data: Bytes, now_us: u64) -> IncomingAction {
        self.stats.frames_in += 1;
        self.stats.bytes_in += data.len() as u64;

        let chunk = match swarmcast_wire::decode_bytes(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(connection = %self.id, error = %e, "dropping malformed frame");
                return IncomingAction::Malformed;
            }
        };

        if chunk.is_disconnect() {
            debug!(connection = %self.id, "remote sent disconnect");
            self.begin_closing();
            return IncomingAction::Disconnect;
        }

        if self.state != SessionState::Active {
            self.stats.ignored += 1;
            return IncomingAction::Ignored;
        }

        self.decode(chunk.with_timestamp(now_us))
    }

    fn decode(&mut self, chunk: MediaChunk) -> IncomingAction {
        let Some(kind) = chunk.media_kind() else {
            return IncomingAction::Ignored;
        };
        let decoder = match kind {
            MediaKind::Video => self.video.as_mut(),
            MediaKind::Audio => self.audio.as_mut(),
        };
        let Some(decoder) = decoder else {
            self.stats.ignored += 1;
            trace!(connection = %self.id, %kind, "no decoder, chunk ignored");
            return IncomingAction::Ignored;
        };

        match decoder.decode(&chunk) {
            Ok(DecodeOutcome::Submitted { keyframe }) => IncomingAction::Decoded { kind, keyframe },
            Ok(DecodeOutcome::AwaitingKeyframe) => {
                self.stats.dropped_awaiting_keyframe += 1;
                trace!(connection = %self.id, "delta dropped, awaiting keyframe");
                IncomingAction::AwaitingKeyframe
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                match e {
                    SwarmcastError::CodecNotConfigured(_) => {
                        warn!(connection = %self.id, %kind, "decoder not configured")
                    }
                    other => {
                        debug!(connection = %self.id, %kind, error = %other, "decode failed, awaiting keyframe")
                    }
                }
                IncomingAction::DecodeFailed(kind)
            }
        }
    }

    /// Stop accepting media. Returns false if already closing or closed.
    pub fn begin_closing(&mut self) -> bool {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Release the decoders. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        if let Some(mut video) = self.video.take() {
            video.close();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
        self.state = SessionState::Closed;
        true
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("state", &self.state)
            .field("needs_keyframe", &self.needs_keyframe())
            .finish()
    }
}
