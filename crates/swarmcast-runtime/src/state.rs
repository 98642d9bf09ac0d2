//! Relay state
//!
//! Everything the relay's tasks share lives in [`RelayState`], guarded by a
//! single lock in the orchestrator. Methods here are synchronous and never
//! touch a transport: they decide, the orchestrator performs the I/O
//! outside the lock.

use std::collections::HashMap;
use std::fmt;

use tokio::task::AbortHandle;
use tracing::{debug, trace};

use swarmcast_codec::{EncoderAdapter, FrameSlot, RawFrame, TrackSettings};
use swarmcast_core::{ConnectionId, MediaKind, SwarmcastError, SwarmcastResult, TopicId};

use crate::{ConnectionSession, IncomingAction, OutboundQueue, SessionState};

/// Where the relay is in its join / leave lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayPhase {
    Idle,
    Joining,
    Streaming,
    Leaving,
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayPhase::Idle => "idle",
            RelayPhase::Joining => "joining",
            RelayPhase::Streaming => "streaming",
            RelayPhase::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Relay counters for the current join
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_captured: u64,
    pub audio_frames_captured: u64,
    pub forced_keyframes: u64,
    pub encode_failures: u64,
    pub chunks_broadcast: u64,
    pub chunks_skipped: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    /// Peers dropped because their outbound queue filled up
    pub queue_overflows: u64,
    pub chunks_received: u64,
    pub malformed_frames: u64,
    pub decode_failures: u64,
    pub dropped_awaiting_keyframe: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

/// Shared relay state
pub struct RelayState {
    phase: RelayPhase,
    topic: Option<TopicId>,
    connections: HashMap<ConnectionId, ConnectionSession>,
    /// At least one connection exists and the capture should be encoded
    encoding_active: bool,
    /// The next encode must produce a keyframe
    keyframe_required: bool,
    capture_running: bool,
    last_frame: FrameSlot,
    video_encoder: Option<EncoderAdapter>,
    audio_encoder: Option<EncoderAdapter>,
    video_track: Option<TrackSettings>,
    audio_track: Option<TrackSettings>,
    stats: RelayStats,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            phase: RelayPhase::Idle,
            topic: None,
            connections: HashMap::new(),
            encoding_active: false,
            keyframe_required: true,
            capture_running: false,
            last_frame: FrameSlot::new(),
            video_encoder: None,
            audio_encoder: None,
            video_track: None,
            audio_track: None,
            stats: RelayStats::default(),
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn topic(&self) -> Option<TopicId> {
        self.topic
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn is_encoding_active(&self) -> bool {
        self.encoding_active
    }

    pub fn keyframe_required(&self) -> bool {
        self.keyframe_required
    }

    pub fn is_capture_running(&self) -> bool {
        self.capture_running
    }

    pub fn has_last_frame(&self) -> bool {
        self.last_frame.is_occupied()
    }

    pub fn video_track(&self) -> Option<&TrackSettings> {
        self.video_track.as_ref()
    }

    pub fn audio_track(&self) -> Option<&TrackSettings> {
        self.audio_track.as_ref()
    }

    // ---- lifecycle ----

    /// Idle -> Joining
    pub fn begin_join(&mut self, topic: TopicId) -> SwarmcastResult<()> {
        if self.phase != RelayPhase::Idle {
            return Err(SwarmcastError::AlreadyJoined);
        }
        self.phase = RelayPhase::Joining;
        self.topic = Some(topic);
        Ok(())
    }

    /// Install the encoders built for the opened capture tracks
    pub fn install_encoders(
        &mut self,
        video: EncoderAdapter,
        video_track: TrackSettings,
        audio: Option<(EncoderAdapter, TrackSettings)>,
    ) {
        self.video_encoder = Some(video);
        self.video_track = Some(video_track);
        if let Some((encoder, track)) = audio {
            self.audio_encoder = Some(encoder);
            self.audio_track = Some(track);
        }
    }

    /// Joining -> Streaming
    pub fn mark_streaming(&mut self) -> bool {
        if self.phase != RelayPhase::Joining {
            return false;
        }
        self.phase = RelayPhase::Streaming;
        true
    }

    /// Streaming -> Leaving. Stops encoding and moves every open session to
    /// Closing; returns the queues still worth a disconnect frame.
    pub fn begin_leave(&mut self) -> Vec<OutboundQueue> {
        self.phase = RelayPhase::Leaving;
        self.encoding_active = false;

        let mut targets: Vec<OutboundQueue> = self
            .connections
            .values_mut()
            .filter(|s| s.state().is_open())
            .filter_map(|s| {
                s.begin_closing();
                s.outbound().cloned()
            })
            .collect();
        targets.sort_by_key(OutboundQueue::id);
        targets
    }

    /// Release everything held for the join and return to Idle
    pub fn reset(&mut self) {
        self.last_frame.clear();
        if let Some(mut encoder) = self.video_encoder.take() {
            encoder.close();
        }
        if let Some(mut encoder) = self.audio_encoder.take() {
            encoder.close();
        }
        for (_, mut session) in self.connections.drain() {
            session.close();
        }
        *self = RelayState::new();
    }

    // ---- connection set ----

    /// Add an activated session. Returns true when the caller must start
    /// the capture loop.
    pub fn insert_connection(&mut self, session: ConnectionSession) -> bool {
        let id = session.id();
        self.connections.insert(id, session);
        self.stats.connections_opened += 1;
        self.encoding_active = true;
        self.keyframe_required = true;

        debug!(connection = %id, peers = self.connections.len(), "connection added");

        if self.capture_running {
            false
        } else {
            self.capture_running = true;
            true
        }
    }

    /// Remove and close a session. `None` if it was already gone.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<ConnectionSession> {
        let mut session = self.connections.remove(&id)?;
        session.close();
        self.stats.connections_closed += 1;
        self.encoding_active = !self.connections.is_empty() && self.phase == RelayPhase::Streaming;
        Some(session)
    }

    pub fn peer_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn session_state(&self, id: ConnectionId) -> Option<SessionState> {
        self.connections.get(&id).map(ConnectionSession::state)
    }

    pub fn needs_keyframe(&self, id: ConnectionId) -> Option<bool> {
        self.connections.get(&id).map(ConnectionSession::needs_keyframe)
    }

    /// Remember the tasks serving a session. Returns false if the session
    /// is already gone.
    pub fn attach_tasks(&mut self, id: ConnectionId, tasks: &[AbortHandle]) -> bool {
        match self.connections.get_mut(&id) {
            Some(session) => {
                for task in tasks {
                    session.attach_task(task.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Queues of the active sessions, in connection order
    pub fn write_targets(&self) -> Vec<OutboundQueue> {
        let mut targets: Vec<OutboundQueue> = self
            .connections
            .values()
            .filter(|s| s.is_active())
            .filter_map(|s| s.outbound().cloned())
            .collect();
        targets.sort_by_key(OutboundQueue::id);
        targets
    }

    /// Stop writing media to a peer that cannot keep up. Returns false if
    /// it was already closing or gone.
    pub fn mark_lagging(&mut self, id: ConnectionId) -> bool {
        let began = match self.connections.get_mut(&id) {
            Some(session) => session.begin_closing(),
            None => false,
        };
        if began {
            self.stats.queue_overflows += 1;
        }
        began
    }

    /// Route an inbound block to its session. `None` if the session is gone.
    pub fn handle_incoming(
        &mut self,
        id: ConnectionId,
        data: bytes::Bytes,
        now_us: u64,
    ) -> Option<IncomingAction> {
        let session = self.connections.get_mut(&id)?;
        let action = session.handle_incoming(data, now_us);

        self.stats.chunks_received += 1;
        match action {
            IncomingAction::Malformed => self.stats.malformed_frames += 1,
            IncomingAction::DecodeFailed(_) => self.stats.decode_failures += 1,
            IncomingAction::AwaitingKeyframe => self.stats.dropped_awaiting_keyframe += 1,
            _ => {}
        }
        Some(action)
    }

    // ---- capture / encode ----

    /// Whether a capture loop should keep going. Clears the running flag
    /// when it should not, so the next connection restarts the loop.
    pub fn continue_capture(&mut self) -> bool {
        if self.encoding_active && self.phase == RelayPhase::Streaming {
            true
        } else {
            self.capture_running = false;
            false
        }
    }

    pub fn capture_stopped(&mut self) {
        self.capture_running = false;
    }

    /// Store a captured video frame as the last frame and encode it.
    ///
    /// The previous frame is released before the new one is stored. The
    /// keyframe flag is honoured and cleared on success; an encode failure
    /// sets it again so the stream resynchronizes on the next frame.
    pub fn capture_video(&mut self, frame: RawFrame) -> SwarmcastResult<()> {
        let Some(encoder) = self.video_encoder.as_mut() else {
            return Err(SwarmcastError::CodecNotConfigured(MediaKind::Video));
        };

        let force = self.keyframe_required;
        let frame = self.last_frame.replace(frame);
        self.stats.frames_captured += 1;

        match encoder.encode(frame, force) {
            Ok(()) => {
                if force {
                    trace!("keyframe encoded on demand");
                }
                self.keyframe_required = false;
                Ok(())
            }
            Err(e) => {
                self.stats.encode_failures += 1;
                if e.needs_resync() {
                    self.keyframe_required = true;
                }
                Err(e)
            }
        }
    }

    /// Encode a captured audio frame and release it straight away
    pub fn capture_audio(&mut self, frame: RawFrame) -> SwarmcastResult<()> {
        let Some(encoder) = self.audio_encoder.as_mut() else {
            return Err(SwarmcastError::CodecNotConfigured(MediaKind::Audio));
        };
        self.stats.audio_frames_captured += 1;
        let result = encoder.encode_and_release(frame, false);
        if result.is_err() {
            self.stats.encode_failures += 1;
        }
        result
    }

    /// Re-encode the last frame as a keyframe. `Ok(false)` when encoding is
    /// inactive or nothing has been captured yet.
    pub fn force_keyframe(&mut self) -> SwarmcastResult<bool> {
        if !self.encoding_active {
            return Ok(false);
        }
        let (Some(frame), Some(encoder)) = (self.last_frame.get(), self.video_encoder.as_mut())
        else {
            return Ok(false);
        };

        match encoder.encode(frame, true) {
            Ok(()) => {
                self.stats.forced_keyframes += 1;
                Ok(true)
            }
            Err(e) => {
                self.stats.encode_failures += 1;
                Err(e)
            }
        }
    }

    // ---- broadcast bookkeeping ----

    pub fn record_dispatch(&mut self) {
        self.stats.chunks_broadcast += 1;
    }

    pub fn record_write(&mut self, bytes: usize, ok: bool) {
        if ok {
            self.stats.bytes_written += bytes as u64;
        } else {
            self.stats.write_failures += 1;
        }
    }

    pub fn record_skipped(&mut self) {
        self.stats.chunks_skipped += 1;
    }
}

impl fmt::Debug for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayState")
            .field("phase", &self.phase)
            .field("topic", &self.topic.map(|t| t.short()))
            .field("peers", &self.connections.len())
            .field("encoding_active", &self.encoding_active)
            .field("keyframe_required", &self.keyframe_required)
            .field("capture_running", &self.capture_running)
            .finish()
    }
}
