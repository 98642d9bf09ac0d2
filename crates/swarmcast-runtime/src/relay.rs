//! Swarm relay - orchestration of capture, encode, fan-out and decode

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use swarmcast_codec::{
    acquire_source, CaptureDevice, CodecConfig, CodecFactory, DecodedFrame, DecoderAdapter,
    EncoderAdapter, FrameReader, RenderSink,
};
use swarmcast_core::{
    ConnectionId, ConnectionIdAllocator, MediaChunk, MediaKind, RelayConfig, SwarmcastError,
    SwarmcastResult, TopicId,
};
use swarmcast_transport::{
    Discovery, IncomingPeer, JoinMode, Overlay, PeerTransport, TransportEvent, TransportEvents,
};

use crate::{
    CloseReason, ConnectionSession, Delivery, IncomingAction, Outbound, OutboundQueue, QueueError,
    RelayEvent, RelayPhase, RelayState, RelayStats,
};

/// Longest a leave waits for disconnect frames to be written
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Size of the wire frame written to each connection
    pub bytes: usize,
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, SwarmcastError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

type ReaderSlot = Arc<AsyncMutex<Option<Box<dyn FrameReader>>>>;

/// Background work owned by one join
#[derive(Default)]
struct RelayTasks {
    pump: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
    keyframe: Option<JoinHandle<()>>,
    capture: Vec<JoinHandle<()>>,
    discovery: Option<Box<dyn Discovery>>,
}

struct RelayInner {
    config: RelayConfig,
    overlay: Arc<dyn Overlay>,
    capture: Arc<dyn CaptureDevice>,
    codecs: Arc<dyn CodecFactory>,
    /// Lives across joins so ids are never reused
    ids: ConnectionIdAllocator,
    state: Mutex<RelayState>,
    tasks: Mutex<RelayTasks>,
    video_reader: ReaderSlot,
    audio_reader: ReaderSlot,
    events: broadcast::Sender<RelayEvent>,
    render_tx: RenderSink,
    render_rx: Mutex<Option<mpsc::UnboundedReceiver<DecodedFrame>>>,
    /// Serializes join and leave
    lifecycle: AsyncMutex<()>,
    clock: Instant,
}

/// A peer in the swarm: streams its own capture to every connection and
/// decodes every connection's stream for rendering.
///
/// Cloning yields another handle to the same relay.
#[derive(Clone)]
pub struct SwarmRelay {
    inner: Arc<RelayInner>,
}

impl SwarmRelay {
    pub fn new(
        config: RelayConfig,
        overlay: Arc<dyn Overlay>,
        capture: Arc<dyn CaptureDevice>,
        codecs: Arc<dyn CodecFactory>,
    ) -> SwarmcastResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (render_tx, render_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(RelayInner {
                config,
                overlay,
                capture,
                codecs,
                ids: ConnectionIdAllocator::new(),
                state: Mutex::new(RelayState::new()),
                tasks: Mutex::new(RelayTasks::default()),
                video_reader: Arc::new(AsyncMutex::new(None)),
                audio_reader: Arc::new(AsyncMutex::new(None)),
                events,
                render_tx,
                render_rx: Mutex::new(Some(render_rx)),
                lifecycle: AsyncMutex::new(()),
                clock: Instant::now(),
            }),
        })
    }

    /// Acquire the capture source, configure the encoders and join the
    /// topic. Fails with `AlreadyJoined` unless the relay is idle; on any
    /// other failure everything acquired so far is released again.
    pub async fn join(&self, topic: &str) -> SwarmcastResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let topic_id = TopicId::derive(topic);

        self.inner.state.lock().begin_join(topic_id)?;
        self.inner.emit(RelayEvent::PhaseChanged(RelayPhase::Joining));
        info!(topic = %topic_id.short(), "joining topic");

        match self.inner.start(topic_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(topic = %topic_id.short(), error = %e, "join failed");
                self.inner.abort_join(topic_id).await;
                Err(e)
            }
        }
    }

    /// Stop streaming, say goodbye to every connection and leave the
    /// topic. A no-op when not joined.
    pub async fn leave(&self) -> SwarmcastResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop().await
    }

    /// Leave, then tear the overlay down
    pub async fn shutdown(&self) -> SwarmcastResult<()> {
        let left = self.leave().await;
        self.inner.overlay.destroy().await;
        info!("relay shut down");
        left
    }

    /// Admit a connection handed over by the overlay. Returns its id, or
    /// `None` if the relay is not streaming.
    pub async fn on_connection(&self, peer: IncomingPeer) -> Option<ConnectionId> {
        self.inner.on_connection(peer).await
    }

    /// Write one chunk to every active connection and wait for every write.
    ///
    /// Writes go through each connection's queue, behind whatever media is
    /// already queued for it.
    pub async fn broadcast(&self, chunk: &MediaChunk) -> BroadcastReport {
        self.inner.broadcast(chunk).await
    }

    /// Remove a connection. Returns false if it was already gone.
    pub async fn close_connection(&self, id: ConnectionId, reason: CloseReason) -> bool {
        self.inner.close_connection(id, reason).await
    }

    pub fn phase(&self) -> RelayPhase {
        self.inner.state.lock().phase()
    }

    pub fn topic(&self) -> Option<TopicId> {
        self.inner.state.lock().topic()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.state.lock().peer_count()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.state.lock().connection_ids()
    }

    /// Whether a connection is still waiting for a video keyframe
    pub fn needs_keyframe(&self, id: ConnectionId) -> Option<bool> {
        self.inner.state.lock().needs_keyframe(id)
    }

    pub fn is_encoding_active(&self) -> bool {
        self.inner.state.lock().is_encoding_active()
    }

    pub fn stats(&self) -> RelayStats {
        self.inner.state.lock().stats().clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Lifecycle and connection notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Decoded frames from every connection. Can be taken once.
    pub fn render_frames(&self) -> Option<mpsc::UnboundedReceiver<DecodedFrame>> {
        self.inner.render_rx.lock().take()
    }
}

impl RelayInner {
    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn now_us(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }

    // ---- join / leave ----

    async fn start(self: &Arc<Self>, topic: TopicId) -> SwarmcastResult<()> {
        let source = acquire_source(self.capture.as_ref(), &self.config.capture_retry).await?;

        let video_reader = self.capture.open(&source, MediaKind::Video).await?;
        let video_track = video_reader.settings();
        *self.video_reader.lock().await = Some(video_reader);

        let audio_track = if self.config.enable_audio {
            let reader = self.capture.open(&source, MediaKind::Audio).await?;
            let track = reader.settings();
            *self.audio_reader.lock().await = Some(reader);
            Some(track)
        } else {
            None
        };

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let mut video = EncoderAdapter::new(
            MediaKind::Video,
            self.codecs.encoder(MediaKind::Video, chunk_tx.clone()),
        );
        video.configure(&CodecConfig::video(&self.config.video, &video_track))?;

        let audio = match audio_track {
            Some(track) => {
                let mut encoder = EncoderAdapter::new(
                    MediaKind::Audio,
                    self.codecs.encoder(MediaKind::Audio, chunk_tx.clone()),
                );
                encoder.configure(&CodecConfig::audio(&self.config.audio, &track))?;
                Some((encoder, track))
            }
            None => None,
        };
        drop(chunk_tx);

        debug!(
            width = video_track.width,
            height = video_track.height,
            audio = audio.is_some(),
            "encoders configured"
        );
        self.state.lock().install_encoders(video, video_track, audio);

        let pump = tokio::spawn(Arc::clone(self).pump_chunks(chunk_rx));
        self.tasks.lock().pump = Some(pump);

        let registration = self.overlay.join(topic, JoinMode::both()).await?;
        let flushed = registration.discovery.flushed().await;
        self.tasks.lock().discovery = Some(registration.discovery);
        flushed?;
        debug!(topic = %topic.short(), "announced on topic");

        if self.state.lock().mark_streaming() {
            self.emit(RelayEvent::PhaseChanged(RelayPhase::Streaming));
        }

        let accept = tokio::spawn(Arc::clone(self).accept_loop(registration.incoming));
        let keyframe = tokio::spawn(Arc::clone(self).keyframe_loop());
        {
            let mut tasks = self.tasks.lock();
            tasks.accept = Some(accept);
            tasks.keyframe = Some(keyframe);
        }

        info!(topic = %topic.short(), "streaming");
        Ok(())
    }

    async fn abort_join(self: &Arc<Self>, topic: TopicId) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let registered = tasks.discovery.is_some();

        stop_task(tasks.keyframe).await;
        for handle in tasks.capture {
            stop_task(Some(handle)).await;
        }
        stop_task(tasks.accept).await;
        stop_task(tasks.pump).await;

        if registered {
            if let Err(e) = self.overlay.leave(topic).await {
                warn!(topic = %topic.short(), error = %e, "overlay leave failed");
            }
        }

        self.close_readers().await;
        self.state.lock().reset();
        self.emit(RelayEvent::PhaseChanged(RelayPhase::Idle));
    }

    async fn stop(self: &Arc<Self>) -> SwarmcastResult<()> {
        let (topic, targets) = {
            let mut state = self.state.lock();
            if state.phase() == RelayPhase::Idle {
                return Ok(());
            }
            (state.topic(), state.begin_leave())
        };
        self.emit(RelayEvent::PhaseChanged(RelayPhase::Leaving));
        info!(peers = targets.len(), "leaving topic");

        let RelayTasks {
            pump,
            accept,
            keyframe,
            capture,
            discovery,
        } = std::mem::take(&mut *self.tasks.lock());

        // Nothing new gets encoded or queued from here on
        stop_task(keyframe).await;
        for handle in capture {
            stop_task(Some(handle)).await;
        }
        stop_task(pump).await;

        if !targets.is_empty() {
            self.send_disconnect(targets).await;
        }

        let ids = self.state.lock().connection_ids();
        for id in ids {
            self.close_connection(id, CloseReason::LocalLeave).await;
        }
        stop_task(accept).await;

        let left = match topic {
            Some(topic) => self.overlay.leave(topic).await,
            None => Ok(()),
        };
        drop(discovery);
        if let Err(e) = &left {
            warn!(error = %e, "overlay leave failed");
        }

        self.close_readers().await;
        self.state.lock().reset();
        self.emit(RelayEvent::PhaseChanged(RelayPhase::Idle));
        info!("left topic");
        left
    }

    /// Queue the disconnect frame behind each peer's pending media and give
    /// the writers a bounded time to flush it
    async fn send_disconnect(&self, targets: Vec<OutboundQueue>) {
        let frame = swarmcast_wire::disconnect_frame();
        let pending: Vec<Delivery> = targets
            .iter()
            .filter_map(|queue| queue.push_acked(frame.clone()).ok())
            .collect();
        let queued = pending.len();

        let grace = self
            .config
            .write_timeout()
            .map_or(DISCONNECT_GRACE, |limit| limit.min(DISCONNECT_GRACE));
        match tokio::time::timeout(grace, gather(pending)).await {
            Ok(report) => debug!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "disconnect sent"
            ),
            Err(_) => debug!(queued, "disconnect not flushed to every peer in time"),
        }
    }

    async fn close_readers(&self) {
        for slot in [&self.video_reader, &self.audio_reader] {
            let reader = slot.lock().await.take();
            if let Some(mut reader) = reader {
                reader.close().await;
            }
        }
    }

    // ---- connections ----

    async fn accept_loop(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingPeer>) {
        while let Some(peer) = incoming.recv().await {
            self.on_connection(peer).await;
        }
        debug!("overlay stopped delivering connections");
    }

    async fn on_connection(self: &Arc<Self>, peer: IncomingPeer) -> Option<ConnectionId> {
        let IncomingPeer {
            transport,
            events,
            info,
        } = peer;
        let id = self.ids.next();

        let mut session = ConnectionSession::new(id, Arc::clone(&transport), info.clone());
        let (queue, outbound) = OutboundQueue::channel(id, self.config.outbound_capacity);
        session.set_outbound(queue);
        match self.build_decoders(id) {
            Ok((video, audio)) => session.activate(video, audio),
            Err(e) => {
                warn!(connection = %id, error = %e, "decoder setup failed, dropping connection");
                drop(session);
                transport.end().await;
                return None;
            }
        }

        let admitted = {
            let mut state = self.state.lock();
            if state.phase() == RelayPhase::Streaming {
                let start_capture = state.insert_connection(session);
                Ok((start_capture, state.peer_count()))
            } else {
                Err(state.phase())
            }
        };
        let (start_capture, peers) = match admitted {
            Ok(admitted) => admitted,
            Err(phase) => {
                debug!(connection = %id, %phase, "not streaming, refusing connection");
                transport.end().await;
                return None;
            }
        };

        info!(connection = %id, peer = ?info, peers, "connection established");
        self.emit(RelayEvent::ConnectionCreated { id, info });
        self.emit(RelayEvent::PeerCountChanged(peers));

        let writer = tokio::spawn(Arc::clone(self).write_loop(id, transport, outbound));
        let reader = tokio::spawn(Arc::clone(self).read_loop(id, events));
        let tasks = [writer.abort_handle(), reader.abort_handle()];
        if !self.state.lock().attach_tasks(id, &tasks) {
            trace!(connection = %id, "connection closed before its tasks attached");
            for task in tasks {
                task.abort();
            }
        }

        if start_capture {
            self.spawn_capture();
        }
        Some(id)
    }

    fn build_decoders(
        &self,
        id: ConnectionId,
    ) -> SwarmcastResult<(DecoderAdapter, Option<DecoderAdapter>)> {
        let (video_track, audio_track) = {
            let state = self.state.lock();
            (
                state.video_track().cloned().unwrap_or_default(),
                state.audio_track().cloned().unwrap_or_default(),
            )
        };

        let mut video = DecoderAdapter::new(
            MediaKind::Video,
            self.codecs
                .decoder(MediaKind::Video, id, self.render_tx.clone()),
        );
        video.configure(&CodecConfig::video(&self.config.video, &video_track))?;

        let audio = if self.config.enable_audio {
            let mut audio = DecoderAdapter::new(
                MediaKind::Audio,
                self.codecs
                    .decoder(MediaKind::Audio, id, self.render_tx.clone()),
            );
            audio.configure(&CodecConfig::audio(&self.config.audio, &audio_track))?;
            Some(audio)
        } else {
            None
        };

        Ok((video, audio))
    }

    async fn read_loop(self: Arc<Self>, id: ConnectionId, mut events: TransportEvents) {
        let reason = loop {
            let Some(event) = events.recv().await else {
                break CloseReason::RemoteClosed;
            };
            match event {
                TransportEvent::Data(data) => {
                    let now = self.now_us();
                    let action = self.state.lock().handle_incoming(id, data, now);
                    match action {
                        // Already removed elsewhere
                        None => return,
                        Some(IncomingAction::Disconnect) => break CloseReason::RemoteDisconnect,
                        Some(_) => {}
                    }
                }
                TransportEvent::Closed => break CloseReason::RemoteClosed,
                TransportEvent::Error(e) => break CloseReason::TransportError(e),
            }
        };
        self.close_connection(id, reason).await;
    }

    async fn close_connection(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state
                .remove_connection(id)
                .map(|session| (session, state.peer_count()))
        };
        let Some((mut session, peers)) = removed else {
            trace!(connection = %id, %reason, "connection already removed");
            return false;
        };
        let transport = session.transport();
        let tasks = session.take_tasks();
        drop(session);

        info!(connection = %id, %reason, peers, "connection closed");
        self.emit(RelayEvent::ConnectionRemoved { id, reason });
        self.emit(RelayEvent::PeerCountChanged(peers));

        transport.end().await;
        for task in tasks {
            task.abort();
        }
        true
    }

    /// Drain one connection's queue in order. The first failed write
    /// closes the connection.
    async fn write_loop(
        self: Arc<Self>,
        id: ConnectionId,
        transport: Arc<dyn PeerTransport>,
        mut queue: mpsc::Receiver<Outbound>,
    ) {
        let timeout = self.config.write_timeout();
        while let Some(Outbound { frame, ack }) = queue.recv().await {
            let bytes = frame.len();
            let result = write_with_timeout(id, Arc::clone(&transport), frame, timeout).await;
            self.state.lock().record_write(bytes, result.is_ok());

            let failure = result.as_ref().err().map(ToString::to_string);
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
            if let Some(reason) = failure {
                warn!(connection = %id, %reason, "write failed");
                self.close_connection(id, CloseReason::WriteFailed(reason))
                    .await;
                return;
            }
        }
        trace!(connection = %id, "outbound queue closed");
    }

    /// A full queue means the peer cannot keep up: stop feeding it and
    /// close it without holding up the caller
    fn drop_lagging(self: &Arc<Self>, id: ConnectionId) {
        if !self.state.lock().mark_lagging(id) {
            return;
        }
        warn!(connection = %id, "outbound queue full, dropping slow peer");
        let reason = QueueError::Full.into_error(id).to_string();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .close_connection(id, CloseReason::WriteFailed(reason))
                .await;
        });
    }

    // ---- capture / encode ----

    fn spawn_capture(self: &Arc<Self>) {
        let mut handles = vec![tokio::spawn(
            Arc::clone(self).capture_loop(MediaKind::Video),
        )];
        if self.config.enable_audio {
            handles.push(tokio::spawn(Arc::clone(self).capture_loop(MediaKind::Audio)));
        }

        let mut tasks = self.tasks.lock();
        tasks.capture.retain(|h| !h.is_finished());
        tasks.capture.extend(handles);
    }

    async fn capture_loop(self: Arc<Self>, kind: MediaKind) {
        let slot = match kind {
            MediaKind::Video => Arc::clone(&self.video_reader),
            MediaKind::Audio => Arc::clone(&self.audio_reader),
        };
        let mut guard = slot.lock_owned().await;
        let Some(reader) = guard.as_mut() else {
            debug!(%kind, "no capture track open");
            if kind == MediaKind::Video {
                self.state.lock().capture_stopped();
            }
            return;
        };

        debug!(%kind, "capture loop started");
        loop {
            let keep_going = self.state.lock().continue_capture();
            if !keep_going {
                break;
            }

            let frame = match reader.read().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(%kind, "capture track ended");
                    self.state.lock().capture_stopped();
                    break;
                }
                Err(e) => {
                    warn!(%kind, error = %e, "capture read failed");
                    self.state.lock().capture_stopped();
                    break;
                }
            };

            let result = {
                let mut state = self.state.lock();
                if state.continue_capture() {
                    Some(match kind {
                        MediaKind::Video => state.capture_video(frame),
                        MediaKind::Audio => state.capture_audio(frame),
                    })
                } else {
                    frame.release();
                    None
                }
            };

            match result {
                None => break,
                Some(Ok(())) => {}
                Some(Err(SwarmcastError::CodecNotConfigured(k))) => {
                    warn!(kind = %k, "encoder not configured, stopping capture");
                    self.state.lock().capture_stopped();
                    break;
                }
                Some(Err(e)) => {
                    debug!(%kind, error = %e, "encode failed, next frame is a keyframe")
                }
            }
        }
        debug!(%kind, "capture loop stopped");
    }

    async fn keyframe_loop(self: Arc<Self>) {
        let period = self.config.keyframe_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let forced = self.state.lock().force_keyframe();
            match forced {
                Ok(true) => trace!("periodic keyframe"),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "periodic keyframe encode failed"),
            }
        }
    }

    // ---- fan-out ----

    async fn pump_chunks(self: Arc<Self>, mut chunks: mpsc::UnboundedReceiver<MediaChunk>) {
        while let Some(chunk) = chunks.recv().await {
            let active = self.state.lock().is_encoding_active();
            if !active {
                self.state.lock().record_skipped();
                continue;
            }
            let queued = self.dispatch(&chunk);
            trace!(
                kind = ?chunk.kind,
                keyframe = chunk.keyframe,
                queued,
                "chunk queued"
            );
        }
        debug!("encoder output closed");
    }

    /// Frame a chunk once and queue it for every active connection without
    /// waiting for any write
    fn dispatch(self: &Arc<Self>, chunk: &MediaChunk) -> usize {
        let frame = swarmcast_wire::encode(chunk);
        let targets = {
            let mut state = self.state.lock();
            state.record_dispatch();
            state.write_targets()
        };

        let mut queued = 0;
        for queue in targets {
            match queue.push(frame.clone()) {
                Ok(()) => queued += 1,
                Err(QueueError::Full) => self.drop_lagging(queue.id()),
                Err(QueueError::Closed) => {
                    trace!(connection = %queue.id(), "writer already stopped")
                }
            }
        }
        queued
    }

    async fn broadcast(self: &Arc<Self>, chunk: &MediaChunk) -> BroadcastReport {
        let frame = swarmcast_wire::encode(chunk);
        let targets = {
            let mut state = self.state.lock();
            state.record_dispatch();
            state.write_targets()
        };

        let mut pending = Vec::with_capacity(targets.len());
        let mut refused = Vec::new();
        for queue in targets {
            match queue.push_acked(frame.clone()) {
                Ok(delivery) => pending.push(delivery),
                Err(e) => {
                    if e == QueueError::Full {
                        self.drop_lagging(queue.id());
                    }
                    refused.push((queue.id(), e.into_error(queue.id())));
                }
            }
        }

        let mut report = gather(pending).await;
        report.bytes = frame.len();
        report.failed.extend(refused);
        report.failed.sort_by_key(|(id, _)| *id);
        report
    }
}

/// Wait for every queued write; a failure is recorded against its
/// connection only
async fn gather(pending: Vec<Delivery>) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for delivery in pending {
        match delivery.wait().await {
            (id, Ok(())) => report.delivered.push(id),
            (id, Err(e)) => report.failed.push((id, e)),
        }
    }
    report.delivered.sort();
    report.failed.sort_by_key(|(id, _)| *id);
    report
}

async fn stop_task(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
}

async fn write_with_timeout(
    id: ConnectionId,
    transport: Arc<dyn PeerTransport>,
    frame: Bytes,
    timeout: Option<Duration>,
) -> SwarmcastResult<()> {
    let write = transport.write(frame);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => return Err(SwarmcastError::WriteTimeout(id)),
        },
        None => write.await,
    };

    result.map_err(|e| match e {
        e @ SwarmcastError::TransportWriteFailure { .. } => e,
        other => SwarmcastError::TransportWriteFailure {
            connection: id,
            reason: other.to_string(),
        },
    })
}
