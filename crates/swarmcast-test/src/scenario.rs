//! Single-relay scenarios
//!
//! A [`Scenario`] wires one relay to a scripted overlay, a synthetic
//! capture and the loopback codec. Tests drive it with paused time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use swarmcast_core::{ConnectionId, RelayConfig, RetryPolicy, SwarmcastResult};
use swarmcast_runtime::{RelayEvent, SwarmRelay};

use crate::{
    test_peer, CaptureProbe, CodecLog, LoopbackCodec, PeerHandle, ScriptedOverlay,
    SyntheticCapture, SyntheticCaptureConfig, WriteBehavior,
};

/// Relay settings with short retries and a short write timeout
pub fn fast_config() -> RelayConfig {
    RelayConfig {
        keyframe_interval_ms: 1000,
        capture_retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        write_timeout_ms: Some(200),
        ..Default::default()
    }
}

/// Let every ready task run, then move the clock forward a little
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub struct Scenario {
    pub relay: SwarmRelay,
    pub overlay: Arc<ScriptedOverlay>,
    pub codec: Arc<LoopbackCodec>,
    pub capture: Arc<CaptureProbe>,
    events: broadcast::Receiver<RelayEvent>,
    next_key: u8,
}

impl Scenario {
    pub fn new(config: RelayConfig) -> SwarmcastResult<Self> {
        Self::with_capture(config, SyntheticCaptureConfig::default())
    }

    pub fn with_capture(
        config: RelayConfig,
        capture: SyntheticCaptureConfig,
    ) -> SwarmcastResult<Self> {
        let overlay = Arc::new(ScriptedOverlay::new());
        let codec = Arc::new(LoopbackCodec::new());
        let device = SyntheticCapture::new(capture);
        let probe = device.probe();

        let relay = SwarmRelay::new(
            config,
            Arc::clone(&overlay) as _,
            Arc::new(device),
            Arc::clone(&codec) as _,
        )?;
        let events = relay.subscribe();

        Ok(Self {
            relay,
            overlay,
            codec,
            capture: probe,
            events,
            next_key: 1,
        })
    }

    pub fn codec_log(&self) -> Arc<Mutex<CodecLog>> {
        self.codec.log()
    }

    /// Connect a new peer through the overlay and wait until the relay has
    /// admitted it. `None` if the relay is not registered or never admits it.
    pub async fn connect(&mut self, behavior: WriteBehavior) -> Option<(ConnectionId, PeerHandle)> {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);

        let (peer, handle) = test_peer(behavior, key);
        let info = handle.info().clone();
        if !self.overlay.connect(peer) {
            return None;
        }

        let id = self
            .wait_for(|event| match event {
                RelayEvent::ConnectionCreated { id, info: seen } if *seen == info => Some(*id),
                _ => None,
            })
            .await?;
        debug!(connection = %id, "test peer admitted");
        Some((id, handle))
    }

    /// Wait, in virtual time, for the first event `pick` accepts
    pub async fn wait_for<T>(
        &mut self,
        mut pick: impl FnMut(&RelayEvent) -> Option<T>,
    ) -> Option<T> {
        let events = &mut self.events;
        let search = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(&event) {
                            return Some(found);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), search)
            .await
            .ok()
            .flatten()
    }

    /// Events received and not yet consumed
    pub fn drain_events(&mut self) -> Vec<RelayEvent> {
        let mut seen = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => seen.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return seen,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use swarmcast_core::{MediaChunk, MediaKind, SwarmcastError};
    use swarmcast_runtime::{CloseReason, RelayPhase};

    use crate::frame_sequence;

    async fn streaming(config: RelayConfig) -> Scenario {
        let s = Scenario::new(config).unwrap();
        s.relay.join("room").await.unwrap();
        s
    }

    fn removed(events: &[RelayEvent], id: ConnectionId) -> Vec<CloseReason> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::ConnectionRemoved { id: seen, reason } if *seen == id => {
                    Some(reason.clone())
                }
                _ => None,
            })
            .collect()
    }

    // ---- join / leave ----

    #[tokio::test(start_paused = true)]
    async fn test_join_registers_and_streams() {
        let mut s = Scenario::new(fast_config()).unwrap();
        s.relay.join("room").await.unwrap();

        assert_eq!(s.relay.phase(), RelayPhase::Streaming);
        assert_eq!(s.overlay.probe().joins(), 1);
        assert_eq!(
            s.overlay.registered(),
            Some(swarmcast_core::TopicId::derive("room"))
        );
        assert_eq!(s.capture.opened(), 1);
        assert_eq!(
            s.capture.last_source.lock().as_deref(),
            Some("screen:0")
        );

        let events = s.drain_events();
        assert_eq!(
            events,
            vec![
                RelayEvent::PhaseChanged(RelayPhase::Joining),
                RelayEvent::PhaseChanged(RelayPhase::Streaming),
            ]
        );

        // Encoder sized from the capture track
        let log = s.codec_log();
        let log = log.lock();
        assert!(matches!(
            log.configured[0],
            swarmcast_codec::CodecConfig::Video {
                width: 1280,
                height: 720,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_twice_fails() {
        let s = streaming(fast_config()).await;
        let err = s.relay.join("other").await.unwrap_err();
        assert!(matches!(err, SwarmcastError::AlreadyJoined));
        assert_eq!(s.relay.phase(), RelayPhase::Streaming);
        assert_eq!(s.overlay.probe().joins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_capture_discovery() {
        let s = Scenario::with_capture(
            fast_config(),
            SyntheticCaptureConfig {
                warmup_polls: 7,
                ..Default::default()
            },
        )
        .unwrap();

        let err = s.relay.join("room").await.unwrap_err();
        assert!(matches!(
            err,
            SwarmcastError::DiscoverySourceUnavailable { attempts: 5 }
        ));
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
        assert_eq!(s.overlay.probe().joins(), 0);

        // Sources show up on the third poll of the next attempt
        s.relay.join("room").await.unwrap();
        assert_eq!(s.capture.polls.load(std::sync::atomic::Ordering::SeqCst), 8);
        assert_eq!(s.relay.phase(), RelayPhase::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_announce_rolls_back() {
        let s = Scenario::new(fast_config()).unwrap();
        s.overlay.fail_flush(true);

        let err = s.relay.join("room").await.unwrap_err();
        assert!(matches!(err, SwarmcastError::DiscoveryFailed(_)));
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
        assert_eq!(s.overlay.probe().leaves(), 1);
        assert_eq!(s.overlay.registered(), None);
        assert_eq!(s.capture.opened(), s.capture.closed());
        assert_eq!(s.codec_log().lock().encoders_closed, 1);

        s.overlay.fail_flush(false);
        s.relay.join("room").await.unwrap();
        assert_eq!(s.relay.phase(), RelayPhase::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_when_idle_is_noop() {
        let s = Scenario::new(fast_config()).unwrap();
        s.relay.leave().await.unwrap();
        assert_eq!(s.overlay.probe().leaves(), 0);
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_then_join_is_repeatable() {
        let mut s = streaming(fast_config()).await;
        let (first, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        s.relay.leave().await.unwrap();
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
        assert_eq!(s.relay.peer_count(), 0);
        assert!(peer.is_ended());

        // The goodbye is the last thing written
        let writes = peer.writes();
        let (_, last) = writes.last().unwrap();
        assert_eq!(&last[..], &swarmcast_wire::DISCONNECT_FRAME);

        assert_eq!(s.overlay.probe().leaves(), 1);
        assert_eq!(s.overlay.registered(), None);
        assert_eq!(s.capture.opened(), s.capture.closed());
        assert_eq!(s.capture.outstanding(), 0);
        {
            let log = s.codec_log();
            let log = log.lock();
            assert_eq!(log.encoders_closed, 1);
            assert_eq!(log.decoders_closed, 1);
        }

        // A second leave does nothing
        s.relay.leave().await.unwrap();
        assert_eq!(s.overlay.probe().leaves(), 1);

        s.relay.join("room").await.unwrap();
        let (second, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        assert!(second > first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.video_chunks()[0].keyframe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_emits_ordered_events() {
        let mut s = streaming(fast_config()).await;
        let (id, _peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        s.relay.leave().await.unwrap();

        assert_eq!(
            s.drain_events(),
            vec![
                RelayEvent::PeerCountChanged(1),
                RelayEvent::PhaseChanged(RelayPhase::Leaving),
                RelayEvent::ConnectionRemoved {
                    id,
                    reason: CloseReason::LocalLeave
                },
                RelayEvent::PeerCountChanged(0),
                RelayEvent::PhaseChanged(RelayPhase::Idle),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_with_stuck_peer_completes() {
        let config = RelayConfig {
            write_timeout_ms: None,
            ..fast_config()
        };
        let mut s = streaming(config).await;
        let (_, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (_, p2) = s.connect(WriteBehavior::Hang).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let left = tokio::time::timeout(Duration::from_secs(5), s.relay.leave()).await;
        assert!(matches!(left, Ok(Ok(()))));
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
        assert!(p1.is_ended());
        assert!(p2.is_ended());

        // The responsive peer still got its disconnect, after all its media
        let last = p1.writes().last().map(|(_, data)| data.clone());
        assert_eq!(last.as_deref(), Some(&swarmcast_wire::DISCONNECT_FRAME[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_ends_every_transport() {
        let mut s = streaming(fast_config()).await;
        let mut peers = Vec::new();
        for seed in 0..4 {
            let behavior = WriteBehavior::Flaky {
                failure_rate: 0.5,
                seed,
            };
            peers.push(s.connect(behavior).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        s.relay.leave().await.unwrap();
        settle().await;
        assert_eq!(s.relay.peer_count(), 0);
        for (_, peer) in &peers {
            assert!(peer.is_ended());
        }

        // Nothing reaches a peer once the relay has left
        let written: Vec<usize> = peers.iter().map(|(_, p)| p.writes().len()).collect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let later: Vec<usize> = peers.iter().map(|(_, p)| p.writes().len()).collect();
        assert_eq!(written, later);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_destroys_overlay() {
        let mut s = streaming(fast_config()).await;
        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();

        s.relay.shutdown().await.unwrap();
        assert!(s.overlay.probe().is_destroyed());
        assert!(peer.is_ended());
        assert_eq!(s.relay.phase(), RelayPhase::Idle);
    }

    // ---- connection set ----

    #[tokio::test(start_paused = true)]
    async fn test_connection_refused_unless_streaming() {
        let s = Scenario::new(fast_config()).unwrap();
        let (peer, handle) = test_peer(WriteBehavior::Deliver, 9);

        assert!(s.relay.on_connection(peer).await.is_none());
        assert!(handle.is_ended());
        assert_eq!(s.relay.peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_count_tracks_connection_set() {
        let mut s = streaming(fast_config()).await;
        let (id1, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (id2, p2) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (id3, _p3) = s.connect(WriteBehavior::Deliver).await.unwrap();
        assert_eq!(s.relay.peer_count(), 3);
        assert_eq!(s.relay.connection_ids(), vec![id1, id2, id3]);

        p1.close();
        p2.fail("connection reset");
        s.wait_for(|e| matches!(e, RelayEvent::PeerCountChanged(1)).then_some(()))
            .await
            .unwrap();

        assert_eq!(s.relay.peer_count(), 1);
        assert_eq!(s.relay.connection_ids(), vec![id3]);
        assert!(s.relay.is_encoding_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_close_is_idempotent() {
        let mut s = streaming(fast_config()).await;
        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();

        assert!(s.relay.close_connection(id, CloseReason::LocalLeave).await);
        assert!(!s.relay.close_connection(id, CloseReason::LocalLeave).await);
        assert!(
            !s.relay
                .close_connection(ConnectionId::new(999), CloseReason::LocalLeave)
                .await
        );

        // The remote noticing afterwards changes nothing
        peer.close();
        settle().await;

        let events = s.drain_events();
        assert_eq!(removed(&events, id), vec![CloseReason::LocalLeave]);
        assert_eq!(s.relay.peer_count(), 0);
        assert!(peer.is_ended());
        assert_eq!(s.relay.stats().connections_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_disconnect_removes_connection() {
        let mut s = streaming(fast_config()).await;
        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();

        peer.send(swarmcast_wire::disconnect_frame());
        let reason = s
            .wait_for(|e| match e {
                RelayEvent::ConnectionRemoved { id: seen, reason } if *seen == id => {
                    Some(reason.clone())
                }
                _ => None,
            })
            .await
            .unwrap();

        assert_eq!(reason, CloseReason::RemoteDisconnect);
        assert!(peer.is_ended());
        assert_eq!(s.relay.peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_skipped() {
        let mut s = streaming(fast_config()).await;
        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();

        peer.send(Bytes::new());
        peer.send(vec![9u8, 1, 2]);
        peer.send(vec![1u8]);
        settle().await;

        assert_eq!(s.relay.connection_ids(), vec![id]);
        assert_eq!(s.relay.stats().malformed_frames, 3);
    }

    // ---- capture and keyframes ----

    #[tokio::test(start_paused = true)]
    async fn test_capture_starts_with_first_connection() {
        let mut s = streaming(fast_config()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(s.capture.produced(), 0);
        assert!(!s.relay.is_encoding_active());

        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let video = peer.video_chunks();
        assert!(video.len() >= 5);
        assert!(video[0].keyframe);
        assert_eq!(frame_sequence(&video[0].payload), Some(1));
        assert!(video[1..].iter().all(|c| !c.keyframe));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connection_gets_keyframe() {
        let mut s = streaming(fast_config()).await;
        let (_, a) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen_by_a = a.video_chunks().len();

        let (_, b) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let b_video = b.video_chunks();
        assert!(b_video[0].keyframe);
        // The existing connection gets the same keyframe
        assert!(a.video_chunks()[seen_by_a..].iter().any(|c| c.keyframe));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_cadence() {
        let mut s = streaming(fast_config()).await;
        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let times = peer.keyframe_times();
        assert!(times.len() >= 4, "got {} keyframes", times.len());
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_millis(1050));
        }
        assert!(s.relay.stats().forced_keyframes >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_screen_keeps_sending_keyframes() {
        let mut s = Scenario::with_capture(
            fast_config(),
            SyntheticCaptureConfig {
                max_frames: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        s.relay.join("room").await.unwrap();
        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let video = peer.video_chunks();
        assert!(video.len() >= 6);
        // Everything after the capture ended is the last frame, re-keyed
        assert!(video[3..]
            .iter()
            .all(|c| c.keyframe && frame_sequence(&c.payload) == Some(3)));
        assert_eq!(s.capture.outstanding(), 1);

        s.relay.leave().await.unwrap();
        assert_eq!(s.capture.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_idle_without_connections() {
        let mut s = streaming(fast_config()).await;
        let (id, _peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        s.relay.close_connection(id, CloseReason::LocalLeave).await;
        assert!(!s.relay.is_encoding_active());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let encoded = s.codec_log().lock().encoded.len();
        let produced = s.capture.produced();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(s.codec_log().lock().encoded.len(), encoded);
        assert_eq!(s.capture.produced(), produced);

        // And it all resumes for the next connection
        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(s.capture.produced() > produced);
        assert!(peer.video_chunks()[0].keyframe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_released_before_replacement() {
        let mut s = streaming(fast_config()).await;
        let (_, _peer) = s.connect(WriteBehavior::Deliver).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(s.capture.outstanding() <= 1);
        }
        assert!(s.capture.produced() > 10);

        s.relay.leave().await.unwrap();
        assert_eq!(s.capture.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_failure_forces_next_keyframe() {
        let mut s = streaming(fast_config()).await;
        let (_, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        s.codec.fail_next_encodes(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let video = peer.video_chunks();
        let keys: Vec<u64> = video
            .iter()
            .filter(|c| c.keyframe)
            .filter_map(|c| frame_sequence(&c.payload))
            .collect();
        // Frame 1 (first connection) and the frame after the failed one
        assert_eq!(keys.len(), 2);
        assert!(s.relay.stats().encode_failures >= 1);
    }

    // ---- broadcast ----

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_isolates_failed_connection() {
        let mut s = streaming(fast_config()).await;
        let (id1, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (id2, p2) = s.connect(WriteBehavior::Fail).await.unwrap();
        let (id3, p3) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(s.relay.connection_ids(), vec![id1, id3]);
        assert!(p2.is_ended());
        assert!(p2.chunks().is_empty());
        assert!(p1.video_chunks().len() >= 5);
        assert!(p3.video_chunks().len() >= 5);

        let events = s.drain_events();
        let reasons = removed(&events, id2);
        assert_eq!(reasons.len(), 1);
        assert!(matches!(reasons[0], CloseReason::WriteFailed(_)));
        assert_eq!(s.relay.stats().write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_write_times_out() {
        let mut s = streaming(fast_config()).await;
        let (_, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (id2, _p2) = s.connect(WriteBehavior::Hang).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(!s.relay.connection_ids().contains(&id2));
        let events = s.drain_events();
        match removed(&events, id2).as_slice() {
            [CloseReason::WriteFailed(reason)] => assert!(reason.contains("timed out")),
            other => panic!("unexpected removal: {other:?}"),
        }
        assert!(p1.video_chunks().len() >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_no_connections() {
        let s = streaming(fast_config()).await;
        let report = s
            .relay
            .broadcast(&MediaChunk::video(vec![1, 2, 3], true, 0))
            .await;
        assert_eq!(report.attempted(), 0);
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_swarm_keeps_invariants() {
        let mut s = streaming(fast_config()).await;
        let mut peers = Vec::new();
        for seed in 0..6 {
            let behavior = WriteBehavior::Flaky {
                failure_rate: 0.02,
                seed,
            };
            peers.push(s.connect(behavior).await.unwrap());
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let live = s.relay.connection_ids();
        assert_eq!(live.len(), s.relay.peer_count());

        let mut gone = 0;
        for (id, peer) in &peers {
            if live.contains(id) {
                assert!(!peer.is_ended());
                assert!(!peer.keyframe_times().is_empty());
            } else {
                assert!(peer.is_ended());
                gone += 1;
            }
        }
        let stats = s.relay.stats();
        assert_eq!(stats.connections_closed, gone);
        assert_eq!(stats.write_failures, gone);
        assert_eq!(s.relay.is_encoding_active(), !live.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_peer_does_not_stall_others() {
        let config = RelayConfig {
            write_timeout_ms: Some(5000),
            ..fast_config()
        };
        let mut s = streaming(config).await;
        let (_, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (id2, _p2) = s.connect(WriteBehavior::Hang).await.unwrap();
        let before = p1.video_chunks().len();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        // Roughly one chunk per 33 ms capture interval
        let gained = p1.video_chunks().len() - before;
        assert!(gained >= 50, "responsive peer only got {gained} chunks");
        // The hung write has not timed out yet
        assert!(s.relay.connection_ids().contains(&id2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_peer_dropped_when_queue_fills() {
        let config = RelayConfig {
            write_timeout_ms: None,
            outbound_capacity: 8,
            ..fast_config()
        };
        let mut s = streaming(config).await;
        let (id1, p1) = s.connect(WriteBehavior::Deliver).await.unwrap();
        let (id2, p2) = s.connect(WriteBehavior::Hang).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(s.relay.connection_ids(), vec![id1]);
        assert!(p2.is_ended());
        let events = s.drain_events();
        match removed(&events, id2).as_slice() {
            [CloseReason::WriteFailed(reason)] => assert!(reason.contains("queue full")),
            other => panic!("unexpected removal: {other:?}"),
        }
        assert_eq!(s.relay.stats().queue_overflows, 1);
        assert!(p1.video_chunks().len() >= 20);
    }

    // ---- receive path ----

    #[tokio::test(start_paused = true)]
    async fn test_inbound_deltas_wait_for_keyframe() {
        let mut s = streaming(fast_config()).await;
        let mut frames = s.relay.render_frames().unwrap();
        assert!(s.relay.render_frames().is_none());
        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        assert_eq!(s.relay.needs_keyframe(id), Some(true));

        let delta = MediaChunk::video(vec![0xD], false, 0);
        let key = MediaChunk::video(vec![0xC], true, 0);

        peer.send_chunk(&delta);
        peer.send_chunk(&delta);
        settle().await;
        assert!(s.codec_log().lock().decoded_for(id).is_empty());
        assert_eq!(s.relay.needs_keyframe(id), Some(true));

        peer.send_chunk(&key);
        peer.send_chunk(&delta);
        settle().await;
        assert_eq!(s.relay.needs_keyframe(id), Some(false));

        s.codec.fail_next_decodes(1);
        peer.send_chunk(&delta);
        settle().await;
        assert_eq!(s.relay.needs_keyframe(id), Some(true));

        peer.send_chunk(&delta);
        peer.send_chunk(&key);
        settle().await;
        assert_eq!(s.relay.needs_keyframe(id), Some(false));

        let log = s.codec_log();
        let log = log.lock();
        assert_eq!(log.gate_violations(id), 0);
        assert_eq!(log.decoded_for(id).len(), 4);

        let stats = s.relay.stats();
        assert_eq!(stats.dropped_awaiting_keyframe, 3);
        assert_eq!(stats.decode_failures, 1);

        let mut rendered = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            assert_eq!(frame.connection, id);
            rendered.push(frame.data[0]);
        }
        assert_eq!(rendered, vec![0xC, 0xD, 0xC]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_audio_needs_audio_enabled() {
        let mut s = streaming(fast_config()).await;
        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        peer.send_chunk(&MediaChunk::audio(vec![1, 2], 0));
        settle().await;
        assert!(s.codec_log().lock().decoded_for(id).is_empty());
        assert_eq!(s.relay.connection_ids(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_path() {
        let config = RelayConfig {
            enable_audio: true,
            ..fast_config()
        };
        let mut s = streaming(config).await;
        assert_eq!(s.capture.opened(), 2);

        let (id, peer) = s.connect(WriteBehavior::Deliver).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let chunks = peer.chunks();
        assert!(chunks.iter().any(|c| c.media_kind() == Some(MediaKind::Audio)));
        assert!(peer.video_chunks()[0].keyframe);
        assert!(s.relay.stats().audio_frames_captured > 0);
        // Audio buffers go straight back; only the last video frame is held
        assert!(s.capture.outstanding() <= 1);

        // Audio never waits for a keyframe
        peer.send_chunk(&MediaChunk::audio(vec![1, 2], 0));
        settle().await;
        let decoded = s.codec_log().lock().decoded_for(id);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind, MediaKind::Audio);
        assert_eq!(s.relay.needs_keyframe(id), Some(true));

        s.relay.leave().await.unwrap();
        assert_eq!(s.capture.closed(), 2);
        assert_eq!(s.capture.outstanding(), 0);
    }
}
