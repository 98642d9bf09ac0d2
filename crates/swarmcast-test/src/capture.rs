//! Synthetic capture device
//!
//! Produces numbered frames at a fixed interval and counts every buffer it
//! hands out and gets back, so tests can check the release discipline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swarmcast_codec::{CaptureDevice, FrameLease, FrameReader, RawFrame, SourceInfo, TrackSettings};
use swarmcast_core::{MediaKind, SwarmcastError, SwarmcastResult};

#[derive(Clone, Debug)]
pub struct SyntheticCaptureConfig {
    pub sources: Vec<SourceInfo>,
    /// Polls answered with an empty source list before the sources appear
    pub warmup_polls: u32,
    pub video: TrackSettings,
    pub audio: TrackSettings,
    pub frame_interval: Duration,
    pub frame_size: usize,
    /// End each track after this many frames
    pub max_frames: Option<u64>,
}

impl Default for SyntheticCaptureConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceInfo::new("window:1", "Terminal"),
                SourceInfo::new("screen:0", "Entire Screen"),
            ],
            warmup_polls: 0,
            video: TrackSettings {
                width: 1280,
                height: 720,
                framerate: Some(30.0),
                ..Default::default()
            },
            audio: TrackSettings {
                sample_rate: Some(48_000),
                channels: Some(2),
                ..Default::default()
            },
            frame_interval: Duration::from_millis(33),
            frame_size: 64,
            max_frames: None,
        }
    }
}

/// Counters shared by the device and every reader it opened
#[derive(Debug, Default)]
pub struct CaptureProbe {
    pub polls: AtomicU32,
    pub opened: AtomicU32,
    pub closed: AtomicU32,
    pub produced: AtomicU64,
    pub released: AtomicU64,
    /// Source id of the last open
    pub last_source: parking_lot::Mutex<Option<String>>,
}

impl CaptureProbe {
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Frames handed out and not yet given back
    pub fn outstanding(&self) -> u64 {
        self.produced() - self.released()
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct SyntheticCapture {
    config: SyntheticCaptureConfig,
    probe: Arc<CaptureProbe>,
}

impl SyntheticCapture {
    pub fn new(config: SyntheticCaptureConfig) -> Self {
        Self {
            config,
            probe: Arc::new(CaptureProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<CaptureProbe> {
        Arc::clone(&self.probe)
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new(SyntheticCaptureConfig::default())
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn sources(&self) -> SwarmcastResult<Vec<SourceInfo>> {
        let poll = self.probe.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if poll <= self.config.warmup_polls {
            Ok(Vec::new())
        } else {
            Ok(self.config.sources.clone())
        }
    }

    async fn open(
        &self,
        source: &SourceInfo,
        kind: MediaKind,
    ) -> SwarmcastResult<Box<dyn FrameReader>> {
        if !self.config.sources.contains(source) {
            return Err(SwarmcastError::DiscoveryFailed(format!(
                "unknown source {}",
                source.id
            )));
        }
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        *self.probe.last_source.lock() = Some(source.id.clone());

        let settings = match kind {
            MediaKind::Video => self.config.video.clone(),
            MediaKind::Audio => self.config.audio.clone(),
        };
        Ok(Box::new(SyntheticReader {
            kind,
            settings,
            interval: self.config.frame_interval,
            size: self.config.frame_size.max(8),
            max_frames: self.config.max_frames,
            sequence: 0,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct SyntheticReader {
    kind: MediaKind,
    settings: TrackSettings,
    interval: Duration,
    size: usize,
    max_frames: Option<u64>,
    sequence: u64,
    probe: Arc<CaptureProbe>,
}

#[async_trait]
impl FrameReader for SyntheticReader {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn settings(&self) -> TrackSettings {
        self.settings.clone()
    }

    async fn read(&mut self) -> SwarmcastResult<Option<RawFrame>> {
        if self.max_frames.is_some_and(|max| self.sequence >= max) {
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;

        self.sequence += 1;
        let mut data = vec![self.kind as u8; self.size];
        data[..8].copy_from_slice(&self.sequence.to_be_bytes());

        self.probe.produced.fetch_add(1, Ordering::SeqCst);
        let probe = Arc::clone(&self.probe);
        let timestamp_us = self.sequence * self.interval.as_micros() as u64;

        Ok(Some(RawFrame::new(self.kind, data, timestamp_us).with_lease(
            FrameLease::new(move || {
                probe.released.fetch_add(1, Ordering::SeqCst);
            }),
        )))
    }

    async fn close(&mut self) {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sequence number a synthetic frame was stamped with
pub fn frame_sequence(data: &[u8]) -> Option<u64> {
    let head: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}
