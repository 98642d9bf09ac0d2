//! Codec engine contracts
//!
//! An engine is configured once, then accepts submissions synchronously and
//! delivers its output asynchronously through the sink it was built with.

use bytes::Bytes;
use tokio::sync::mpsc;

use swarmcast_core::{
    AudioParams, ConnectionId, MediaChunk, MediaKind, SwarmcastResult, VideoParams,
};

use crate::{RawFrame, TrackSettings};

/// Engine lifecycle as reported by its `state` property
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    Configured,
    Closed,
}

/// Parameters an engine is configured with
#[derive(Clone, Debug, PartialEq)]
pub enum CodecConfig {
    Video {
        params: VideoParams,
        width: u32,
        height: u32,
        framerate: f32,
    },
    Audio {
        params: AudioParams,
        sample_rate: u32,
        channels: u16,
    },
}

impl CodecConfig {
    /// Video configuration sized to the capture track
    pub fn video(params: &VideoParams, track: &TrackSettings) -> Self {
        CodecConfig::Video {
            params: params.clone(),
            width: track.width,
            height: track.height,
            framerate: track.framerate.unwrap_or(params.fallback_framerate),
        }
    }

    /// Audio configuration; track values win over configured defaults
    pub fn audio(params: &AudioParams, track: &TrackSettings) -> Self {
        CodecConfig::Audio {
            params: params.clone(),
            sample_rate: track.sample_rate.unwrap_or(params.sample_rate),
            channels: track.channels.unwrap_or(params.channels),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            CodecConfig::Video { .. } => MediaKind::Video,
            CodecConfig::Audio { .. } => MediaKind::Audio,
        }
    }
}

/// Encoded output channel
pub type ChunkSink = mpsc::UnboundedSender<MediaChunk>;

/// A decoded frame ready for the render target of its connection
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub connection: ConnectionId,
    pub kind: MediaKind,
    pub data: Bytes,
    pub timestamp_us: u64,
}

/// Decoded output channel
pub type RenderSink = mpsc::UnboundedSender<DecodedFrame>;

/// Opaque encoder
pub trait EncodeEngine: Send {
    fn configure(&mut self, config: &CodecConfig) -> SwarmcastResult<()>;

    fn state(&self) -> EngineState;

    /// Submit one frame. The engine must not keep a reference to it.
    fn encode(&mut self, frame: &RawFrame, key_frame: bool) -> SwarmcastResult<()>;

    fn close(&mut self);
}

/// Opaque decoder
pub trait DecodeEngine: Send {
    fn configure(&mut self, config: &CodecConfig) -> SwarmcastResult<()>;

    fn state(&self) -> EngineState;

    fn decode(&mut self, chunk: &MediaChunk) -> SwarmcastResult<()>;

    fn close(&mut self);
}

/// Builds engines wired to their output sinks
pub trait CodecFactory: Send + Sync {
    fn encoder(&self, kind: MediaKind, output: ChunkSink) -> Box<dyn EncodeEngine>;

    fn decoder(
        &self,
        kind: MediaKind,
        connection: ConnectionId,
        output: RenderSink,
    ) -> Box<dyn DecodeEngine>;
}
