//! Encoder and decoder adapters
//!
//! The adapters own an engine and enforce the state and keyframe rules
//! around it. Neither adapter ever retries: failures are reported and the
//! keyframe cadence heals the stream.

use swarmcast_core::{MediaChunk, MediaKind, SwarmcastError, SwarmcastResult};
use tracing::{debug, warn};

use crate::{CodecConfig, DecodeEngine, EncodeEngine, EngineState, RawFrame};

/// Encoder counters
#[derive(Clone, Debug, Default)]
pub struct EncoderStats {
    pub submitted: u64,
    pub keyframes: u64,
    pub failures: u64,
}

/// Wraps an encode engine
pub struct EncoderAdapter {
    kind: MediaKind,
    engine: Box<dyn EncodeEngine>,
    stats: EncoderStats,
}

impl EncoderAdapter {
    pub fn new(kind: MediaKind, engine: Box<dyn EncodeEngine>) -> Self {
        Self {
            kind,
            engine,
            stats: EncoderStats::default(),
        }
    }

    pub fn configure(&mut self, config: &CodecConfig) -> SwarmcastResult<()> {
        self.engine.configure(config)?;
        debug!(kind = %self.kind, "encoder configured");
        Ok(())
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_configured(&self) -> bool {
        self.engine.state() == EngineState::Configured
    }

    /// Submit a frame the caller keeps ownership of
    pub fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> SwarmcastResult<()> {
        if !self.is_configured() {
            return Err(SwarmcastError::CodecNotConfigured(self.kind));
        }

        match self.engine.encode(frame, force_keyframe) {
            Ok(()) => {
                self.stats.submitted += 1;
                if force_keyframe {
                    self.stats.keyframes += 1;
                }
                Ok(())
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!(kind = %self.kind, error = %e, "encode failed");
                Err(e)
            }
        }
    }

    /// Submit a frame and hand it back to the capture engine whatever the outcome
    pub fn encode_and_release(
        &mut self,
        frame: RawFrame,
        force_keyframe: bool,
    ) -> SwarmcastResult<()> {
        let result = self.encode(&frame, force_keyframe);
        frame.release();
        result
    }

    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    pub fn close(&mut self) {
        if self.engine.state() != EngineState::Closed {
            self.engine.close();
        }
    }
}

/// What happened to a chunk handed to a decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Given to the engine
    Submitted { keyframe: bool },
    /// Delta dropped while waiting for a keyframe
    AwaitingKeyframe,
}

/// Decoder counters
#[derive(Clone, Debug, Default)]
pub struct DecoderStats {
    pub submitted: u64,
    pub keyframes: u64,
    pub dropped_awaiting_keyframe: u64,
    pub failures: u64,
}

/// Wraps a decode engine with the keyframe gate.
///
/// For video the gate starts closed: deltas are dropped until a keyframe
/// decodes successfully, and any failure closes it again. Audio chunks
/// are independently decodable and are never gated.
pub struct DecoderAdapter {
    kind: MediaKind,
    engine: Box<dyn DecodeEngine>,
    needs_keyframe: bool,
    stats: DecoderStats,
}

impl DecoderAdapter {
    pub fn new(kind: MediaKind, engine: Box<dyn DecodeEngine>) -> Self {
        Self {
            kind,
            engine,
            needs_keyframe: kind == MediaKind::Video,
            stats: DecoderStats::default(),
        }
    }

    pub fn configure(&mut self, config: &CodecConfig) -> SwarmcastResult<()> {
        self.engine.configure(config)?;
        debug!(kind = %self.kind, "decoder configured");
        Ok(())
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe
    }

    /// Close the gate until the next keyframe
    pub fn request_keyframe(&mut self) {
        if self.kind == MediaKind::Video {
            self.needs_keyframe = true;
        }
    }

    pub fn decode(&mut self, chunk: &MediaChunk) -> SwarmcastResult<DecodeOutcome> {
        if self.needs_keyframe && chunk.is_delta() {
            self.stats.dropped_awaiting_keyframe += 1;
            return Ok(DecodeOutcome::AwaitingKeyframe);
        }

        if self.engine.state() != EngineState::Configured {
            self.request_keyframe();
            return Err(SwarmcastError::CodecNotConfigured(self.kind));
        }

        match self.engine.decode(chunk) {
            Ok(()) => {
                self.stats.submitted += 1;
                if chunk.keyframe {
                    self.stats.keyframes += 1;
                    self.needs_keyframe = false;
                }
                Ok(DecodeOutcome::Submitted {
                    keyframe: chunk.keyframe,
                })
            }
            Err(e) => {
                self.stats.failures += 1;
                self.request_keyframe();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn close(&mut self) {
        if self.engine.state() != EngineState::Closed {
            self.engine.close();
        }
    }
}
