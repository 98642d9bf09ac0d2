//! Loopback codec
//!
//! The "encoder" copies the raw frame into a chunk and the "decoder" copies
//! the chunk into a decoded frame. Every call is logged, and failures can
//! be injected on either side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use swarmcast_codec::{
    ChunkSink, CodecConfig, CodecFactory, DecodeEngine, DecodedFrame, EncodeEngine, EngineState,
    RawFrame, RenderSink,
};
use swarmcast_core::{ConnectionId, MediaChunk, MediaKind, SwarmcastError, SwarmcastResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeRecord {
    pub kind: MediaKind,
    pub keyframe: bool,
    pub ok: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeRecord {
    pub connection: ConnectionId,
    pub kind: MediaKind,
    pub keyframe: bool,
    pub ok: bool,
}

#[derive(Debug, Default)]
pub struct CodecLog {
    pub configured: Vec<CodecConfig>,
    pub encoded: Vec<EncodeRecord>,
    pub decoded: Vec<DecodeRecord>,
    pub encoders_closed: u32,
    pub decoders_closed: u32,
}

impl CodecLog {
    /// Video chunks a connection's engine saw while it should have been
    /// waiting for a keyframe
    pub fn gate_violations(&self, connection: ConnectionId) -> usize {
        let mut awaiting = true;
        let mut violations = 0;
        for record in self
            .decoded
            .iter()
            .filter(|r| r.connection == connection && r.kind == MediaKind::Video)
        {
            if awaiting && !record.keyframe {
                violations += 1;
            }
            if !record.ok {
                awaiting = true;
            } else if record.keyframe {
                awaiting = false;
            }
        }
        violations
    }

    pub fn decoded_for(&self, connection: ConnectionId) -> Vec<DecodeRecord> {
        self.decoded
            .iter()
            .filter(|r| r.connection == connection)
            .copied()
            .collect()
    }

    pub fn video_keyframes_encoded(&self) -> usize {
        self.encoded
            .iter()
            .filter(|r| r.ok && r.kind == MediaKind::Video && r.keyframe)
            .count()
    }
}

#[derive(Default)]
pub struct LoopbackCodec {
    log: Arc<Mutex<CodecLog>>,
    fail_encodes: Arc<AtomicU32>,
    fail_decodes: Arc<AtomicU32>,
}

impl LoopbackCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<CodecLog>> {
        Arc::clone(&self.log)
    }

    /// Fail the next `n` encodes
    pub fn fail_next_encodes(&self, n: u32) {
        self.fail_encodes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` decodes, on any connection
    pub fn fail_next_decodes(&self, n: u32) {
        self.fail_decodes.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl CodecFactory for LoopbackCodec {
    fn encoder(&self, kind: MediaKind, output: ChunkSink) -> Box<dyn EncodeEngine> {
        Box::new(LoopbackEncoder {
            kind,
            state: EngineState::Unconfigured,
            output,
            log: Arc::clone(&self.log),
            fail: Arc::clone(&self.fail_encodes),
        })
    }

    fn decoder(
        &self,
        kind: MediaKind,
        connection: ConnectionId,
        output: RenderSink,
    ) -> Box<dyn DecodeEngine> {
        Box::new(LoopbackDecoder {
            kind,
            connection,
            state: EngineState::Unconfigured,
            output,
            log: Arc::clone(&self.log),
            fail: Arc::clone(&self.fail_decodes),
        })
    }
}

struct LoopbackEncoder {
    kind: MediaKind,
    state: EngineState,
    output: ChunkSink,
    log: Arc<Mutex<CodecLog>>,
    fail: Arc<AtomicU32>,
}

impl EncodeEngine for LoopbackEncoder {
    fn configure(&mut self, config: &CodecConfig) -> SwarmcastResult<()> {
        if config.kind() != self.kind {
            return Err(SwarmcastError::InvalidConfig(format!(
                "{} encoder given {} config",
                self.kind,
                config.kind()
            )));
        }
        self.log.lock().configured.push(config.clone());
        self.state = EngineState::Configured;
        Ok(())
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn encode(&mut self, frame: &RawFrame, key_frame: bool) -> SwarmcastResult<()> {
        let keyframe = key_frame || self.kind == MediaKind::Audio;
        if take_failure(&self.fail) {
            self.log.lock().encoded.push(EncodeRecord {
                kind: self.kind,
                keyframe,
                ok: false,
            });
            return Err(SwarmcastError::EncodeFailure {
                kind: self.kind,
                reason: "injected failure".into(),
            });
        }

        let chunk = match self.kind {
            MediaKind::Video => {
                MediaChunk::video(frame.data().clone(), key_frame, frame.timestamp_us())
            }
            MediaKind::Audio => MediaChunk::audio(frame.data().clone(), frame.timestamp_us()),
        };
        self.log.lock().encoded.push(EncodeRecord {
            kind: self.kind,
            keyframe,
            ok: true,
        });
        // Output is asynchronous in real engines; a closed sink just drops it
        let _ = self.output.send(chunk);
        Ok(())
    }

    fn close(&mut self) {
        self.state = EngineState::Closed;
        self.log.lock().encoders_closed += 1;
    }
}

struct LoopbackDecoder {
    kind: MediaKind,
    connection: ConnectionId,
    state: EngineState,
    output: RenderSink,
    log: Arc<Mutex<CodecLog>>,
    fail: Arc<AtomicU32>,
}

impl DecodeEngine for LoopbackDecoder {
    fn configure(&mut self, _config: &CodecConfig) -> SwarmcastResult<()> {
        self.state = EngineState::Configured;
        Ok(())
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn decode(&mut self, chunk: &MediaChunk) -> SwarmcastResult<()> {
        let ok = !take_failure(&self.fail);
        self.log.lock().decoded.push(DecodeRecord {
            connection: self.connection,
            kind: self.kind,
            keyframe: chunk.keyframe,
            ok,
        });
        if !ok {
            return Err(SwarmcastError::DecodeFailure {
                kind: self.kind,
                reason: "injected failure".into(),
            });
        }

        let _ = self.output.send(DecodedFrame {
            connection: self.connection,
            kind: self.kind,
            data: chunk.payload.clone(),
            timestamp_us: chunk.timestamp_us,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.state = EngineState::Closed;
        self.log.lock().decoders_closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_encoder_copies_frame_into_chunk() {
        let codec = LoopbackCodec::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut encoder = codec.encoder(MediaKind::Video, tx);
        encoder
            .configure(&CodecConfig::video(&Default::default(), &Default::default()))
            .unwrap();

        let frame = RawFrame::new(MediaKind::Video, vec![1, 2, 3], 99);
        encoder.encode(&frame, true).unwrap();

        let chunk = rx.try_recv().unwrap();
        assert!(chunk.keyframe);
        assert_eq!(&chunk.payload[..], &[1, 2, 3]);
        assert_eq!(chunk.timestamp_us, 99);
    }

    #[test]
    fn test_injected_failures_run_out() {
        let codec = LoopbackCodec::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut encoder = codec.encoder(MediaKind::Video, tx);
        encoder
            .configure(&CodecConfig::video(&Default::default(), &Default::default()))
            .unwrap();
        codec.fail_next_encodes(1);

        let frame = RawFrame::new(MediaKind::Video, vec![0], 0);
        assert!(encoder.encode(&frame, false).is_err());
        assert!(encoder.encode(&frame, false).is_ok());
    }

    #[test]
    fn test_gate_violations_counts_early_deltas() {
        let id = ConnectionId::new(1);
        let record = |keyframe, ok| DecodeRecord {
            connection: id,
            kind: MediaKind::Video,
            keyframe,
            ok,
        };
        let log = CodecLog {
            decoded: vec![
                record(false, true),
                record(true, true),
                record(false, true),
                record(false, false),
                record(false, true),
                record(true, true),
            ],
            ..Default::default()
        };
        assert_eq!(log.gate_violations(id), 2);
        assert_eq!(log.gate_violations(ConnectionId::new(2)), 0);
    }
}
