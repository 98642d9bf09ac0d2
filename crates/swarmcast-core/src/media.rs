//! Media chunk model
//!
//! A chunk is one unit of encoded output from a codec engine, or the
//! control marker a peer sends before it hangs up.

use bytes::Bytes;
use std::fmt;

/// Capture / codec media kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// What a chunk carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Video,
    Audio,
    /// Control marker: the sender is leaving
    Disconnect,
}

impl ChunkKind {
    /// Media kind for media chunks, `None` for control chunks
    pub fn media(self) -> Option<MediaKind> {
        match self {
            ChunkKind::Video => Some(MediaKind::Video),
            ChunkKind::Audio => Some(MediaKind::Audio),
            ChunkKind::Disconnect => None,
        }
    }
}

impl From<MediaKind> for ChunkKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => ChunkKind::Video,
            MediaKind::Audio => ChunkKind::Audio,
        }
    }
}

/// Encoded media chunk
#[derive(Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub kind: ChunkKind,
    /// Independently decodable (video only, always false otherwise)
    pub keyframe: bool,
    /// Codec bitstream bytes
    pub payload: Bytes,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
}

impl MediaChunk {
    pub fn video(payload: impl Into<Bytes>, keyframe: bool, timestamp_us: u64) -> Self {
        Self {
            kind: ChunkKind::Video,
            keyframe,
            payload: payload.into(),
            timestamp_us,
        }
    }

    pub fn audio(payload: impl Into<Bytes>, timestamp_us: u64) -> Self {
        Self {
            kind: ChunkKind::Audio,
            keyframe: false,
            payload: payload.into(),
            timestamp_us,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            kind: ChunkKind::Disconnect,
            keyframe: false,
            payload: Bytes::new(),
            timestamp_us: 0,
        }
    }

    /// Re-stamp the chunk (used on receive, where the wire carries no time)
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// A video chunk that depends on an earlier keyframe
    pub fn is_delta(&self) -> bool {
        self.kind == ChunkKind::Video && !self.keyframe
    }

    pub fn is_disconnect(&self) -> bool {
        self.kind == ChunkKind::Disconnect
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        self.kind.media()
    }
}

impl fmt::Debug for MediaChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaChunk")
            .field("kind", &self.kind)
            .field("keyframe", &self.keyframe)
            .field("len", &self.payload.len())
            .field("timestamp_us", &self.timestamp_us)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_is_never_keyframe() {
        let chunk = MediaChunk::audio(vec![1, 2, 3], 10);
        assert!(!chunk.keyframe);
        assert!(!chunk.is_delta());
        assert_eq!(chunk.media_kind(), Some(MediaKind::Audio));
    }

    #[test]
    fn test_delta_classification() {
        assert!(MediaChunk::video(vec![0], false, 0).is_delta());
        assert!(!MediaChunk::video(vec![0], true, 0).is_delta());
        assert!(MediaChunk::disconnect().is_disconnect());
        assert_eq!(MediaChunk::disconnect().media_kind(), None);
    }
}
