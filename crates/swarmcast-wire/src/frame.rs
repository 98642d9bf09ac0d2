//! Wire frame structure
//!
//! Frame = Tag + Flag (video only) + Payload. No length prefix: the
//! transport hands over exactly one frame per message.

use bytes::{BufMut, Bytes, BytesMut};
use swarmcast_core::{ChunkKind, MediaChunk, SwarmcastError, SwarmcastResult};

use crate::{FrameTag, FLAG_DELTA, FLAG_KEY, TAG_DISCONNECT};

/// The complete disconnect frame
pub const DISCONNECT_FRAME: [u8; 1] = [TAG_DISCONNECT];

/// Serialized disconnect frame, shareable across writes
pub fn disconnect_frame() -> Bytes {
    Bytes::from_static(&DISCONNECT_FRAME)
}

/// Parsed wire frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    pub tag: FrameTag,
    /// Byte 1 for video frames
    pub flag: Option<u8>,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn from_chunk(chunk: &MediaChunk) -> Self {
        let tag = FrameTag::from(chunk.kind);
        let flag = tag
            .has_flag()
            .then_some(if chunk.keyframe { FLAG_KEY } else { FLAG_DELTA });
        let payload = if tag.carries_payload() {
            chunk.payload.clone()
        } else {
            Bytes::new()
        };
        WireFrame { tag, flag, payload }
    }

    /// Parse a frame from an owned buffer; the payload shares its storage
    pub fn parse_bytes(buf: Bytes) -> SwarmcastResult<Self> {
        let Some(&tag_byte) = buf.first() else {
            return Err(SwarmcastError::MalformedFrame("empty frame".into()));
        };
        let tag = FrameTag::from_byte(tag_byte).ok_or_else(|| {
            SwarmcastError::MalformedFrame(format!("unknown tag {}", tag_byte))
        })?;

        let header_len = tag.header_len();
        if buf.len() < header_len {
            return Err(SwarmcastError::MalformedFrame(format!(
                "{:?} frame needs {} header bytes, got {}",
                tag,
                header_len,
                buf.len()
            )));
        }

        let flag = tag.has_flag().then(|| buf[1]);
        // Trailing bytes after a disconnect tag carry no meaning
        let payload = if tag.carries_payload() {
            buf.slice(header_len..)
        } else {
            Bytes::new()
        };

        Ok(WireFrame { tag, flag, payload })
    }

    /// Parse a frame from a borrowed buffer
    pub fn parse(buf: &[u8]) -> SwarmcastResult<Self> {
        Self::parse_bytes(Bytes::copy_from_slice(buf))
    }

    /// Serialize to a single contiguous buffer
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(self.tag.to_byte());
        if self.tag.has_flag() {
            buf.put_u8(self.flag.unwrap_or(FLAG_DELTA));
        }
        if self.tag.carries_payload() {
            buf.extend_from_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Serialized size
    pub fn size(&self) -> usize {
        if self.tag.carries_payload() {
            self.tag.header_len() + self.payload.len()
        } else {
            self.tag.header_len()
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flag == Some(FLAG_KEY)
    }

    /// Convert into a chunk. The wire carries no timestamp, so it is 0
    /// until the receiver stamps it.
    pub fn into_chunk(self) -> MediaChunk {
        let keyframe = self.is_keyframe();
        match ChunkKind::from(self.tag) {
            ChunkKind::Video => MediaChunk::video(self.payload, keyframe, 0),
            ChunkKind::Audio => MediaChunk::audio(self.payload, 0),
            ChunkKind::Disconnect => MediaChunk::disconnect(),
        }
    }
}

/// Frame a chunk for the wire
pub fn encode(chunk: &MediaChunk) -> Bytes {
    WireFrame::from_chunk(chunk).serialize()
}

/// Parse a wire frame back into a chunk
pub fn decode(buf: &[u8]) -> SwarmcastResult<MediaChunk> {
    WireFrame::parse(buf).map(WireFrame::into_chunk)
}

/// Zero-copy variant of [`decode`]
pub fn decode_bytes(buf: Bytes) -> SwarmcastResult<MediaChunk> {
    WireFrame::parse_bytes(buf).map(WireFrame::into_chunk)
}
