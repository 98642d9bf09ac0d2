//! Frame tag byte

use swarmcast_core::ChunkKind;

/// Tag byte values
pub const TAG_VIDEO: u8 = 1;
pub const TAG_AUDIO: u8 = 2;
pub const TAG_DISCONNECT: u8 = 3;

/// Keyframe flag byte values (video only)
pub const FLAG_KEY: u8 = 1;
pub const FLAG_DELTA: u8 = 0;

/// Frame tag (byte 0)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    Video = TAG_VIDEO,
    Audio = TAG_AUDIO,
    Disconnect = TAG_DISCONNECT,
}

impl FrameTag {
    #[inline]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TAG_VIDEO => Some(FrameTag::Video),
            TAG_AUDIO => Some(FrameTag::Audio),
            TAG_DISCONNECT => Some(FrameTag::Disconnect),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Header bytes preceding the payload
    #[inline]
    pub fn header_len(self) -> usize {
        match self {
            FrameTag::Video => 2,
            FrameTag::Audio | FrameTag::Disconnect => 1,
        }
    }

    /// Whether byte 1 is a flag byte
    #[inline]
    pub fn has_flag(self) -> bool {
        self == FrameTag::Video
    }

    /// Whether anything may follow the header
    #[inline]
    pub fn carries_payload(self) -> bool {
        self != FrameTag::Disconnect
    }
}

impl From<ChunkKind> for FrameTag {
    fn from(kind: ChunkKind) -> Self {
        match kind {
            ChunkKind::Video => FrameTag::Video,
            ChunkKind::Audio => FrameTag::Audio,
            ChunkKind::Disconnect => FrameTag::Disconnect,
        }
    }
}

impl From<FrameTag> for ChunkKind {
    fn from(tag: FrameTag) -> Self {
        match tag {
            FrameTag::Video => ChunkKind::Video,
            FrameTag::Audio => ChunkKind::Audio,
            FrameTag::Disconnect => ChunkKind::Disconnect,
        }
    }
}
