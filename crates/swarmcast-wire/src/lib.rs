//! Swarmcast Wire Protocol - Media chunk framing
//!
//! The overlay transport already delivers message-framed byte blocks, so a
//! frame is just a tag byte, an optional flag byte and the payload:
//! - Video: `[1][keyframe][payload..]`
//! - Audio: `[2][payload..]`
//! - Disconnect: `[3]`

pub mod frame;
pub mod tag;

pub use frame::*;
pub use tag::*;
