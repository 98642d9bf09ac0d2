//! Swarmcast Runtime - Relay orchestration
//!
//! Every peer encodes its own capture once and fans the encoded chunks out
//! to all connected peers, while decoding every peer's stream for local
//! rendering. The runtime owns:
//!
//! 1. Connection sessions (per-peer decoders and keyframe gate)
//! 2. The relay state (connection set, last-frame slot, keyframe flag)
//! 3. The capture loop, started lazily on the first connection
//! 4. The keyframe timer, re-encoding the last frame as a keyframe
//! 5. Per-connection outbound queues, so a slow peer only delays itself
//! 6. The join / leave lifecycle against the discovery overlay

pub mod events;
pub mod logging;
pub mod outbound;
pub mod relay;
pub mod session;
pub mod state;

pub use events::*;
pub use outbound::*;
pub use relay::*;
pub use session::*;
pub use state::*;
