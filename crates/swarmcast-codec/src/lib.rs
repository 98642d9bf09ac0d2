//! Swarmcast Codec Adapter
//!
//! Codec engines and capture sources are opaque collaborators. This crate
//! wraps them with the rules the relay depends on:
//!
//! - Raw frames are engine-owned buffers released exactly once
//! - The last captured frame lives in a single slot, released before replacement
//! - Encoders refuse work until configured
//! - Decoders drop delta chunks until a keyframe resynchronizes them
//!
//! # Resynchronization
//!
//! A decode failure never asks the sender for a retransmission. The decoder
//! simply goes back to waiting for a keyframe, and the sender's keyframe
//! cadence guarantees one arrives within a bounded interval.

pub mod adapter;
pub mod capture;
pub mod engine;
pub mod frame;

pub use adapter::*;
pub use capture::*;
pub use engine::*;
pub use frame::*;
