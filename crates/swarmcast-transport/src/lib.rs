//! Swarmcast Transport Layer - Overlay contracts
//!
//! This crate provides:
//! - The discovery overlay contract (join / flush / leave / destroy)
//! - The per-peer transport contract (message-framed writes, close/error events)
//! - An in-process overlay for demos and tests

pub mod memory;
pub mod overlay;

pub use memory::{duplex, MemoryNetwork, MemoryOverlay, MemoryTransport};
pub use overlay::*;
