//! Swarmcast Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the relay:
//! - Identifiers (ConnectionId, TopicId)
//! - Media chunks (video, audio, disconnect control)
//! - The error enum used across the workspace
//! - Relay configuration

pub mod config;
pub mod error;
pub mod id;
pub mod media;

pub use config::*;
pub use error::*;
pub use id::*;
pub use media::*;
