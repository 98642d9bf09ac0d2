//! Swarmcast Test Harness - Doubles, scenarios and swarm validation
//!
//! This crate provides:
//! - A synthetic capture device with release accounting
//! - A loopback codec that logs every encode and decode
//! - Scriptable transports (deliver, fail, hang, seeded flakiness)
//! - A scripted overlay for single-relay scenarios
//! - Multi-relay swarms over the in-process network

pub mod capture;
pub mod codec;
pub mod overlay;
pub mod scenario;
pub mod swarm;
pub mod transport;

pub use capture::*;
pub use codec::*;
pub use overlay::*;
pub use scenario::*;
pub use swarm::*;
pub use transport::*;
