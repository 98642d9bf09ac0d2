//! Relay configuration
//!
//! All durations are carried as milliseconds so a configuration document
//! stays plain JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SwarmcastError, SwarmcastResult};

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts before giving up (at least 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }
}

/// Video encoder / decoder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoParams {
    pub codec: String,
    /// Emit Annex-B framed bitstream
    pub annexb: bool,
    pub bitrate: u32,
    /// Used when the capture track does not report a frame rate
    pub fallback_framerate: f32,
    pub optimize_for_latency: bool,
    /// "no-preference", "prefer-hardware" or "prefer-software"
    pub hardware_acceleration: String,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            codec: "avc1.640033".to_string(),
            annexb: true,
            bitrate: 5_000_000,
            fallback_framerate: 30.0,
            optimize_for_latency: true,
            hardware_acceleration: "no-preference".to_string(),
        }
    }
}

/// Audio encoder / decoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            codec: "opus".to_string(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Forced keyframe cadence in milliseconds
    pub keyframe_interval_ms: u64,
    /// Capture source acquisition retries
    pub capture_retry: RetryPolicy,
    /// Capture, encode and decode audio alongside video
    pub enable_audio: bool,
    pub video: VideoParams,
    pub audio: AudioParams,
    /// Upper bound for a single peer write, `None` leaves writes unbounded
    pub write_timeout_ms: Option<u64>,
    /// Chunks queued for one peer before it is dropped as too slow
    pub outbound_capacity: usize,
    /// Capacity of the UI notification channel
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keyframe_interval_ms: 1000,
            capture_retry: RetryPolicy::default(),
            enable_audio: false,
            video: VideoParams::default(),
            audio: AudioParams::default(),
            write_timeout_ms: Some(5000),
            outbound_capacity: 256,
            event_capacity: 64,
        }
    }
}

impl RelayConfig {
    /// Parse a JSON configuration document; missing fields take defaults
    pub fn from_json(text: &str) -> SwarmcastResult<Self> {
        let config: RelayConfig = serde_json::from_str(text)
            .map_err(|e| SwarmcastError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwarmcastResult<()> {
        if self.keyframe_interval_ms == 0 {
            return Err(SwarmcastError::InvalidConfig(
                "keyframe_interval_ms must be positive".into(),
            ));
        }
        if self.capture_retry.max_attempts == 0 {
            return Err(SwarmcastError::InvalidConfig(
                "capture_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.write_timeout_ms == Some(0) {
            return Err(SwarmcastError::InvalidConfig(
                "write_timeout_ms must be positive when set".into(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(SwarmcastError::InvalidConfig(
                "outbound_capacity must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SwarmcastError::InvalidConfig(
                "event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
