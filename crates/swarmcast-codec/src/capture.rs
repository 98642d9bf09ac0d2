//! Capture source contracts and acquisition
//!
//! Capture devices may report no sources for a while after start-up
//! (permissions prompts, display servers still initialising), so acquiring
//! one is a bounded poll with backoff.

use async_trait::async_trait;
use swarmcast_core::{MediaKind, RetryPolicy, SwarmcastError, SwarmcastResult};
use tracing::{debug, info, warn};

use crate::RawFrame;

/// A capturable source as enumerated by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
}

impl SourceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Properties of an opened capture track
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: Option<f32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// The capture device (screen, camera, microphone)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Enumerate sources; may legitimately be empty while the device warms up
    async fn sources(&self) -> SwarmcastResult<Vec<SourceInfo>>;

    /// Open a track of the given kind on a source
    async fn open(&self, source: &SourceInfo, kind: MediaKind)
        -> SwarmcastResult<Box<dyn FrameReader>>;
}

/// Pull-based reader over one capture track
#[async_trait]
pub trait FrameReader: Send {
    fn kind(&self) -> MediaKind;

    fn settings(&self) -> TrackSettings;

    /// Next frame, `Ok(None)` once the track has ended
    async fn read(&mut self) -> SwarmcastResult<Option<RawFrame>>;

    /// Stop the track
    async fn close(&mut self) {}
}

/// Prefer a source named like a screen, otherwise the first one
pub fn select_source(sources: &[SourceInfo]) -> Option<&SourceInfo> {
    sources
        .iter()
        .find(|s| s.name.to_lowercase().contains("screen"))
        .or_else(|| sources.first())
}

/// Poll the device until it offers a source, within the retry budget
pub async fn acquire_source(
    device: &dyn CaptureDevice,
    policy: &RetryPolicy,
) -> SwarmcastResult<SourceInfo> {
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        match device.sources().await {
            Ok(sources) => {
                if let Some(source) = select_source(&sources) {
                    info!(
                        attempt = attempt + 1,
                        source = %source.name,
                        available = sources.len(),
                        "capture source acquired"
                    );
                    return Ok(source.clone());
                }
                debug!(attempt = attempt + 1, "no capture sources yet");
            }
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "capture source enumeration failed");
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    Err(SwarmcastError::DiscoverySourceUnavailable { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports sources only after `ready_after` polls
    struct SlowDevice {
        polls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl CaptureDevice for SlowDevice {
        async fn sources(&self) -> SwarmcastResult<Vec<SourceInfo>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(vec![
                    SourceInfo::new("w1", "Terminal"),
                    SourceInfo::new("s1", "Entire Screen"),
                ])
            } else if n % 2 == 0 {
                Err(SwarmcastError::DiscoveryFailed("device busy".into()))
            } else {
                Ok(Vec::new())
            }
        }

        async fn open(
            &self,
            _source: &SourceInfo,
            _kind: MediaKind,
        ) -> SwarmcastResult<Box<dyn FrameReader>> {
            Err(SwarmcastError::DiscoveryFailed("not used".into()))
        }
    }

    #[test]
    fn test_select_prefers_screen() {
        let sources = vec![
            SourceInfo::new("a", "Browser"),
            SourceInfo::new("b", "SCREEN 1"),
        ];
        assert_eq!(select_source(&sources).unwrap().id, "b");

        let sources = vec![SourceInfo::new("a", "Browser")];
        assert_eq!(select_source(&sources).unwrap().id, "a");

        assert!(select_source(&[]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_until_ready() {
        let device = SlowDevice {
            polls: AtomicU32::new(0),
            ready_after: 4,
        };
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        };

        let source = acquire_source(&device, &policy).await.unwrap();
        assert_eq!(source.id, "s1");
        assert_eq!(device.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up() {
        let device = SlowDevice {
            polls: AtomicU32::new(0),
            ready_after: u32::MAX,
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        };

        let err = acquire_source(&device, &policy).await.unwrap_err();
        assert!(matches!(
            err,
            SwarmcastError::DiscoverySourceUnavailable { attempts: 3 }
        ));
        assert_eq!(device.polls.load(Ordering::SeqCst), 3);
    }
}
