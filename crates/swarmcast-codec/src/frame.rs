//! Raw captured frames and the last-frame slot
//!
//! Capture engines hand out buffers they own. Each one must be given back
//! exactly once, so a [`RawFrame`] carries an optional release hook that runs
//! on [`RawFrame::release`] or, failing that, on drop.

use bytes::Bytes;
use std::fmt;
use swarmcast_core::MediaKind;

/// Release hook handed back to the capture engine
pub struct FrameLease(Box<dyn FnOnce() + Send + 'static>);

impl FrameLease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        FrameLease(Box::new(release))
    }
}

/// One raw frame pulled from a capture source
pub struct RawFrame {
    kind: MediaKind,
    data: Bytes,
    timestamp_us: u64,
    lease: Option<FrameLease>,
}

impl RawFrame {
    pub fn new(kind: MediaKind, data: impl Into<Bytes>, timestamp_us: u64) -> Self {
        Self {
            kind,
            data: data.into(),
            timestamp_us,
            lease: None,
        }
    }

    /// Attach the engine's release hook
    pub fn with_lease(mut self, lease: FrameLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Return the buffer to the capture engine
    pub fn release(mut self) {
        self.run_lease();
    }

    fn run_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            (lease.0)();
        }
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        self.run_lease();
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("timestamp_us", &self.timestamp_us)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

/// Holds at most one live frame: the most recent capture
#[derive(Debug, Default)]
pub struct FrameSlot {
    frame: Option<RawFrame>,
    replaced: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new frame, releasing the previous one first
    pub fn replace(&mut self, frame: RawFrame) -> &RawFrame {
        if let Some(old) = self.frame.take() {
            old.release();
            self.replaced += 1;
        }
        self.frame.insert(frame)
    }

    pub fn get(&self) -> Option<&RawFrame> {
        self.frame.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.frame.is_some()
    }

    /// Release the held frame, if any
    pub fn clear(&mut self) {
        if let Some(old) = self.frame.take() {
            old.release();
        }
    }

    /// How many frames were released by replacement
    pub fn replaced(&self) -> u64 {
        self.replaced
    }
}
