//! Decoded frames and the capture -> pipeline handoff.
//!
//! - `Frame`: RGB24 pixels plus capture timestamp.
//! - `LatestFrameSlot`: single-slot mailbox. Capture overwrites, the pipeline
//!   takes. Only the most recent frame matters, so an unconsumed frame is
//!   dropped rather than queued.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::Timestamp;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded RGB24 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: Timestamp,
    /// Capture sequence number, monotonically increasing per source.
    pub sequence: u64,
    /// First frame after the source (re)connected. Motion baselines restart here.
    pub resumed: bool,
}

impl Frame {
    /// Build a frame. `pixels` must hold `width * height * 3` bytes.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: Timestamp,
        sequence: u64,
    ) -> anyhow::Result<Self> {
        let expected = rgb_len(width, height);
        if pixels.len() != expected {
            anyhow::bail!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            );
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at,
            sequence,
            resumed: false,
        })
    }

    pub fn mark_resumed(mut self) -> Self {
        self.resumed = true;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Label used as the frame reference for live frames.
    pub fn reference(&self) -> String {
        format!("live/{:.0}-{}", self.captured_at, self.sequence)
    }

    /// Encode as JPEG for the classification port.
    #[cfg(feature = "image")]
    pub fn encode_jpeg(&self, quality: u8) -> anyhow::Result<Vec<u8>> {
        use image::codecs::jpeg::JpegEncoder;
        use image::ExtendedColorType;

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            &self.pixels,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

// ----------------------------------------------------------------------------
// LatestFrameSlot
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    dropped: u64,
    closed: bool,
}

/// Single-slot, overwrite-on-put mailbox between capture and the pipeline.
#[derive(Default)]
pub struct LatestFrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, replacing (and counting) any frame not yet taken.
    pub fn put(&self, frame: Frame) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut frame = frame;
        if let Some(stale) = state.frame.take() {
            state.dropped += 1;
            // Keep the reconnect marker even if its frame is overwritten.
            frame.resumed |= stale.resumed;
        }
        state.frame = Some(frame);
        self.ready.notify_one();
    }

    /// Take the pending frame, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or once the slot is closed and empty.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        let guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (mut state, _) = match self
            .ready
            .wait_timeout_while(guard, timeout, |s| s.frame.is_none() && !s.closed)
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.frame.take()
    }

    /// Wake any waiter and mark the slot closed (shutdown).
    pub fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Frames overwritten before the pipeline took them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}
