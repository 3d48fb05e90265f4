//! Motion gate.
//!
//! A frame reaches the classification port only when
//! 1. its motion score exceeds the threshold, and
//! 2. more than the cooldown has elapsed since the last classification *attempt*.
//!
//! Attempts, not successes, consume the cooldown: a failed call still starts a
//! new window, which keeps a flapping classifier from being hammered.

use anyhow::Result;
use std::time::Duration;

use crate::frame::Frame;
use crate::Timestamp;

// ----------------------------------------------------------------------------
// Scoring
// ----------------------------------------------------------------------------

/// Region of interest in pixel coordinates, `x1..x2` by `y1..y2` (exclusive ends).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Roi {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self> {
        if x2 <= x1 || y2 <= y1 {
            anyhow::bail!("roi ({},{})-({},{}) is empty", x1, y1, x2, y2);
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Intersect with a `width` x `height` frame.
    fn clamp(self, width: u32, height: u32) -> Option<Self> {
        let x2 = self.x2.min(width);
        let y2 = self.y2.min(height);
        (x2 > self.x1 && y2 > self.y1).then_some(Self {
            x1: self.x1,
            y1: self.y1,
            x2,
            y2,
        })
    }
}

/// Computes a motion score for consecutive frames.
///
/// The first frame a scorer sees has no baseline and must score 0.
pub trait MotionScorer: Send {
    fn name(&self) -> &'static str;

    fn score(&mut self, frame: &Frame) -> Result<u64>;

    /// Forget the baseline (e.g. after a reconnect).
    fn reset(&mut self);
}

/// Frame-differencing scorer: counts luma pixels that changed by more than
/// `pixel_delta` since the previous frame.
pub struct FrameDiffScorer {
    roi: Option<Roi>,
    pixel_delta: u8,
    previous: Option<LumaPlane>,
}

struct LumaPlane {
    width: u32,
    height: u32,
    luma: Vec<u8>,
}

pub const DEFAULT_PIXEL_DELTA: u8 = 25;

impl FrameDiffScorer {
    pub fn new(pixel_delta: u8) -> Self {
        Self {
            roi: None,
            pixel_delta,
            previous: None,
        }
    }

    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }

    fn luma(&self, frame: &Frame) -> LumaPlane {
        let region = self
            .roi
            .and_then(|roi| roi.clamp(frame.width, frame.height))
            .unwrap_or(Roi {
                x1: 0,
                y1: 0,
                x2: frame.width,
                y2: frame.height,
            });
        let pixels = frame.pixels();
        let row_stride = frame.width as usize * 3;
        let mut luma =
            Vec::with_capacity(((region.x2 - region.x1) * (region.y2 - region.y1)) as usize);
        for y in region.y1..region.y2 {
            let row = &pixels[y as usize * row_stride..(y as usize + 1) * row_stride];
            for x in region.x1..region.x2 {
                let i = x as usize * 3;
                let (r, g, b) = (row[i] as u32, row[i + 1] as u32, row[i + 2] as u32);
                // ITU-R BT.601 integer approximation
                luma.push(((r * 299 + g * 587 + b * 114) / 1000) as u8);
            }
        }
        LumaPlane {
            width: region.x2 - region.x1,
            height: region.y2 - region.y1,
            luma,
        }
    }
}

impl Default for FrameDiffScorer {
    fn default() -> Self {
        Self::new(DEFAULT_PIXEL_DELTA)
    }
}

impl MotionScorer for FrameDiffScorer {
    fn name(&self) -> &'static str {
        "frame-diff"
    }

    fn score(&mut self, frame: &Frame) -> Result<u64> {
        let current = self.luma(frame);
        let score = match &self.previous {
            Some(prev) if prev.width == current.width && prev.height == current.height => prev
                .luma
                .iter()
                .zip(&current.luma)
                .filter(|(a, b)| a.abs_diff(**b) > self.pixel_delta)
                .count() as u64,
            Some(_) => {
                log::debug!("frame size changed; resetting motion baseline");
                0
            }
            None => 0,
        };
        self.previous = Some(current);
        Ok(score)
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

// ----------------------------------------------------------------------------
// Gate
// ----------------------------------------------------------------------------

/// Why the gate decided what it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateReason {
    BelowThreshold,
    CoolingDown,
    Admitted,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateDecision {
    pub should_classify: bool,
    /// Exposed for tuning/diagnostics.
    pub score: u64,
    pub reason: GateReason,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub frames: u64,
    pub below_threshold: u64,
    pub cooling_down: u64,
    pub admitted: u64,
}

/// Threshold + cooldown gate in front of the classification port.
pub struct MotionGate {
    threshold: u64,
    cooldown: Duration,
    last_attempt: Option<Timestamp>,
    stats: GateStats,
}

impl MotionGate {
    pub fn new(threshold: u64, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            last_attempt: None,
            stats: GateStats::default(),
        }
    }

    /// Score `frame` with `scorer`, then decide without recording an attempt.
    ///
    /// The caller reports the call with `record_attempt` once it is actually made.
    pub fn evaluate(&mut self, scorer: &mut dyn MotionScorer, frame: &Frame) -> Result<GateDecision> {
        let score = scorer.score(frame)?;
        let decision = self.check(score, frame.captured_at);
        log::debug!(
            "motion frame={} score={} decision={:?}",
            frame.sequence,
            score,
            decision.reason
        );
        Ok(decision)
    }

    /// Decide for a precomputed score. Admission records `at` as the last attempt.
    pub fn admit(&mut self, score: u64, at: Timestamp) -> GateDecision {
        let decision = self.check(score, at);
        if decision.should_classify {
            self.record_attempt(at);
        }
        decision
    }

    /// A classification call was made for the frame captured at `at`.
    pub fn record_attempt(&mut self, at: Timestamp) {
        self.last_attempt = Some(at);
        self.stats.admitted += 1;
    }

    fn check(&mut self, score: u64, at: Timestamp) -> GateDecision {
        self.stats.frames += 1;
        if score <= self.threshold {
            self.stats.below_threshold += 1;
            return GateDecision {
                should_classify: false,
                score,
                reason: GateReason::BelowThreshold,
            };
        }

        if !self.cooldown_elapsed(at) {
            self.stats.cooling_down += 1;
            return GateDecision {
                should_classify: false,
                score,
                reason: GateReason::CoolingDown,
            };
        }

        GateDecision {
            should_classify: true,
            score,
            reason: GateReason::Admitted,
        }
    }

    fn cooldown_elapsed(&self, at: Timestamp) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) if at < last => {
                log::warn!(
                    "motion gate clock went backwards ({:.3} < {:.3}); holding cooldown",
                    at,
                    last
                );
                false
            }
            Some(last) => at - last > self.cooldown.as_secs_f64(),
        }
    }

    pub fn last_attempt(&self) -> Option<Timestamp> {
        self.last_attempt
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }
}
