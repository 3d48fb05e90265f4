// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{FrameSource, SourceStats};
use crate::frame::{rgb_len, Frame};
use crate::now_s;

#[derive(Clone, Debug)]
pub struct StubConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Frames between scene changes (a "cat" square appears/moves).
    pub scene_period: u64,
    /// Fail every Nth frame to exercise reconnects (0 = never).
    pub fail_every: u64,
    /// Pacing between frames, like a real stream (zero = as fast as asked).
    pub frame_interval: Duration,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            name: "stub://bowl_camera".to_string(),
            width: 160,
            height: 120,
            scene_period: 10,
            fail_every: 0,
            frame_interval: Duration::ZERO,
        }
    }
}

/// Synthetic scene: a static background with a bright square that moves
/// every `scene_period` frames, which the frame-diff scorer sees as motion.
pub struct StubSource {
    config: StubConfig,
    frame_count: u64,
    connected: bool,
    connects: u64,
    failures: u64,
}

impl StubSource {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connected: false,
            connects: 0,
            failures: 0,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![40u8; rgb_len(self.config.width, self.config.height)];
        let period = self.config.scene_period.max(1);
        let scene = (self.frame_count / period) as usize;
        if scene % 2 == 1 {
            let side = (w.min(h) / 4).max(1);
            let x0 = (scene * 7) % (w - side + 1);
            let y0 = (scene * 3) % (h - side + 1);
            for y in y0..y0 + side {
                for x in x0..x0 + side {
                    let i = (y * w + x) * 3;
                    pixels[i..i + 3].copy_from_slice(&[230, 180, 120]);
                }
            }
        }
        pixels
    }
}

impl FrameSource for StubSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.connects += 1;
        log::info!("StubSource: connected to {} (synthetic)", self.config.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("stub source not connected; call connect() first"));
        }
        if !self.config.frame_interval.is_zero() {
            std::thread::sleep(self.config.frame_interval);
        }
        self.frame_count += 1;
        if self.config.fail_every > 0 && self.frame_count % self.config.fail_every == 0 {
            self.connected = false;
            self.failures += 1;
            return Err(anyhow!("synthetic stream dropped at frame {}", self.frame_count));
        }
        Frame::new(
            self.generate_pixels(),
            self.config.width,
            self.config.height,
            now_s()?,
            self.frame_count,
        )
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count - self.failures,
            connects: self.connects,
            failures: self.failures,
            source: self.config.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{FrameDiffScorer, MotionScorer};

    #[test]
    fn requires_connect() {
        let mut source = StubSource::new(StubConfig::default());
        assert!(source.next_frame().is_err());
        source.connect().unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.width, frame.height), (160, 120));
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn scene_changes_produce_motion() {
        let mut source = StubSource::new(StubConfig {
            scene_period: 2,
            ..StubConfig::default()
        });
        source.connect().unwrap();
        let mut scorer = FrameDiffScorer::default();
        let scores: Vec<u64> = (0..6)
            .map(|_| scorer.score(&source.next_frame().unwrap()).unwrap())
            .collect();
        assert!(scores.iter().any(|s| *s > 0));
        assert!(scores.iter().any(|s| *s == 0));
    }

    #[test]
    fn injected_failures_disconnect() {
        let mut source = StubSource::new(StubConfig {
            fail_every: 2,
            ..StubConfig::default()
        });
        source.connect().unwrap();
        assert!(source.next_frame().is_ok());
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert_eq!(source.stats().failures, 1);
    }
}
