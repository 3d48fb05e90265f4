//! Frame capture sources.
//!
//! This module provides sources of decoded frames:
//! - `stub://` synthetic scenes (testing, demos)
//! - anything `ffmpeg` can open (RTMP/RTSP streams, local files)
//!
//! Sources may fail or stall at any time. `ReconnectingSource` wraps a source
//! and keeps retrying with capped exponential backoff; `run_capture` drives it
//! on a dedicated thread and hands frames to the pipeline through a
//! `LatestFrameSlot`. A capture failure never stops the pipeline, so the idle
//! sweeper keeps running while the feed is down.

mod ffmpeg;
mod reconnect;
mod stub;

use anyhow::Result;

pub use ffmpeg::{FfmpegConfig, FfmpegSource};
pub use reconnect::{run_capture, Backoff, ReconnectingSource};
pub use stub::{StubConfig, StubSource};

use crate::frame::Frame;

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub connects: u64,
    pub failures: u64,
    pub source: String,
}

/// A source of decoded, timestamped frames.
pub trait FrameSource: Send {
    /// (Re)establish the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame or an error (disconnect, stall).
    fn next_frame(&mut self) -> Result<Frame>;

    /// Release the underlying stream.
    fn disconnect(&mut self) {}

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Open a source for `url`: `stub://...` is synthetic, everything else goes to ffmpeg.
pub fn open_source(url: &str, config: FfmpegConfig) -> Result<Box<dyn FrameSource>> {
    if url.starts_with("stub://") {
        Ok(Box::new(StubSource::new(StubConfig {
            name: url.to_string(),
            width: config.width,
            height: config.height,
            frame_interval: config.frame_interval,
            ..StubConfig::default()
        })))
    } else {
        Ok(Box::new(FfmpegSource::new(url, config)?))
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Frame> {
        (**self).next_frame()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}
