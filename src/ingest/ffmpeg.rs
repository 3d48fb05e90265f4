//! Stream capture through an `ffmpeg` subprocess.
//!
//! ffmpeg pulls the stream (RTMP, RTSP, file), decimates to one frame per
//! `frame_interval`, scales, and writes raw RGB24 to stdout. A reader thread
//! slices stdout into frames so `next_frame` can apply a stall timeout
//! without platform-specific pipe polling.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::{rgb_len, Frame};
use crate::now_s;

/// Abort a read if the stream produced nothing for this long.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for an ffmpeg-backed source.
#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    pub width: u32,
    pub height: u32,
    /// Seconds between extracted frames.
    pub frame_interval: Duration,
    pub ffmpeg_path: String,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_interval: Duration::from_secs(2),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegConfig {
    /// Stall timeout for steady-state reads.
    fn frame_timeout(&self) -> Duration {
        READ_TIMEOUT.max(self.frame_interval * 3)
    }

    /// The first frame also waits for connection setup and a keyframe.
    fn first_frame_timeout(&self) -> Duration {
        READ_TIMEOUT * 3
    }
}

pub struct FfmpegSource {
    url: String,
    config: FfmpegConfig,
    process: Option<Child>,
    frames: Option<Receiver<std::io::Result<Vec<u8>>>>,
    reader: Option<JoinHandle<()>>,
    got_first_frame: bool,
    frame_count: u64,
    connects: u64,
    failures: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl FfmpegSource {
    pub fn new(url: &str, config: FfmpegConfig) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(anyhow!("stream url must not be empty"));
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("capture size must be non-zero"));
        }
        Ok(Self {
            url: url.to_string(),
            config,
            process: None,
            frames: None,
            reader: None,
            got_first_frame: false,
            frame_count: 0,
            connects: 0,
            failures: 0,
            last_frame_at: None,
            last_error: None,
        })
    }

    fn command(&self) -> Command {
        let interval = self.config.frame_interval.as_secs_f64().max(0.001);
        let vf = format!(
            "fps=1/{},scale={}:{}",
            interval, self.config.width, self.config.height
        );
        let rw_timeout_us = READ_TIMEOUT.as_micros().to_string();
        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(["-rw_timeout", &rw_timeout_us])
            .args(["-i", &self.url])
            .arg("-an")
            .args(["-vf", &vf])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-loglevel", "error"])
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    fn fail(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.failures += 1;
        self.last_error = Some(format!("{:#}", error));
        self.disconnect();
        error
    }
}

impl FrameSource for FfmpegSource {
    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("spawn {} for {}", self.config.ffmpeg_path, self.url))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        let frame_len = rgb_len(self.config.width, self.config.height);
        let (tx, rx) = mpsc::sync_channel(2);
        let reader = std::thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || loop {
                let mut buf = vec![0u8; frame_len];
                let result = stdout.read_exact(&mut buf).map(|_| buf);
                let stop = result.is_err();
                if tx.send(result).is_err() || stop {
                    break;
                }
            })
            .context("spawn ffmpeg reader thread")?;

        self.process = Some(child);
        self.frames = Some(rx);
        self.reader = Some(reader);
        self.got_first_frame = false;
        self.connects += 1;
        self.last_error = None;
        log::info!(
            "FfmpegSource: reading {} at {}x{}, one frame per {:?}",
            self.url,
            self.config.width,
            self.config.height,
            self.config.frame_interval
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let timeout = if self.got_first_frame {
            self.config.frame_timeout()
        } else {
            self.config.first_frame_timeout()
        };
        let received = match &self.frames {
            Some(frames) => frames.recv_timeout(timeout),
            None => return Err(anyhow!("ffmpeg source not connected; call connect() first")),
        };
        let pixels = match received {
            Ok(Ok(pixels)) => pixels,
            Ok(Err(e)) => return Err(self.fail(anyhow!("stream ended: {}", e))),
            Err(RecvTimeoutError::Timeout) => {
                return Err(self.fail(anyhow!("stream stalled: no data for {:?}", timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(self.fail(anyhow!("ffmpeg reader exited")))
            }
        };

        self.got_first_frame = true;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            now_s()?,
            self.frame_count,
        )
    }

    fn disconnect(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        // Killing ffmpeg closes stdout, which ends the reader thread.
        self.frames = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.process.is_none() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= self.config.frame_timeout(),
            None => true,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            connects: self.connects,
            failures: self.failures,
            source: self.url.clone(),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}
