use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::FfmpegConfig;
use crate::motion::{FrameDiffScorer, MotionGate, Roi, DEFAULT_PIXEL_DELTA};
use crate::tracker::TrackerOptions;

const DEFAULT_STREAM_URL: &str = "stub://bowl_camera";
const DEFAULT_FRAME_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_MOTION_THRESHOLD: u64 = 500;
const DEFAULT_COOLDOWN_SECS: f64 = 30.0;
const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 120.0;
const DEFAULT_SWEEP_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_CLASSIFY_DEADLINE_SECS: f64 = 60.0;
const DEFAULT_DB_PATH: &str = "purrview.db";
const DEFAULT_RETENTION_DAYS: u64 = 14;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PurrviewConfigFile {
    db_path: Option<String>,
    webhook_url: Option<String>,
    retention_days: Option<u64>,
    stream: Option<StreamConfigFile>,
    motion: Option<MotionConfigFile>,
    tracker: Option<TrackerConfigFile>,
    classifier: Option<ClassifierConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    frame_interval_secs: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    ffmpeg_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MotionConfigFile {
    threshold: Option<u64>,
    cooldown_secs: Option<f64>,
    pixel_delta: Option<u8>,
    /// `[x1, y1, x2, y2]`
    roi: Option<[u32; 4]>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackerConfigFile {
    idle_timeout_secs: Option<f64>,
    sweep_interval_secs: Option<f64>,
    log_passive_frames: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClassifierConfigFile {
    url: Option<String>,
    api_key: Option<String>,
    deadline_secs: Option<f64>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct PurrviewConfig {
    pub db_path: String,
    pub webhook_url: Option<String>,
    pub retention: Duration,
    pub stream: StreamSettings,
    pub motion: MotionSettings,
    pub tracker: TrackerSettings,
    pub classifier: ClassifierSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    /// Changed-pixel count a frame must exceed.
    pub threshold: u64,
    pub cooldown: Duration,
    pub pixel_delta: u8,
    pub roi: Option<[u32; 4]>,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub log_passive_frames: bool,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub deadline: Duration,
    pub min_confidence: f32,
}

impl PurrviewConfig {
    /// Load from `PURRVIEW_CONFIG` (if set), apply `PURRVIEW_*` overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PURRVIEW_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PurrviewConfigFile) -> Result<Self> {
        let stream = file.stream.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let classifier = file.classifier.unwrap_or_default();
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            webhook_url: file.webhook_url.filter(|url| !url.trim().is_empty()),
            retention: days(file.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS)),
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                frame_interval: secs(
                    "stream.frame_interval_secs",
                    stream.frame_interval_secs.unwrap_or(DEFAULT_FRAME_INTERVAL_SECS),
                )?,
                width: stream.width.unwrap_or(DEFAULT_WIDTH),
                height: stream.height.unwrap_or(DEFAULT_HEIGHT),
                ffmpeg_path: stream.ffmpeg_path.unwrap_or_else(|| "ffmpeg".to_string()),
            },
            motion: MotionSettings {
                threshold: motion.threshold.unwrap_or(DEFAULT_MOTION_THRESHOLD),
                cooldown: secs(
                    "motion.cooldown_secs",
                    motion.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                )?,
                pixel_delta: motion.pixel_delta.unwrap_or(DEFAULT_PIXEL_DELTA),
                roi: motion.roi,
            },
            tracker: TrackerSettings {
                idle_timeout: secs(
                    "tracker.idle_timeout_secs",
                    tracker.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
                )?,
                sweep_interval: secs(
                    "tracker.sweep_interval_secs",
                    tracker.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
                )?,
                log_passive_frames: tracker.log_passive_frames.unwrap_or(false),
            },
            classifier: ClassifierSettings {
                url: classifier.url.filter(|url| !url.trim().is_empty()),
                api_key: classifier.api_key.filter(|key| !key.trim().is_empty()),
                deadline: secs(
                    "classifier.deadline_secs",
                    classifier.deadline_secs.unwrap_or(DEFAULT_CLASSIFY_DEADLINE_SECS),
                )?,
                min_confidence: classifier.min_confidence.unwrap_or(0.0),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("PURRVIEW_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(v) = env_parse::<f64>("PURRVIEW_FRAME_INTERVAL_SECS")? {
            self.stream.frame_interval = secs("PURRVIEW_FRAME_INTERVAL_SECS", v)?;
        }
        if let Some(v) = env_parse::<u64>("PURRVIEW_MOTION_THRESHOLD")? {
            self.motion.threshold = v;
        }
        if let Some(v) = env_parse::<f64>("PURRVIEW_MOTION_COOLDOWN_SECS")? {
            self.motion.cooldown = secs("PURRVIEW_MOTION_COOLDOWN_SECS", v)?;
        }
        if let Some(v) = env_parse::<f64>("PURRVIEW_IDLE_TIMEOUT_SECS")? {
            self.tracker.idle_timeout = secs("PURRVIEW_IDLE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = env_parse::<f64>("PURRVIEW_SWEEP_INTERVAL_SECS")? {
            self.tracker.sweep_interval = secs("PURRVIEW_SWEEP_INTERVAL_SECS", v)?;
        }
        if let Some(v) = env_parse::<f64>("PURRVIEW_CLASSIFY_DEADLINE_SECS")? {
            self.classifier.deadline = secs("PURRVIEW_CLASSIFY_DEADLINE_SECS", v)?;
        }
        if let Some(url) = env_string("PURRVIEW_CLASSIFIER_URL") {
            self.classifier.url = Some(url);
        }
        if let Some(key) = env_string("PURRVIEW_CLASSIFIER_API_KEY") {
            self.classifier.api_key = Some(key);
        }
        if let Some(path) = env_string("PURRVIEW_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = env_string("PURRVIEW_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
        if let Some(v) = env_parse::<u64>("PURRVIEW_RETENTION_DAYS")? {
            self.retention = days(v);
        }
        if let Some(v) = env_parse::<f32>("PURRVIEW_MIN_CONFIDENCE")? {
            self.classifier.min_confidence = v;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let positive = [
            ("frame interval", self.stream.frame_interval),
            ("motion cooldown", self.motion.cooldown),
            ("idle timeout", self.tracker.idle_timeout),
            ("sweep interval", self.tracker.sweep_interval),
            ("classify deadline", self.classifier.deadline),
            ("retention", self.retention),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.tracker.sweep_interval >= self.tracker.idle_timeout {
            bail!(
                "sweep interval ({:?}) must be shorter than the idle timeout ({:?})",
                self.tracker.sweep_interval,
                self.tracker.idle_timeout
            );
        }
        if !(0.0..=1.0).contains(&self.classifier.min_confidence) {
            bail!("min_confidence must be within 0..=1");
        }
        if self.stream.url.trim().is_empty() {
            bail!("stream url must not be empty");
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            bail!("stream width and height must be non-zero");
        }
        if let Some([x1, y1, x2, y2]) = self.motion.roi {
            Roi::new(x1, y1, x2, y2)?;
        }
        Ok(())
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            idle_timeout: self.tracker.idle_timeout,
            log_passive_frames: self.tracker.log_passive_frames,
        }
    }

    pub fn ffmpeg_config(&self) -> FfmpegConfig {
        FfmpegConfig {
            width: self.stream.width,
            height: self.stream.height,
            frame_interval: self.stream.frame_interval,
            ffmpeg_path: self.stream.ffmpeg_path.clone(),
        }
    }

    pub fn motion_gate(&self) -> MotionGate {
        MotionGate::new(self.motion.threshold, self.motion.cooldown)
    }

    pub fn motion_scorer(&self) -> Result<FrameDiffScorer> {
        let scorer = FrameDiffScorer::new(self.motion.pixel_delta);
        Ok(match self.motion.roi {
            Some([x1, y1, x2, y2]) => scorer.with_roi(Roi::new(x1, y1, x2, y2)?),
            None => scorer,
        })
    }
}

fn secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds, got {}", name, value))
}

fn days(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(24 * 60 * 60))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", name, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<PurrviewConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
