//! Offline replay over a captured frame archive.
//!
//! An archive is a directory of frame images plus a `gallery_meta.jsonl`
//! index, one line per captured frame:
//!
//! ```text
//! {"timestamp": "2026-02-10T12:00:04+00:00", "filename": "12-00-04.jpg", "motion_score": 18230}
//! ```
//!
//! Replay re-runs motion gate -> classifier -> tracker on archive timestamps
//! instead of the wall clock: the idle sweep is driven by each frame's
//! timestamp before that frame is considered, and the cooldown is measured
//! between frame timestamps. Sessions still open at the end are flushed.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::{Classifier, ClassifyRequest, FrameImage};
use crate::motion::{GateReason, MotionGate};
use crate::sweeper::IdleSweeper;
use crate::tracker::{SessionTracker, TrackerOptions};
use crate::{CompletedSession, Timestamp};

pub const ARCHIVE_INDEX: &str = "gallery_meta.jsonl";
pub const DEFAULT_ARCHIVE_THRESHOLD: u64 = 5000;

// -------------------- Archive --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveRecord {
    pub timestamp: Timestamp,
    pub filename: String,
    pub motion_score: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(f64),
    Text(String),
}

#[derive(Deserialize)]
struct RawRecord {
    timestamp: RawTimestamp,
    filename: String,
    #[serde(default)]
    motion_score: f64,
}

/// Parse an archive timestamp: unix seconds, RFC 3339, or a naive ISO
/// datetime (taken as UTC).
pub fn parse_timestamp(text: &str) -> Result<Timestamp> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_micros() as f64 / 1e6);
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|_| anyhow!("unrecognised timestamp '{}'", text))?;
    Ok(naive.and_utc().timestamp_micros() as f64 / 1e6)
}

/// Read an archive index, keep frames whose motion score is strictly above
/// `threshold`, sort by timestamp, and apply `limit`.
pub fn parse_archive(
    reader: impl BufRead,
    threshold: u64,
    limit: Option<usize>,
) -> Result<Vec<ArchiveRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawRecord =
            serde_json::from_str(&line).map_err(|e| anyhow!("line {}: {}", idx + 1, e))?;
        let timestamp = match raw.timestamp {
            RawTimestamp::Seconds(s) => s,
            RawTimestamp::Text(t) => {
                parse_timestamp(&t).with_context(|| format!("line {}", idx + 1))?
            }
        };
        let motion_score = raw.motion_score.max(0.0) as u64;
        if motion_score > threshold {
            records.push(ArchiveRecord {
                timestamp,
                filename: raw.filename,
                motion_score,
            });
        }
    }
    records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    if let Some(limit) = limit.filter(|l| *l > 0) {
        records.truncate(limit);
    }
    Ok(records)
}

pub fn load_archive(dir: &Path, threshold: u64, limit: Option<usize>) -> Result<Vec<ArchiveRecord>> {
    let index = dir.join(ARCHIVE_INDEX);
    let file = std::fs::File::open(&index)
        .with_context(|| format!("open archive index {}", index.display()))?;
    parse_archive(std::io::BufReader::new(file), threshold, limit)
        .with_context(|| format!("parse archive index {}", index.display()))
}

// -------------------- Harness --------------------

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub threshold: u64,
    pub cooldown: Duration,
    pub idle_timeout: Duration,
    pub limit: Option<usize>,
    pub min_confidence: f32,
    pub log_passive_frames: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ARCHIVE_THRESHOLD,
            cooldown: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            limit: None,
            min_confidence: 0.0,
            log_passive_frames: false,
        }
    }
}

/// What happened to one archive frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    /// Image file missing from the archive directory.
    Missing,
    CooledDown,
    Classified { entities: String },
    Failed { error: String },
}

/// Hooks for progress output and sinks. All methods default to no-ops.
pub trait ReplayListener {
    fn on_frame(&mut self, _index: usize, _total: usize, _record: &ArchiveRecord, _outcome: &FrameOutcome) {}

    fn on_session(&mut self, _completed: &CompletedSession) {}
}

impl ReplayListener for () {}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplayReport {
    pub frames: usize,
    pub sessions: Vec<CompletedSession>,
    pub calls: u64,
    pub errors: u64,
    pub skipped: u64,
    pub cooled_down: u64,
}

impl ReplayReport {
    /// Per-session table rows as printed by the CLI.
    pub fn table(&self) -> String {
        let mut out = format!("{:<10} {:<10} {:>8} {:>7}  {}\n", "Entity", "Activity", "Duration", "Frames", "End");
        out.push_str(&"-".repeat(46));
        out.push('\n');
        for completed in &self.sessions {
            let s = &completed.session;
            out.push_str(&format!(
                "{:<10} {:<10} {:>7.0}s {:>7}  {}\n",
                s.entity,
                s.activity.as_str(),
                s.duration_secs(),
                s.frames.len(),
                completed.reason.tag()
            ));
        }
        out
    }
}

pub struct ReplayHarness<C: Classifier> {
    options: ReplayOptions,
    classifier: C,
    frames_dir: PathBuf,
}

impl<C: Classifier> ReplayHarness<C> {
    pub fn new(options: ReplayOptions, classifier: C, frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            options,
            classifier,
            frames_dir: frames_dir.into(),
        }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    /// Load the archive index from `frames_dir` and replay it.
    pub fn run_archive(&mut self, listener: &mut dyn ReplayListener) -> Result<ReplayReport> {
        let records = load_archive(&self.frames_dir, self.options.threshold, self.options.limit)?;
        log::info!(
            "replay: {} motion frame(s) from {}",
            records.len(),
            self.frames_dir.display()
        );
        self.run(&records, listener)
    }

    /// Replay `records`, which must already be sorted by timestamp.
    pub fn run(
        &mut self,
        records: &[ArchiveRecord],
        listener: &mut dyn ReplayListener,
    ) -> Result<ReplayReport> {
        let mut tracker = SessionTracker::new(TrackerOptions {
            idle_timeout: self.options.idle_timeout,
            log_passive_frames: self.options.log_passive_frames,
        });
        // Replay sweeps on every frame; the cadence interval is irrelevant.
        let mut sweeper = IdleSweeper::new(Duration::ZERO);
        let mut gate = MotionGate::new(self.options.threshold, self.options.cooldown);
        let mut report = ReplayReport {
            frames: records.len(),
            ..ReplayReport::default()
        };

        for (index, record) in records.iter().enumerate() {
            let path = self.frames_dir.join(&record.filename);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.skipped += 1;
                    listener.on_frame(index, records.len(), record, &FrameOutcome::Missing);
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
            };

            let closed = sweeper
                .sweep(&mut tracker, record.timestamp)
                .map_err(|e| anyhow!("archive not sorted: {}", e))?;
            emit(&mut report, listener, closed);

            let decision = gate.admit(record.motion_score, record.timestamp);
            if !decision.should_classify {
                if decision.reason == GateReason::CoolingDown {
                    report.cooled_down += 1;
                }
                listener.on_frame(index, records.len(), record, &FrameOutcome::CooledDown);
                continue;
            }

            let request = ClassifyRequest {
                reference: record.filename.clone(),
                captured_at: record.timestamp,
                image: FrameImage::Jpeg(bytes),
            };
            report.calls += 1;
            match self.classifier.classify(&request) {
                Ok(result) => {
                    let outcome = FrameOutcome::Classified {
                        entities: result.describe(),
                    };
                    listener.on_frame(index, records.len(), record, &outcome);
                    let observation = result.to_observation(
                        &record.filename,
                        record.timestamp,
                        self.options.min_confidence,
                    );
                    let closed = tracker
                        .on_observation(&observation)
                        .map_err(|e| anyhow!("archive not sorted: {}", e))?;
                    emit(&mut report, listener, closed);
                }
                Err(e) => {
                    report.errors += 1;
                    log::warn!("replay: classify {} failed: {:#}", record.filename, e);
                    let outcome = FrameOutcome::Failed {
                        error: format!("{:#}", e),
                    };
                    listener.on_frame(index, records.len(), record, &outcome);
                }
            }
        }

        emit(&mut report, listener, tracker.drain());
        log::info!(
            "replay: {} session(s), {} call(s), {} error(s), {} skipped, {} cooled down",
            report.sessions.len(),
            report.calls,
            report.errors,
            report.skipped,
            report.cooled_down
        );
        Ok(report)
    }
}

fn emit(report: &mut ReplayReport, listener: &mut dyn ReplayListener, closed: Vec<CompletedSession>) {
    for completed in closed {
        listener.on_session(&completed);
        report.sessions.push(completed);
    }
}
