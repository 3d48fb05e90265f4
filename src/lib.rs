//! PurrView feeding-session tracker
//!
//! This crate turns a continuous camera feed into discrete feeding sessions
//! per tracked cat.
//!
//! # Architecture
//!
//! ```text
//! capture -> motion gate -> classification port -> session tracker -> sinks
//!                                                        ^
//!                                                  idle sweeper
//! ```
//!
//! 1. **Motion gate**: cheap frame differencing plus a cooldown decides when a
//!    frame is worth an expensive classification call.
//! 2. **Classification port**: opaque, slow, fallible. Produces `Observation`s.
//! 3. **Session tracker**: per-entity state machine, at most one open session
//!    per entity, emitting `CompletedSession`s.
//! 4. **Idle sweeper**: closes sessions whose entity has not been seen within
//!    the idle timeout, even if the feed stalls.
//! 5. **Sinks**: persistence (idempotent) and notification (best-effort).
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: decoded frames and capture sources
//! - `motion`: motion scoring and the cooldown gate
//! - `classify`: classification port, backends and deadline dispatch
//! - `tracker`, `sweeper`: the session state machine and its idle driver
//! - `sink`: persistence and notification
//! - `replay`: offline re-execution over a captured archive
//! - `pipeline`: the live frame loop
//! - Core types (this file): Activity, Observation, Session

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod classify;
pub mod config;
pub mod digest;
pub mod frame;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod replay;
pub mod sink;
pub mod sweeper;
pub mod tracker;
pub mod ui;

pub use classify::{
    ClassificationResult, ClassifiedEntity, ClassifyDispatcher, ClassifyOutcome, Classifier,
    ClassifyRequest, LabelFileClassifier, ScriptedClassifier,
};
pub use frame::{Frame, LatestFrameSlot};
pub use ingest::{FfmpegSource, FrameSource, ReconnectingSource, StubSource};
pub use motion::{FrameDiffScorer, GateDecision, MotionGate, MotionScorer, Roi};
pub use sink::{InMemorySessionStore, LogNotifier, Notifier, SessionStore, SinkWorker, SqliteSessionStore};
pub use sweeper::IdleSweeper;
pub use tracker::{OutOfOrderTimestamp, SessionTracker, TrackerOptions};

// -------------------- Time --------------------

/// Seconds since the Unix epoch (fractional).
///
/// Capture timestamps, observation timestamps and idle-check instants all share
/// this scale so the tracker can compare them directly.
pub type Timestamp = f64;

pub fn now_s() -> Result<Timestamp> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}

// -------------------- Activities --------------------

/// Closed set of activity labels the classification port may report.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Eating,
    Drinking,
    /// Merely present near the bowls. Can keep a session alive, never start one.
    Present,
}

impl Activity {
    /// Engaged activities open and continue sessions.
    pub fn is_engaged(self) -> bool {
        matches!(self, Activity::Eating | Activity::Drinking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Eating => "eating",
            Activity::Drinking => "drinking",
            Activity::Present => "present",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "eating" => Ok(Activity::Eating),
            "drinking" => Ok(Activity::Drinking),
            "present" => Ok(Activity::Present),
            other => Err(anyhow!("unknown activity label '{}'", other)),
        }
    }
}

// -------------------- Entity ID Discipline --------------------

/// Validate and normalize an entity id (a cat's name).
///
/// Names may use any script, so the check is on letters/digits rather than ASCII.
pub fn validate_entity_id(entity: &str) -> Result<String> {
    static ENTITY_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENTITY_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[\p{L}\p{N}_ -]{1,64}$").expect("static entity id regex")
    });
    let trimmed = entity.trim();
    if !re.is_match(trimmed) {
        return Err(anyhow!(
            "entity id must be 1-64 letters, digits, '_', '-' or spaces (got '{}')",
            entity
        ));
    }
    Ok(trimmed.to_string())
}

// -------------------- Observations --------------------

/// Reference to a frame that contributed to a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameRef {
    /// Archive filename or live frame label.
    pub reference: String,
    pub timestamp: Timestamp,
    /// Per-entity confidence reported by the classifier.
    pub confidence: f32,
}

impl FrameRef {
    pub fn new(reference: impl Into<String>, timestamp: Timestamp, confidence: f32) -> Self {
        Self {
            reference: reference.into(),
            timestamp,
            confidence,
        }
    }
}

/// One (entity, activity, metadata) triple within an observation.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityObservation {
    pub entity: String,
    pub activity: Activity,
    pub frame: FrameRef,
}

/// Result of one successful classification call.
///
/// Entities absent from `entities` are not evidence of departure.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub timestamp: Timestamp,
    pub entities: Vec<EntityObservation>,
}

impl Observation {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            entities: Vec::new(),
        }
    }

    /// Builder-style helper: add an entity seen in `reference` at this observation's time.
    pub fn with(mut self, entity: &str, activity: Activity, reference: &str) -> Self {
        self.entities.push(EntityObservation {
            entity: entity.to_string(),
            activity,
            frame: FrameRef::new(reference, self.timestamp, 1.0),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// -------------------- Sessions --------------------

/// A bounded interval of engaged activity for one entity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub entity: String,
    /// Always an engaged activity.
    pub activity: Activity,
    pub started_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub frames: Vec<FrameRef>,
}

impl Session {
    pub(crate) fn open(entity: &str, activity: Activity, at: Timestamp, frame: FrameRef) -> Self {
        Self {
            entity: entity.to_string(),
            activity,
            started_at: at,
            last_seen_at: at,
            frames: vec![frame],
        }
    }

    /// Stable identifier: the same session always hashes to the same id,
    /// which is what makes persistence idempotent.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"purrview:session:v1");
        hasher.update(self.entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.activity.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:.3}", self.started_at).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn duration_secs(&self) -> f64 {
        self.last_seen_at - self.started_at
    }
}

/// Why a session was closed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Entity not re-observed within the idle timeout.
    IdleTimeout,
    /// Same entity observed with a different engaged activity.
    ActivityChanged,
    /// End of a replay run or daemon shutdown.
    Flushed,
}

impl EndReason {
    pub fn tag(self) -> &'static str {
        match self {
            EndReason::IdleTimeout => "END",
            EndReason::ActivityChanged => "SWITCH",
            EndReason::Flushed => "FLUSH",
        }
    }
}

/// An immutable, closed session handed to the sinks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompletedSession {
    pub session: Session,
    pub reason: EndReason,
    pub closed_at: Timestamp,
}

impl CompletedSession {
    pub fn id(&self) -> String {
        self.session.id()
    }

    /// One-line human summary, e.g. `[END] Mochi eating (120s, 3 frames)`.
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} {} ({:.0}s, {} frames)",
            self.reason.tag(),
            self.session.entity,
            self.session.activity,
            self.session.duration_secs(),
            self.session.frames.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_parsing_is_case_insensitive() {
        assert_eq!("Eating".parse::<Activity>().unwrap(), Activity::Eating);
        assert_eq!(" drinking ".parse::<Activity>().unwrap(), Activity::Drinking);
        assert_eq!("PRESENT".parse::<Activity>().unwrap(), Activity::Present);
        assert!("sleeping".parse::<Activity>().is_err());
    }

    #[test]
    fn only_eating_and_drinking_are_engaged() {
        assert!(Activity::Eating.is_engaged());
        assert!(Activity::Drinking.is_engaged());
        assert!(!Activity::Present.is_engaged());
    }

    #[test]
    fn entity_ids_accept_non_ascii_names() {
        assert_eq!(validate_entity_id(" 大吉 ").unwrap(), "大吉");
        assert_eq!(validate_entity_id("Mochi-2").unwrap(), "Mochi-2");
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("   ").is_err());
        assert!(validate_entity_id("bad/name").is_err());
        assert!(validate_entity_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn session_id_is_stable_and_distinguishes_start() {
        let frame = FrameRef::new("a.jpg", 100.0, 0.9);
        let a = Session::open("Mochi", Activity::Eating, 100.0, frame.clone());
        let mut b = a.clone();
        b.last_seen_at = 180.0;
        b.frames.push(FrameRef::new("b.jpg", 180.0, 0.8));
        assert_eq!(a.id(), b.id());

        let c = Session::open("Mochi", Activity::Eating, 101.0, frame);
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 64);
    }

    #[test]
    fn completed_summary_mentions_reason_and_frames() {
        let mut session = Session::open("松花", Activity::Eating, 1000.0, FrameRef::new("a", 1000.0, 1.0));
        session.last_seen_at = 1120.0;
        session.frames.push(FrameRef::new("b", 1060.0, 1.0));
        let done = CompletedSession {
            session,
            reason: EndReason::IdleTimeout,
            closed_at: 1300.0,
        };
        assert_eq!(done.summary(), "[END] 松花 eating (120s, 2 frames)");
    }
}
