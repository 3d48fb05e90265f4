//! Per-entity feeding session state machine.
//!
//! Each entity is either IDLE (absent from the open map) or IN_SESSION (present
//! with its open `Session`). Two entry points mutate the map:
//!
//! - `on_observation`: applies one classification result
//! - `check_idle`: closes sessions whose entity has gone quiet
//!
//! Both must be fed in nondecreasing timestamp order. A timestamp older than
//! the tracker's watermark is rejected with `OutOfOrderTimestamp` and leaves
//! the state untouched; silently reordering could invent or hide boundaries.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{Activity, CompletedSession, EndReason, EntityObservation, Observation, Session, Timestamp};

/// Tracker tuning.
#[derive(Clone, Debug)]
pub struct TrackerOptions {
    /// Maximum gap between observations before an open session is closed.
    pub idle_timeout: Duration,
    /// Also append the frame of a passive observation to an open session.
    pub log_passive_frames: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            log_passive_frames: false,
        }
    }
}

/// A timestamp arrived that is older than one already applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutOfOrderTimestamp {
    pub operation: &'static str,
    pub timestamp: Timestamp,
    pub watermark: Timestamp,
}

impl std::fmt::Display for OutOfOrderTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at t={:.3} is older than already-applied t={:.3}",
            self.operation, self.timestamp, self.watermark
        )
    }
}

impl std::error::Error for OutOfOrderTimestamp {}

/// Owner of the open-session map.
pub struct SessionTracker {
    options: TrackerOptions,
    open: BTreeMap<String, Session>,
    watermark: Option<Timestamp>,
}

impl SessionTracker {
    pub fn new(options: TrackerOptions) -> Self {
        Self {
            options,
            open: BTreeMap::new(),
            watermark: None,
        }
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self::new(TrackerOptions {
            idle_timeout,
            ..TrackerOptions::default()
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    /// Apply one classification result. Returns sessions closed by activity changes.
    ///
    /// Entities within one observation are processed independently and in order.
    pub fn on_observation(
        &mut self,
        observation: &Observation,
    ) -> Result<Vec<CompletedSession>, OutOfOrderTimestamp> {
        self.advance("observation", observation.timestamp)?;

        let mut completed = Vec::new();
        for entry in &observation.entities {
            if let Some(done) = self.apply(observation.timestamp, entry) {
                completed.push(done);
            }
        }
        Ok(completed)
    }

    /// Close every session whose entity has not been seen for longer than the idle timeout.
    pub fn check_idle(
        &mut self,
        now: Timestamp,
    ) -> Result<Vec<CompletedSession>, OutOfOrderTimestamp> {
        self.advance("idle check", now)?;

        let timeout = self.options.idle_timeout.as_secs_f64();
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, session)| now - session.last_seen_at > timeout)
            .map(|(entity, _)| entity.clone())
            .collect();

        let mut completed = Vec::with_capacity(expired.len());
        for entity in expired {
            if let Some(session) = self.open.remove(&entity) {
                log::info!(
                    "session closed (idle): {} {} {:.0}s, {} frames",
                    session.entity,
                    session.activity,
                    session.duration_secs(),
                    session.frames.len()
                );
                completed.push(CompletedSession {
                    session,
                    reason: EndReason::IdleTimeout,
                    closed_at: now,
                });
            }
        }
        Ok(completed)
    }

    /// Close every open session regardless of age (end of replay, shutdown).
    pub fn drain(&mut self) -> Vec<CompletedSession> {
        let open = std::mem::take(&mut self.open);
        let watermark = self.watermark;
        open.into_values()
            .map(|session| {
                let closed_at = watermark.unwrap_or(session.last_seen_at);
                CompletedSession {
                    session,
                    reason: EndReason::Flushed,
                    closed_at,
                }
            })
            .collect()
    }

    pub fn session(&self, entity: &str) -> Option<&Session> {
        self.open.get(entity)
    }

    pub fn open_sessions(&self) -> impl Iterator<Item = &Session> {
        self.open.values()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Latest timestamp applied so far.
    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    fn advance(&mut self, operation: &'static str, at: Timestamp) -> Result<(), OutOfOrderTimestamp> {
        if let Some(watermark) = self.watermark {
            if at < watermark {
                return Err(OutOfOrderTimestamp {
                    operation,
                    timestamp: at,
                    watermark,
                });
            }
        }
        self.watermark = Some(at);
        Ok(())
    }

    fn apply(&mut self, at: Timestamp, entry: &EntityObservation) -> Option<CompletedSession> {
        if entry.activity.is_engaged() {
            self.apply_engaged(at, entry)
        } else {
            self.apply_passive(at, entry);
            None
        }
    }

    fn apply_engaged(&mut self, at: Timestamp, entry: &EntityObservation) -> Option<CompletedSession> {
        let fresh = || Session::open(&entry.entity, entry.activity, at, entry.frame.clone());

        match self.open.get_mut(&entry.entity) {
            None => {
                log::info!("session opened: {} {} at {:.0}", entry.entity, entry.activity, at);
                self.open.insert(entry.entity.clone(), fresh());
                None
            }
            Some(session) if session.activity == entry.activity => {
                session.last_seen_at = at;
                session.frames.push(entry.frame.clone());
                None
            }
            Some(session) => {
                // Swap in place: the entity never passes through IDLE.
                let previous = std::mem::replace(session, fresh());
                log::info!(
                    "session switched: {} {} -> {} at {:.0}",
                    entry.entity,
                    previous.activity,
                    entry.activity,
                    at
                );
                Some(CompletedSession {
                    session: previous,
                    reason: EndReason::ActivityChanged,
                    closed_at: at,
                })
            }
        }
    }

    fn apply_passive(&mut self, at: Timestamp, entry: &EntityObservation) {
        debug_assert_eq!(entry.activity, Activity::Present);
        if let Some(session) = self.open.get_mut(&entry.entity) {
            session.last_seen_at = at;
            if self.options.log_passive_frames {
                session.frames.push(entry.frame.clone());
            }
        }
    }
}
