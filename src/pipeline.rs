//! Live frame loop.
//!
//! One thread owns the `SessionTracker`. Every loop turn it
//! 1. takes the latest captured frame (if any) and runs the motion gate,
//! 2. hands admitted frames to the `ClassifyDispatcher` (drop if busy),
//! 3. applies any finished classification as an observation,
//! 4. runs the idle sweeper on the wall clock,
//! 5. forwards completed sessions to the `SinkWorker`.
//!
//! Observations and sweeps reach the tracker in nondecreasing timestamp
//! order: while a call is in flight the sweep horizon is held at the
//! in-flight frame's timestamp, and frames are never stamped earlier than
//! the tracker's watermark.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::classify::{ClassifyDispatcher, ClassifyOutcome, ClassifyRequest};
use crate::frame::{Frame, LatestFrameSlot};
use crate::motion::{MotionGate, MotionScorer};
use crate::sink::{SinkStats, SinkWorker};
use crate::sweeper::IdleSweeper;
use crate::tracker::{SessionTracker, TrackerOptions};
use crate::{now_s, CompletedSession, Timestamp};

/// Upper bound on one wait for a frame, so classification outcomes are
/// picked up promptly even when the feed is slow.
const POLL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub tracker: TrackerOptions,
    pub sweep_interval: Duration,
    pub min_confidence: f32,
    pub health_interval: Duration,
    /// Delete stored sessions older than this, checked every `prune_interval`.
    pub retention: Option<Duration>,
    pub prune_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tracker: TrackerOptions::default(),
            sweep_interval: Duration::from_secs(10),
            min_confidence: 0.0,
            health_interval: Duration::from_secs(60),
            retention: None,
            prune_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub gated: u64,
    pub submitted: u64,
    /// Admitted frames dropped because a call was already in flight.
    pub busy_drops: u64,
    pub classified: u64,
    pub classify_failures: u64,
    pub timeouts: u64,
    pub sessions: u64,
    pub out_of_order: u64,
    pub scorer_errors: u64,
}

pub struct Pipeline {
    options: PipelineOptions,
    tracker: SessionTracker,
    sweeper: IdleSweeper,
    gate: MotionGate,
    scorer: Box<dyn MotionScorer>,
    dispatcher: ClassifyDispatcher,
    sinks: SinkWorker,
    stats: PipelineStats,
    last_health: Option<Timestamp>,
    last_prune: Option<Timestamp>,
}

impl Pipeline {
    pub fn new(
        options: PipelineOptions,
        gate: MotionGate,
        scorer: Box<dyn MotionScorer>,
        dispatcher: ClassifyDispatcher,
        sinks: SinkWorker,
    ) -> Self {
        Self {
            tracker: SessionTracker::new(options.tracker.clone()),
            sweeper: IdleSweeper::new(options.sweep_interval),
            options,
            gate,
            scorer,
            dispatcher,
            sinks,
            stats: PipelineStats::default(),
            last_health: None,
            last_prune: None,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Run until `shutdown` is set or the capture side closes the slot, then
    /// flush open sessions and stop the workers.
    pub fn run(mut self, slot: &LatestFrameSlot, shutdown: &AtomicBool) -> Result<(PipelineStats, SinkStats)> {
        log::info!(
            "pipeline: classifier={} idle_timeout={:?} sweep={:?}",
            self.dispatcher.backend_name(),
            self.tracker.idle_timeout(),
            self.options.sweep_interval
        );
        while !shutdown.load(Ordering::SeqCst) {
            let now = now_s()?;
            let wait = self.sweeper.time_until_due(now).min(POLL);
            let frame = slot.take_timeout(wait);
            if frame.is_none() && slot.is_closed() {
                log::warn!("pipeline: capture closed; stopping");
                break;
            }
            self.turn(frame, now_s()?);
        }
        self.finish()
    }

    /// One loop iteration at wall-clock `now`.
    pub fn turn(&mut self, frame: Option<Frame>, now: Timestamp) {
        if let Some(frame) = frame {
            self.on_frame(frame);
        }
        while let Some(outcome) = self.dispatcher.try_recv() {
            self.on_outcome(outcome);
        }
        self.sweep(now);
        self.housekeeping(now);
    }

    fn on_frame(&mut self, frame: Frame) {
        self.stats.frames += 1;
        if frame.resumed {
            log::debug!("capture resumed at frame {}; resetting motion baseline", frame.sequence);
            self.scorer.reset();
        }
        let decision = match self.gate.evaluate(self.scorer.as_mut(), &frame) {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.scorer_errors += 1;
                log::warn!("motion scoring failed for frame {}: {:#}", frame.sequence, e);
                return;
            }
        };
        if !decision.should_classify {
            return;
        }
        self.stats.gated += 1;

        let captured_at = frame.captured_at;
        let mut request = ClassifyRequest::from_frame(frame);
        if let Some(watermark) = self.tracker.watermark() {
            request.captured_at = request.captured_at.max(watermark);
        }
        let reference = request.reference.clone();
        if self.dispatcher.try_submit(request) {
            // Only a call actually made starts the cooldown.
            self.gate.record_attempt(captured_at);
            self.stats.submitted += 1;
            log::info!("motion score {} -> classifying {}", decision.score, reference);
        } else {
            self.stats.busy_drops += 1;
            log::warn!("classifier busy; dropped motion frame {}", reference);
        }
    }

    fn on_outcome(&mut self, outcome: ClassifyOutcome) {
        match outcome {
            ClassifyOutcome::Classified {
                reference,
                captured_at,
                result,
            } => {
                self.stats.classified += 1;
                log::info!("{} -> {}", reference, result.describe());
                let observation =
                    result.to_observation(&reference, captured_at, self.options.min_confidence);
                match self.tracker.on_observation(&observation) {
                    Ok(completed) => self.emit(completed),
                    Err(e) => {
                        self.stats.out_of_order += 1;
                        log::error!("dropping observation from {}: {}", reference, e);
                    }
                }
            }
            ClassifyOutcome::Failed {
                reference,
                error,
                timed_out,
                ..
            } => {
                self.stats.classify_failures += 1;
                if timed_out {
                    self.stats.timeouts += 1;
                }
                log::warn!("classification of {} failed: {}", reference, error);
            }
        }
    }

    fn sweep(&mut self, now: Timestamp) {
        let mut horizon = match self.dispatcher.in_flight_since() {
            Some(in_flight) => now.min(in_flight),
            None => now,
        };
        if let Some(watermark) = self.tracker.watermark() {
            horizon = horizon.max(watermark);
        }
        match self.sweeper.maybe_sweep(&mut self.tracker, horizon) {
            Ok(completed) => self.emit(completed),
            Err(e) => {
                self.stats.out_of_order += 1;
                log::error!("idle sweep rejected: {}", e);
            }
        }
    }

    fn housekeeping(&mut self, now: Timestamp) {
        if elapsed(self.last_health, now, self.options.health_interval) {
            self.last_health = Some(now);
            let sinks = self.sinks.stats();
            log::info!(
                "health: frames={} gated={} calls={} failures={} busy_drops={} open_sessions={} saved={} pending={}",
                self.stats.frames,
                self.stats.gated,
                self.stats.submitted,
                self.stats.classify_failures,
                self.stats.busy_drops,
                self.tracker.open_count(),
                sinks.saved,
                sinks.pending
            );
        }
        if let Some(retention) = self.options.retention {
            if elapsed(self.last_prune, now, self.options.prune_interval) {
                self.last_prune = Some(now);
                if let Err(e) = self.sinks.prune_older_than(now - retention.as_secs_f64()) {
                    log::warn!("retention prune not scheduled: {:#}", e);
                }
            }
        }
    }

    fn emit(&mut self, completed: Vec<CompletedSession>) {
        for session in completed {
            self.stats.sessions += 1;
            log::info!("{}", session.summary());
            if let Err(e) = self.sinks.submit(session) {
                log::error!("sink worker unavailable: {:#}", e);
            }
        }
    }

    /// Wait for an in-flight call, flush open sessions, stop workers.
    pub fn finish(mut self) -> Result<(PipelineStats, SinkStats)> {
        if self.dispatcher.is_busy() {
            log::info!("pipeline: waiting for in-flight classification");
            // The dispatcher enforces its own deadline, so this returns.
            if let Some(outcome) = self.dispatcher.recv_timeout(Duration::from_secs(24 * 3600)) {
                self.on_outcome(outcome);
            }
        }
        let flushed = self.tracker.drain();
        if !flushed.is_empty() {
            log::info!("pipeline: flushing {} open session(s)", flushed.len());
        }
        self.emit(flushed);

        let Pipeline {
            dispatcher,
            sinks,
            stats,
            ..
        } = self;
        dispatcher.shutdown()?;
        let sink_stats = sinks.shutdown()?;
        log::info!(
            "pipeline stopped: {} frames, {} classified, {} session(s)",
            stats.frames,
            stats.classified,
            stats.sessions
        );
        Ok((stats, sink_stats))
    }
}

fn elapsed(last: Option<Timestamp>, now: Timestamp, interval: Duration) -> bool {
    match last {
        Some(last) => now - last >= interval.as_secs_f64(),
        None => true,
    }
}
