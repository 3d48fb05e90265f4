//! Off-loop classification with a deadline.
//!
//! The frame loop must keep sampling motion while a call is in flight, so calls
//! run on a worker thread. At most one call is in flight: `try_submit` refuses
//! new work while busy (drop-if-busy), since only the latest motion frame
//! matters. Each call gets a deadline; a call that overruns is reported as
//! failed and its late result is discarded.
//!
//! The dispatcher stays "busy" until the pipeline has *received* the outcome,
//! not merely until the worker finished. The pipeline relies on this to hold
//! idle sweeps at `in_flight_since()` so observations are never applied after a
//! sweep with a later timestamp.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::classify::backend::{Classifier, ClassifyRequest};
use crate::classify::result::ClassificationResult;
use crate::Timestamp;

/// What came back from one dispatched call.
#[derive(Clone, Debug)]
pub enum ClassifyOutcome {
    Classified {
        reference: String,
        captured_at: Timestamp,
        result: ClassificationResult,
    },
    Failed {
        reference: String,
        captured_at: Timestamp,
        error: String,
        timed_out: bool,
    },
}

impl ClassifyOutcome {
    pub fn captured_at(&self) -> Timestamp {
        match self {
            ClassifyOutcome::Classified { captured_at, .. }
            | ClassifyOutcome::Failed { captured_at, .. } => *captured_at,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ClassifyOutcome::Classified { reference, .. }
            | ClassifyOutcome::Failed { reference, .. } => reference,
        }
    }
}

type SharedClassifier = Arc<Mutex<Box<dyn Classifier>>>;

pub struct ClassifyDispatcher {
    jobs: Option<Sender<ClassifyRequest>>,
    outcomes: Receiver<ClassifyOutcome>,
    in_flight: Option<Timestamp>,
    worker: Option<JoinHandle<()>>,
    name: &'static str,
}

impl ClassifyDispatcher {
    /// Warm up `classifier` and start the worker. A failed warm-up is logged;
    /// the first real call will surface a persistent problem.
    pub fn spawn(mut classifier: Box<dyn Classifier>, deadline: Duration) -> Result<Self> {
        let name = classifier.name();
        if let Err(e) = classifier.warm_up() {
            log::warn!("classifier {} warm-up failed: {:#}", name, e);
        }
        let classifier: SharedClassifier = Arc::new(Mutex::new(classifier));
        let (job_tx, job_rx) = mpsc::channel::<ClassifyRequest>();
        let (outcome_tx, outcome_rx) = mpsc::channel();

        let worker = std::thread::Builder::new()
            .name("classify".to_string())
            .spawn(move || {
                while let Ok(request) = job_rx.recv() {
                    let outcome = run_with_deadline(&classifier, request, deadline);
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn classify worker: {}", e))?;

        Ok(Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            in_flight: None,
            worker: Some(worker),
            name,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Capture timestamp of the frame currently being classified.
    pub fn in_flight_since(&self) -> Option<Timestamp> {
        self.in_flight
    }

    /// Hand a request to the worker. Returns `false` (request dropped) when busy.
    pub fn try_submit(&mut self, request: ClassifyRequest) -> bool {
        if self.is_busy() {
            log::debug!("classifier busy; dropping {}", request.reference);
            return false;
        }
        let Some(jobs) = &self.jobs else {
            return false;
        };
        let captured_at = request.captured_at;
        if jobs.send(request).is_err() {
            log::error!("classify worker is gone; dropping request");
            return false;
        }
        self.in_flight = Some(captured_at);
        true
    }

    /// Non-blocking poll for a finished call.
    pub fn try_recv(&mut self) -> Option<ClassifyOutcome> {
        match self.outcomes.try_recv() {
            Ok(outcome) => {
                self.in_flight = None;
                Some(outcome)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = None;
                None
            }
        }
    }

    /// Blocking poll for a finished call.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ClassifyOutcome> {
        match self.outcomes.recv_timeout(timeout) {
            Ok(outcome) => {
                self.in_flight = None;
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.in_flight = None;
                None
            }
        }
    }

    /// Stop accepting work and wait for the worker to finish its current call.
    pub fn shutdown(mut self) -> Result<()> {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("classify worker panicked"))?;
        }
        Ok(())
    }
}

fn run_with_deadline(
    classifier: &SharedClassifier,
    request: ClassifyRequest,
    deadline: Duration,
) -> ClassifyOutcome {
    let reference = request.reference.clone();
    let captured_at = request.captured_at;
    let failed = |error: String, timed_out: bool| ClassifyOutcome::Failed {
        reference: reference.clone(),
        captured_at,
        error,
        timed_out,
    };

    // A previous call that blew its deadline may still hold the backend.
    let guard_free = match classifier.try_lock() {
        Ok(_) => true,
        Err(TryLockError::WouldBlock) => false,
        Err(TryLockError::Poisoned(_)) => return failed("classifier panicked earlier".into(), false),
    };
    if !guard_free {
        return failed("classifier still busy with an abandoned call".into(), false);
    }

    let (tx, rx) = mpsc::channel();
    let shared = Arc::clone(classifier);
    let spawned = std::thread::Builder::new()
        .name("classify-call".to_string())
        .spawn(move || {
            let result = match shared.lock() {
                Ok(mut backend) => backend.classify(&request),
                Err(_) => Err(anyhow!("classifier lock poisoned")),
            };
            // Receiver is gone if the deadline already passed.
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        return failed(format!("failed to spawn classify call: {}", e), false);
    }

    match rx.recv_timeout(deadline) {
        Ok(Ok(result)) => ClassifyOutcome::Classified {
            reference: reference.clone(),
            captured_at,
            result,
        },
        Ok(Err(e)) => failed(format!("{:#}", e), false),
        Err(RecvTimeoutError::Timeout) => {
            failed(format!("deadline of {:?} exceeded", deadline), true)
        }
        Err(RecvTimeoutError::Disconnected) => failed("classify call panicked".into(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::backend::FrameImage;
    use crate::classify::ScriptedClassifier;

    fn request(reference: &str, at: Timestamp) -> ClassifyRequest {
        ClassifyRequest {
            reference: reference.to_string(),
            captured_at: at,
            image: FrameImage::Jpeg(Vec::new()),
        }
    }

    #[test]
    fn delivers_results_and_clears_busy_on_receive() {
        let classifier = ScriptedClassifier::new()
            .then(ClassificationResult::empty().with_entity("Mochi", "eating", 0.9));
        let mut d = ClassifyDispatcher::spawn(Box::new(classifier), Duration::from_secs(5)).unwrap();

        assert!(d.try_submit(request("f1", 100.0)));
        assert!(d.is_busy());
        assert_eq!(d.in_flight_since(), Some(100.0));

        let outcome = d.recv_timeout(Duration::from_secs(5)).expect("outcome");
        match outcome {
            ClassifyOutcome::Classified { reference, result, .. } => {
                assert_eq!(reference, "f1");
                assert_eq!(result.entities[0].id, "Mochi");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!d.is_busy());
        d.shutdown().unwrap();
    }

    #[test]
    fn drops_requests_while_busy() {
        let classifier = ScriptedClassifier::new()
            .with_latency(Duration::from_millis(50))
            .then(ClassificationResult::empty())
            .then(ClassificationResult::empty());
        let mut d = ClassifyDispatcher::spawn(Box::new(classifier), Duration::from_secs(5)).unwrap();

        assert!(d.try_submit(request("f1", 1.0)));
        assert!(!d.try_submit(request("f2", 2.0)));
        let outcome = d.recv_timeout(Duration::from_secs(5)).expect("outcome");
        assert_eq!(outcome.reference(), "f1");
        assert!(d.try_submit(request("f3", 3.0)));
        assert_eq!(d.recv_timeout(Duration::from_secs(5)).unwrap().reference(), "f3");
        d.shutdown().unwrap();
    }

    #[test]
    fn errors_become_failed_outcomes() {
        let classifier = ScriptedClassifier::new().then_fail("upstream 503");
        let mut d = ClassifyDispatcher::spawn(Box::new(classifier), Duration::from_secs(5)).unwrap();
        d.try_submit(request("f1", 1.0));
        match d.recv_timeout(Duration::from_secs(5)).expect("outcome") {
            ClassifyOutcome::Failed { error, timed_out, captured_at, .. } => {
                assert!(error.contains("upstream 503"));
                assert!(!timed_out);
                assert_eq!(captured_at, 1.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        d.shutdown().unwrap();
    }

    struct Warming {
        warmed: Arc<std::sync::atomic::AtomicBool>,
        fail: bool,
    }

    impl Classifier for Warming {
        fn name(&self) -> &'static str {
            "warming"
        }

        fn classify(&mut self, _request: &ClassifyRequest) -> Result<ClassificationResult> {
            Ok(ClassificationResult::empty())
        }

        fn warm_up(&mut self) -> Result<()> {
            self.warmed.store(true, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("model not loaded"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn spawn_warms_up_backend_and_survives_failure() {
        for fail in [false, true] {
            let warmed = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let classifier = Warming {
                warmed: Arc::clone(&warmed),
                fail,
            };
            let mut d = ClassifyDispatcher::spawn(Box::new(classifier), Duration::from_secs(5)).unwrap();
            assert!(warmed.load(std::sync::atomic::Ordering::SeqCst));
            assert!(d.try_submit(request("f1", 1.0)));
            assert!(matches!(
                d.recv_timeout(Duration::from_secs(5)),
                Some(ClassifyOutcome::Classified { .. })
            ));
            d.shutdown().unwrap();
        }
    }

    #[test]
    fn overrunning_calls_time_out() {
        let classifier = ScriptedClassifier::new()
            .with_latency(Duration::from_millis(300))
            .then(ClassificationResult::empty());
        let mut d =
            ClassifyDispatcher::spawn(Box::new(classifier), Duration::from_millis(20)).unwrap();
        d.try_submit(request("slow", 1.0));
        match d.recv_timeout(Duration::from_secs(5)).expect("outcome") {
            ClassifyOutcome::Failed { timed_out, .. } => assert!(timed_out),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!d.is_busy());
        d.shutdown().unwrap();
    }
}
