use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use super::{Notifier, SessionStore};
use crate::ingest::Backoff;
use crate::CompletedSession;

/// Unsaved sessions kept for retry while the store is down.
pub const DEFAULT_MAX_PENDING: usize = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub saved: u64,
    pub save_failures: u64,
    pub notified: u64,
    pub notify_failures: u64,
    /// Sessions waiting for a persistence retry.
    pub pending: usize,
    /// Oldest unsaved sessions evicted when the retry queue was full.
    pub dropped: u64,
    pub pruned: u64,
}

enum SinkJob {
    Deliver(Box<CompletedSession>),
    Prune { cutoff: f64 },
}

/// Runs persistence and notification on a dedicated thread.
///
/// Each session is persisted first, then notified whatever the persistence
/// outcome. Failed saves are queued and retried with capped backoff; on
/// shutdown the queue gets one last attempt and anything left is logged.
/// The queue holds at most `max_pending` sessions; beyond that the oldest is
/// logged and evicted.
pub struct SinkWorker {
    jobs: Option<Sender<SinkJob>>,
    stats: Arc<Mutex<SinkStats>>,
    handle: Option<JoinHandle<()>>,
}

impl SinkWorker {
    pub fn spawn(
        store: Box<dyn SessionStore>,
        notifiers: Vec<Box<dyn Notifier>>,
        retry: Backoff,
    ) -> Result<Self> {
        Self::spawn_with_capacity(store, notifiers, retry, DEFAULT_MAX_PENDING)
    }

    pub fn spawn_with_capacity(
        store: Box<dyn SessionStore>,
        notifiers: Vec<Box<dyn Notifier>>,
        retry: Backoff,
        max_pending: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<SinkJob>();
        let stats = Arc::new(Mutex::new(SinkStats::default()));
        let mut state = SinkState {
            store,
            notifiers,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            retry,
            next_retry: None,
            stats: Arc::clone(&stats),
        };

        let handle = std::thread::Builder::new()
            .name("sinks".to_string())
            .spawn(move || {
                loop {
                    let job = match state.next_retry {
                        Some(at) => {
                            let wait = at.saturating_duration_since(Instant::now());
                            match rx.recv_timeout(wait) {
                                Ok(job) => Some(job),
                                Err(RecvTimeoutError::Timeout) => None,
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        None => match rx.recv() {
                            Ok(job) => Some(job),
                            Err(_) => break,
                        },
                    };
                    match job {
                        Some(SinkJob::Deliver(completed)) => state.deliver(*completed),
                        Some(SinkJob::Prune { cutoff }) => state.prune(cutoff),
                        None => {}
                    }
                    if state.next_retry.is_some_and(|at| Instant::now() >= at) {
                        state.retry_pending();
                    }
                }
                state.flush_on_shutdown();
            })
            .map_err(|e| anyhow!("failed to spawn sink worker: {}", e))?;

        Ok(Self {
            jobs: Some(tx),
            stats,
            handle: Some(handle),
        })
    }

    /// A worker with no notifiers and the default retry backoff.
    pub fn persist_only(store: Box<dyn SessionStore>) -> Result<Self> {
        Self::spawn(store, Vec::new(), Backoff::default())
    }

    pub fn submit(&self, completed: CompletedSession) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("sink worker already shut down"))?;
        jobs.send(SinkJob::Deliver(Box::new(completed)))
            .map_err(|_| anyhow!("sink worker is gone"))
    }

    /// Ask the worker to delete sessions that ended before `cutoff`.
    pub fn prune_older_than(&self, cutoff: f64) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("sink worker already shut down"))?;
        jobs.send(SinkJob::Prune { cutoff })
            .map_err(|_| anyhow!("sink worker is gone"))
    }

    pub fn stats(&self) -> SinkStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deliver everything already submitted, then stop.
    pub fn shutdown(mut self) -> Result<SinkStats> {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("sink worker panicked"))?;
        }
        Ok(self.stats())
    }
}

struct SinkState {
    store: Box<dyn SessionStore>,
    notifiers: Vec<Box<dyn Notifier>>,
    pending: VecDeque<CompletedSession>,
    max_pending: usize,
    retry: Backoff,
    next_retry: Option<Instant>,
    stats: Arc<Mutex<SinkStats>>,
}

impl SinkState {
    fn update(&self, f: impl FnOnce(&mut SinkStats)) {
        let mut guard = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.pending = self.pending.len();
    }

    fn deliver(&mut self, completed: CompletedSession) {
        self.persist(&completed);
        let (mut ok, mut failed) = (0, 0);
        for notifier in self.notifiers.iter_mut() {
            match notifier.notify(&completed) {
                Ok(()) => ok += 1,
                Err(e) => {
                    log::warn!(
                        "notifier {} failed for {}: {:#}",
                        notifier.name(),
                        completed.summary(),
                        e
                    );
                    failed += 1;
                }
            }
        }
        self.update(|s| {
            s.notified += ok;
            s.notify_failures += failed;
        });
    }

    fn persist(&mut self, completed: &CompletedSession) {
        match self.store.save_session(completed) {
            Ok(id) => {
                log::info!("saved {} as {}", completed.summary(), &id[..12.min(id.len())]);
                self.update(|s| s.saved += 1);
            }
            Err(e) => {
                log::error!(
                    "persisting {} failed; queued for retry: {:#}",
                    completed.summary(),
                    e
                );
                self.pending.push_back(completed.clone());
                let mut evicted = 0;
                while self.pending.len() > self.max_pending {
                    if let Some(oldest) = self.pending.pop_front() {
                        log_unsaved("retry queue full; dropping unsaved session", &oldest);
                        evicted += 1;
                    }
                }
                if self.next_retry.is_none() {
                    self.next_retry = Some(Instant::now() + self.retry.next_delay());
                }
                self.update(|s| {
                    s.save_failures += 1;
                    s.dropped += evicted;
                });
            }
        }
    }

    fn retry_pending(&mut self) {
        let batch: Vec<CompletedSession> = self.pending.drain(..).collect();
        let attempted = batch.len();
        let mut failed = 0;
        for completed in batch {
            match self.store.save_session(&completed) {
                Ok(_) => self.update(|s| s.saved += 1),
                Err(e) => {
                    failed += 1;
                    log::warn!("retry of {} failed: {:#}", completed.summary(), e);
                    self.pending.push_back(completed);
                }
            }
        }
        if self.pending.is_empty() {
            log::info!("persistence recovered; {} queued session(s) saved", attempted);
            self.retry.reset();
            self.next_retry = None;
        } else {
            let delay = self.retry.next_delay();
            log::warn!("{} session(s) still unsaved; next retry in {:?}", failed, delay);
            self.next_retry = Some(Instant::now() + delay);
        }
        self.update(|_| {});
    }

    fn prune(&mut self, cutoff: f64) {
        match self.store.prune_older_than(cutoff) {
            Ok(0) => {}
            Ok(n) => {
                log::info!("retention: pruned {} session(s)", n);
                self.update(|s| s.pruned += n as u64);
            }
            Err(e) => log::warn!("retention prune failed: {:#}", e),
        }
    }

    fn flush_on_shutdown(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.retry_pending();
        for completed in self.pending.drain(..) {
            log_unsaved("dropping unsaved session at shutdown", &completed);
        }
        self.next_retry = None;
        self.update(|_| {});
    }
}

fn log_unsaved(message: &str, completed: &CompletedSession) {
    let json = serde_json::to_string(completed).unwrap_or_else(|_| completed.summary());
    log::error!("{}: {}", message, json);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{InMemorySessionStore, StoredSession};
    use crate::{Activity, EndReason, FrameRef, Session};
    use anyhow::bail;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn completed(entity: &str, start: f64) -> CompletedSession {
        CompletedSession {
            session: Session::open(entity, Activity::Eating, start, FrameRef::new("f.jpg", start, 1.0)),
            reason: EndReason::IdleTimeout,
            closed_at: start + 60.0,
        }
    }

    /// Store that fails the first `fail_first` saves.
    struct FlakyStore {
        inner: InMemorySessionStore,
        fail_first: Arc<AtomicU32>,
        saved: Arc<Mutex<Vec<String>>>,
    }

    impl SessionStore for FlakyStore {
        fn save_session(&mut self, completed: &CompletedSession) -> Result<String> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                bail!("database is locked");
            }
            let id = self.inner.save_session(completed)?;
            self.saved.lock().unwrap().push(completed.session.entity.clone());
            Ok(id)
        }

        fn sessions_between(&mut self, from: f64, to: f64) -> Result<Vec<StoredSession>> {
            self.inner.sessions_between(from, to)
        }

        fn prune_older_than(&mut self, cutoff: f64) -> Result<usize> {
            self.inner.prune_older_than(cutoff)
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn notify(&mut self, _completed: &CompletedSession) -> Result<()> {
            bail!("webhook unreachable")
        }
    }

    struct CountingNotifier(Arc<AtomicU32>);

    impl Notifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn notify(&mut self, _completed: &CompletedSession) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn flaky(fail_first: u32) -> (FlakyStore, Arc<Mutex<Vec<String>>>) {
        let saved = Arc::new(Mutex::new(Vec::new()));
        (
            FlakyStore {
                inner: InMemorySessionStore::new(),
                fail_first: Arc::new(AtomicU32::new(fail_first)),
                saved: Arc::clone(&saved),
            },
            saved,
        )
    }

    #[test]
    fn notifies_even_when_persistence_fails_and_retries_later() {
        let (store, saved) = flaky(1);
        let notified = Arc::new(AtomicU32::new(0));
        let worker = SinkWorker::spawn(
            Box::new(store),
            vec![Box::new(CountingNotifier(Arc::clone(&notified)))],
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        )
        .unwrap();

        worker.submit(completed("Mochi", 100.0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while saved.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let stats = worker.shutdown().unwrap();
        assert_eq!(saved.lock().unwrap().as_slice(), ["Mochi".to_string()]);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(stats.save_failures, 1);
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn notification_failure_does_not_affect_persistence() {
        let (store, saved) = flaky(0);
        let worker =
            SinkWorker::spawn(Box::new(store), vec![Box::new(FailingNotifier)], Backoff::default())
                .unwrap();
        worker.submit(completed("A", 1.0)).unwrap();
        worker.submit(completed("B", 2.0)).unwrap();
        let stats = worker.shutdown().unwrap();
        assert_eq!(saved.lock().unwrap().len(), 2);
        assert_eq!(stats.saved, 2);
        assert_eq!(stats.notify_failures, 2);
    }

    #[test]
    fn shutdown_flushes_the_retry_queue() {
        // Retry delay far in the future: only the shutdown flush can save it.
        let (store, saved) = flaky(1);
        let worker = SinkWorker::spawn(
            Box::new(store),
            Vec::new(),
            Backoff::new(Duration::from_secs(3600), Duration::from_secs(3600)),
        )
        .unwrap();
        worker.submit(completed("Mochi", 100.0)).unwrap();
        let stats = worker.shutdown().unwrap();
        assert_eq!(saved.lock().unwrap().len(), 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn full_retry_queue_evicts_oldest_session() {
        let (store, saved) = flaky(3);
        let worker = SinkWorker::spawn_with_capacity(
            Box::new(store),
            Vec::new(),
            Backoff::new(Duration::from_secs(3600), Duration::from_secs(3600)),
            2,
        )
        .unwrap();
        worker.submit(completed("A", 1.0)).unwrap();
        worker.submit(completed("B", 2.0)).unwrap();
        worker.submit(completed("C", 3.0)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.stats().save_failures < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let stats = worker.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dropped, 1);

        let stats = worker.shutdown().unwrap();
        assert_eq!(saved.lock().unwrap().as_slice(), ["B".to_string(), "C".to_string()]);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn prune_runs_on_the_worker() {
        let (store, _saved) = flaky(0);
        let worker = SinkWorker::persist_only(Box::new(store)).unwrap();
        worker.submit(completed("A", 100.0)).unwrap();
        worker.prune_older_than(1_000.0).unwrap();
        let stats = worker.shutdown().unwrap();
        assert_eq!(stats.pruned, 1);
    }
}
