use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FrameSource, SourceStats};
use crate::frame::{Frame, LatestFrameSlot};

/// Capped exponential backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Sleep for `total`, returning early (false) once `shutdown` is set.
pub(crate) fn sleep_unless(shutdown: &AtomicBool, total: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let nap = remaining.min(step);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
    !shutdown.load(Ordering::SeqCst)
}

/// Wraps a source and transparently reconnects after errors or stalls.
pub struct ReconnectingSource<S: FrameSource> {
    inner: S,
    backoff: Backoff,
    connected: bool,
    fresh_connection: bool,
    consecutive_failures: u32,
}

impl<S: FrameSource> ReconnectingSource<S> {
    pub fn new(inner: S, backoff: Backoff) -> Self {
        Self {
            inner,
            backoff,
            connected: false,
            fresh_connection: false,
            consecutive_failures: 0,
        }
    }

    /// Next frame, reconnecting as often as needed. `None` only on shutdown.
    pub fn next_frame(&mut self, shutdown: &AtomicBool) -> Option<Frame> {
        while !shutdown.load(Ordering::SeqCst) {
            if !self.connected {
                match self.inner.connect() {
                    Ok(()) => {
                        self.connected = true;
                        self.fresh_connection = true;
                    }
                    Err(e) => {
                        self.on_failure("connect", &e);
                        if !sleep_unless(shutdown, self.backoff.next_delay()) {
                            return None;
                        }
                        continue;
                    }
                }
            }
            match self.inner.next_frame() {
                Ok(frame) => {
                    if self.consecutive_failures > 0 {
                        log::info!(
                            "capture recovered after {} failure(s)",
                            self.consecutive_failures
                        );
                    }
                    self.consecutive_failures = 0;
                    self.backoff.reset();
                    if std::mem::take(&mut self.fresh_connection) {
                        return Some(frame.mark_resumed());
                    }
                    return Some(frame);
                }
                Err(e) => {
                    self.inner.disconnect();
                    self.connected = false;
                    self.on_failure("read", &e);
                    if !sleep_unless(shutdown, self.backoff.next_delay()) {
                        return None;
                    }
                }
            }
        }
        None
    }

    fn on_failure(&mut self, stage: &str, error: &anyhow::Error) {
        self.consecutive_failures += 1;
        log::warn!(
            "capture {} failed ({} in a row): {:#}",
            stage,
            self.consecutive_failures,
            error
        );
    }

    pub fn stats(&self) -> SourceStats {
        self.inner.stats()
    }

    pub fn disconnect(&mut self) {
        self.inner.disconnect();
        self.connected = false;
    }
}

/// Capture thread body: feed the latest frame into `slot` until `shutdown`.
///
/// Closes the slot on exit so the pipeline wakes up.
pub fn run_capture<S: FrameSource>(
    mut source: ReconnectingSource<S>,
    slot: Arc<LatestFrameSlot>,
    shutdown: Arc<AtomicBool>,
) -> SourceStats {
    while let Some(frame) = source.next_frame(&shutdown) {
        slot.put(frame);
    }
    source.disconnect();
    slot.close();
    let stats = source.stats();
    log::info!(
        "capture stopped: {} frames from {} ({} connects, {} failures)",
        stats.frames_captured,
        stats.source,
        stats.connects,
        stats.failures
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{StubConfig, StubSource};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn reconnects_through_failures() {
        let stub = StubSource::new(StubConfig {
            fail_every: 3,
            ..StubConfig::default()
        });
        let mut source =
            ReconnectingSource::new(stub, Backoff::new(Duration::from_millis(1), Duration::from_millis(2)));
        let shutdown = AtomicBool::new(false);
        let frames: Vec<(u64, bool)> = (0..4)
            .map(|_| source.next_frame(&shutdown).expect("frame"))
            .map(|f| (f.sequence, f.resumed))
            .collect();
        assert_eq!(frames, vec![(1, true), (2, false), (4, true), (5, false)]);
        let stats = source.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.connects, 2);
    }

    #[test]
    fn shutdown_stops_capture_and_closes_slot() {
        let slot = Arc::new(LatestFrameSlot::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let source = ReconnectingSource::new(StubSource::new(StubConfig::default()), Backoff::default());
        let handle = {
            let slot = Arc::clone(&slot);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || run_capture(source, slot, shutdown))
        };
        assert!(slot.take_timeout(Duration::from_secs(5)).is_some());
        shutdown.store(true, Ordering::SeqCst);
        let stats = handle.join().unwrap();
        assert!(stats.frames_captured >= 1);
        assert!(slot.is_closed());
    }

    #[test]
    fn sleep_unless_returns_early_on_shutdown() {
        let flag = AtomicBool::new(true);
        assert!(!sleep_unless(&flag, Duration::from_secs(30)));
    }
}
