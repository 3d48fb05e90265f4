//! Sinks for completed sessions.
//!
//! - Persistence (`SessionStore`): must be idempotent. Delivery is
//!   at-least-once, so the same session may be saved twice.
//! - Notification (`Notifier`): best-effort. A failed notification is
//!   logged and discarded, and never rolls back persistence.
//!
//! `SinkWorker` runs both off the frame loop.

mod notify;
mod store;
mod worker;

use anyhow::Result;

use crate::CompletedSession;

pub use notify::LogNotifier;
#[cfg(feature = "notify-webhook")]
pub use notify::WebhookNotifier;
pub use store::{InMemorySessionStore, SqliteSessionStore, StoredSession};
pub use worker::{SinkStats, SinkWorker, DEFAULT_MAX_PENDING};

pub trait SessionStore: Send {
    /// Persist a completed session and return its id.
    ///
    /// Saving the same session again is a no-op.
    fn save_session(&mut self, completed: &CompletedSession) -> Result<String>;

    /// Sessions that ended within `[from, to)`, ordered by start time.
    fn sessions_between(&mut self, from: f64, to: f64) -> Result<Vec<StoredSession>>;

    /// Delete sessions that ended before `cutoff`. Returns how many were removed.
    fn prune_older_than(&mut self, cutoff: f64) -> Result<usize>;
}

pub trait Notifier: Send {
    fn name(&self) -> &'static str;

    fn notify(&mut self, completed: &CompletedSession) -> Result<()>;
}

impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    fn save_session(&mut self, completed: &CompletedSession) -> Result<String> {
        (**self).save_session(completed)
    }

    fn sessions_between(&mut self, from: f64, to: f64) -> Result<Vec<StoredSession>> {
        (**self).sessions_between(from, to)
    }

    fn prune_older_than(&mut self, cutoff: f64) -> Result<usize> {
        (**self).prune_older_than(cutoff)
    }
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn notify(&mut self, completed: &CompletedSession) -> Result<()> {
        (**self).notify(completed)
    }
}
