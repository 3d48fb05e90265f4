use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::SessionStore;
use crate::{now_s, Activity, CompletedSession, EndReason, FrameRef, Timestamp};

/// A persisted session row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub entity: String,
    pub activity: Activity,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub end_reason: EndReason,
    pub closed_at: Timestamp,
    pub frames: Vec<FrameRef>,
}

impl StoredSession {
    pub fn from_completed(completed: &CompletedSession) -> Self {
        let session = &completed.session;
        Self {
            id: completed.id(),
            entity: session.entity.clone(),
            activity: session.activity,
            started_at: session.started_at,
            ended_at: session.last_seen_at,
            end_reason: completed.reason,
            closed_at: completed.closed_at,
            frames: session.frames.clone(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.ended_at - self.started_at
    }
}

pub struct SqliteSessionStore {
    conn: Connection,
}

impl SqliteSessionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).with_context(|| format!("open {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sessions (
              id TEXT PRIMARY KEY,
              entity TEXT NOT NULL,
              activity TEXT NOT NULL,
              started_at REAL NOT NULL,
              ended_at REAL NOT NULL,
              end_reason TEXT NOT NULL,
              closed_at REAL NOT NULL,
              frame_count INTEGER NOT NULL,
              frames_json TEXT NOT NULL,
              created_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_entity ON sessions(entity, started_at);
            "#,
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, activity, started_at, ended_at, end_reason, closed_at, frames_json
             FROM sessions WHERE id = ?1",
        )?;
        let raw = stmt
            .query_row(params![id], RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_stored).transpose()
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

struct RawRow {
    id: String,
    entity: String,
    activity: String,
    started_at: f64,
    ended_at: f64,
    end_reason: String,
    closed_at: f64,
    frames_json: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity: row.get(1)?,
            activity: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            end_reason: row.get(5)?,
            closed_at: row.get(6)?,
            frames_json: row.get(7)?,
        })
    }

    fn into_stored(self) -> Result<StoredSession> {
        let end_reason: EndReason = serde_json::from_value(serde_json::Value::String(
            self.end_reason.clone(),
        ))
        .map_err(|_| anyhow!("corrupt session {}: end_reason '{}'", self.id, self.end_reason))?;
        let frames: Vec<FrameRef> = serde_json::from_str(&self.frames_json)
            .with_context(|| format!("corrupt session {}: frames_json", self.id))?;
        Ok(StoredSession {
            activity: self
                .activity
                .parse()
                .with_context(|| format!("corrupt session {}: activity", self.id))?,
            id: self.id,
            entity: self.entity,
            started_at: self.started_at,
            ended_at: self.ended_at,
            end_reason,
            closed_at: self.closed_at,
            frames,
        })
    }
}

fn end_reason_str(reason: EndReason) -> &'static str {
    match reason {
        EndReason::IdleTimeout => "idle_timeout",
        EndReason::ActivityChanged => "activity_changed",
        EndReason::Flushed => "flushed",
    }
}

impl SessionStore for SqliteSessionStore {
    fn save_session(&mut self, completed: &CompletedSession) -> Result<String> {
        let row = StoredSession::from_completed(completed);
        let frames_json = serde_json::to_string(&row.frames)?;
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO sessions(
              id, entity, activity, started_at, ended_at, end_reason,
              closed_at, frame_count, frames_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                row.id,
                row.entity,
                row.activity.as_str(),
                row.started_at,
                row.ended_at,
                end_reason_str(row.end_reason),
                row.closed_at,
                row.frames.len() as i64,
                frames_json,
                now_s()?
            ],
        )?;
        if inserted == 0 {
            log::debug!("session {} already stored", row.id);
        }
        Ok(row.id)
    }

    fn sessions_between(&mut self, from: f64, to: f64) -> Result<Vec<StoredSession>> {
        let raws = {
            let mut stmt = self.conn.prepare(
                "SELECT id, entity, activity, started_at, ended_at, end_reason, closed_at, frames_json
                 FROM sessions WHERE ended_at >= ?1 AND ended_at < ?2
                 ORDER BY started_at ASC, entity ASC",
            )?;
            let rows = stmt.query_map(params![from, to], RawRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(RawRow::into_stored).collect()
    }

    fn prune_older_than(&mut self, cutoff: f64) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM sessions WHERE ended_at < ?1", params![cutoff])?;
        Ok(removed)
    }
}

/// Map-backed store for tests and `--json` replays without a database.
#[derive(Clone, Debug, Default)]
pub struct InMemorySessionStore {
    sessions: BTreeMap<String, StoredSession>,
    saves: u64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of `save_session` calls, including duplicates.
    pub fn saves(&self) -> u64 {
        self.saves
    }
}

impl SessionStore for InMemorySessionStore {
    fn save_session(&mut self, completed: &CompletedSession) -> Result<String> {
        self.saves += 1;
        let row = StoredSession::from_completed(completed);
        let id = row.id.clone();
        self.sessions.entry(id.clone()).or_insert(row);
        Ok(id)
    }

    fn sessions_between(&mut self, from: f64, to: f64) -> Result<Vec<StoredSession>> {
        let mut out: Vec<StoredSession> = self
            .sessions
            .values()
            .filter(|s| s.ended_at >= from && s.ended_at < to)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.started_at
                .total_cmp(&b.started_at)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        Ok(out)
    }

    fn prune_older_than(&mut self, cutoff: f64) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.ended_at >= cutoff);
        Ok(before - self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;

    fn completed(entity: &str, start: f64, end: f64) -> CompletedSession {
        let mut session = Session::open(
            entity,
            Activity::Eating,
            start,
            FrameRef::new(format!("{}.jpg", start), start, 0.9),
        );
        session.last_seen_at = end;
        session.frames.push(FrameRef::new(format!("{}.jpg", end), end, 0.8));
        CompletedSession {
            session,
            reason: EndReason::IdleTimeout,
            closed_at: end + 120.0,
        }
    }

    #[test]
    fn sqlite_round_trip_and_idempotence() {
        let mut store = SqliteSessionStore::open_in_memory().unwrap();
        let c = completed("Mochi", 100.0, 160.0);
        let id1 = store.save_session(&c).unwrap();
        let id2 = store.save_session(&c).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.count().unwrap(), 1);

        let row = store.get(&id1).unwrap().expect("stored row");
        assert_eq!(row, StoredSession::from_completed(&c));
        assert_eq!(row.duration_secs(), 60.0);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn sqlite_window_and_prune() {
        let mut store = SqliteSessionStore::open_in_memory().unwrap();
        store.save_session(&completed("B", 500.0, 520.0)).unwrap();
        store.save_session(&completed("A", 100.0, 150.0)).unwrap();
        store.save_session(&completed("C", 900.0, 950.0)).unwrap();

        let window = store.sessions_between(100.0, 600.0).unwrap();
        let entities: Vec<&str> = window.iter().map(|s| s.entity.as_str()).collect();
        assert_eq!(entities, vec!["A", "B"]);

        assert_eq!(store.prune_older_than(600.0).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn memory_store_matches_sqlite_semantics() {
        let mut store = InMemorySessionStore::new();
        let c = completed("Mochi", 100.0, 160.0);
        store.save_session(&c).unwrap();
        store.save_session(&c).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.saves(), 2);
        assert_eq!(store.sessions_between(0.0, 200.0).unwrap().len(), 1);
        assert_eq!(store.prune_older_than(200.0).unwrap(), 1);
        assert!(store.is_empty());
    }
}
