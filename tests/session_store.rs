use purrview::sink::{InMemorySessionStore, SessionStore, SqliteSessionStore};
use purrview::{Activity, CompletedSession, EndReason, FrameRef, Session};

fn completed(entity: &str, activity: Activity, start: f64, end: f64) -> CompletedSession {
    let session = Session {
        entity: entity.to_string(),
        activity,
        started_at: start,
        last_seen_at: end,
        frames: vec![
            FrameRef::new(format!("{}.jpg", start), start, 0.9),
            FrameRef::new(format!("{}.jpg", end), end, 0.8),
        ],
    };
    CompletedSession {
        session,
        reason: EndReason::IdleTimeout,
        closed_at: end + 120.0,
    }
}

#[test]
fn sqlite_store_survives_reopen_and_ignores_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.db");
    let path = path.to_str().expect("utf-8 path");

    let first = completed("Mochi", Activity::Eating, 1_000.0, 1_240.0);
    let id = {
        let mut store = SqliteSessionStore::open(path).expect("open");
        let id = store.save_session(&first).expect("save");
        assert_eq!(store.save_session(&first).expect("save again"), id);
        store
            .save_session(&completed("Tofu", Activity::Drinking, 1_100.0, 1_130.0))
            .expect("save tofu");
        id
    };

    let mut store = SqliteSessionStore::open(path).expect("reopen");
    assert_eq!(store.count().expect("count"), 2);
    let stored = store.get(&id).expect("get").expect("present");
    assert_eq!(stored.entity, "Mochi");
    assert_eq!(stored.activity, Activity::Eating);
    assert_eq!(stored.end_reason, EndReason::IdleTimeout);
    assert_eq!(stored.frames.len(), 2);
    assert_eq!(stored.duration_secs(), 240.0);

    // A retried delivery after restart is still a no-op.
    store.save_session(&first).expect("save after reopen");
    assert_eq!(store.count().expect("count"), 2);
}

#[test]
fn range_queries_and_pruning_use_end_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.db");
    let mut store = SqliteSessionStore::open(path.to_str().expect("utf-8 path")).expect("open");

    store.save_session(&completed("A", Activity::Eating, 100.0, 150.0)).expect("save");
    store.save_session(&completed("B", Activity::Eating, 180.0, 260.0)).expect("save");
    store.save_session(&completed("C", Activity::Drinking, 300.0, 320.0)).expect("save");

    let window = store.sessions_between(150.0, 300.0).expect("query");
    let names: Vec<&str> = window.iter().map(|s| s.entity.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);

    assert_eq!(store.prune_older_than(200.0).expect("prune"), 1);
    assert_eq!(store.count().expect("count"), 2);
    assert!(store.sessions_between(0.0, 200.0).expect("query").is_empty());
}

#[test]
fn in_memory_store_matches_sqlite_semantics() {
    let mut memory = InMemorySessionStore::new();
    let mut sqlite = SqliteSessionStore::open_in_memory().expect("open");
    let sessions = [
        completed("Mochi", Activity::Eating, 10.0, 40.0),
        completed("Mochi", Activity::Eating, 10.0, 40.0),
        completed("Tofu", Activity::Drinking, 5.0, 90.0),
    ];
    for s in &sessions {
        assert_eq!(memory.save_session(s).expect("memory"), sqlite.save_session(s).expect("sqlite"));
    }
    assert_eq!(memory.len(), 2);
    assert_eq!(memory.saves(), 3);
    assert_eq!(
        memory.sessions_between(0.0, 100.0).expect("memory"),
        sqlite.sessions_between(0.0, 100.0).expect("sqlite")
    );
}
