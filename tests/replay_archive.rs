use std::path::Path;

use purrview::replay::{
    ArchiveRecord, FrameOutcome, ReplayHarness, ReplayListener, ReplayOptions, ARCHIVE_INDEX,
};
use purrview::sink::{SessionStore, SqliteSessionStore};
use purrview::{Activity, CompletedSession, EndReason, LabelFileClassifier};

const INDEX: &str = r#"{"timestamp": 1000, "filename": "f1.jpg", "motion_score": 8000}
{"timestamp": 1010, "filename": "f2.jpg", "motion_score": 9000}
{"timestamp": 1040, "filename": "f3.jpg", "motion_score": 9000}
{"timestamp": 1050, "filename": "quiet.jpg", "motion_score": 100}
{"timestamp": 1080, "filename": "gone.jpg", "motion_score": 9000}
{"timestamp": "1970-01-01T00:20:00Z", "filename": "f5.jpg", "motion_score": 7000}
"#;

const LABELS: &str = r#"{"frame": "f1.jpg", "result": {"entitiesPresent": true, "entities": [{"id": "Mochi", "activityLabel": "eating", "confidence": 0.9}], "confidence": 0.9}}
{"frame": "f3.jpg", "result": {"entitiesPresent": true, "entities": [{"id": "Mochi", "activityLabel": "eating", "confidence": 0.8}], "confidence": 0.8}}
{"frame": "f5.jpg", "result": {"entitiesPresent": true, "entities": [{"id": "Tofu", "activityLabel": "drinking", "confidence": 0.7}], "confidence": 0.7}}
"#;

fn write_archive(dir: &Path) {
    std::fs::write(dir.join(ARCHIVE_INDEX), INDEX).expect("write index");
    for name in ["f1.jpg", "f2.jpg", "f3.jpg", "quiet.jpg", "f5.jpg"] {
        std::fs::write(dir.join(name), b"\xff\xd8jpeg").expect("write frame");
    }
}

#[derive(Default)]
struct Recorder {
    outcomes: Vec<(String, FrameOutcome)>,
    sessions: Vec<CompletedSession>,
}

impl ReplayListener for Recorder {
    fn on_frame(&mut self, _index: usize, total: usize, record: &ArchiveRecord, outcome: &FrameOutcome) {
        assert_eq!(total, 5);
        self.outcomes.push((record.filename.clone(), outcome.clone()));
    }

    fn on_session(&mut self, completed: &CompletedSession) {
        self.sessions.push(completed.clone());
    }
}

#[test]
fn replays_archive_directory_into_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archive(dir.path());
    let labels = LabelFileClassifier::from_reader(LABELS.as_bytes()).expect("labels");

    let mut harness = ReplayHarness::new(ReplayOptions::default(), labels, dir.path());
    let mut recorder = Recorder::default();
    let report = harness.run_archive(&mut recorder).expect("replay");

    assert_eq!(report.frames, 5, "quiet frame is below the motion threshold");
    assert_eq!(report.calls, 3);
    assert_eq!(report.errors, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.cooled_down, 1);

    let outcomes: Vec<&str> = recorder
        .outcomes
        .iter()
        .map(|(name, outcome)| match outcome {
            FrameOutcome::Missing => "missing",
            FrameOutcome::CooledDown => "cooled",
            FrameOutcome::Classified { .. } => name.as_str(),
            FrameOutcome::Failed { .. } => "failed",
        })
        .collect();
    assert_eq!(outcomes, vec!["f1.jpg", "cooled", "f3.jpg", "missing", "f5.jpg"]);

    assert_eq!(report.sessions.len(), 2);
    let mochi = &report.sessions[0];
    assert_eq!(mochi.session.entity, "Mochi");
    assert_eq!(mochi.session.activity, Activity::Eating);
    assert_eq!(mochi.session.started_at, 1000.0);
    assert_eq!(mochi.session.last_seen_at, 1040.0);
    assert_eq!(mochi.session.frames.len(), 2);
    assert_eq!(mochi.reason, EndReason::IdleTimeout);
    assert_eq!(mochi.closed_at, 1200.0);

    let tofu = &report.sessions[1];
    assert_eq!(tofu.session.entity, "Tofu");
    assert_eq!(tofu.session.activity, Activity::Drinking);
    assert_eq!(tofu.reason, EndReason::Flushed);

    assert_eq!(recorder.sessions, report.sessions);
    assert!(report.table().contains("Mochi"));
}

#[test]
fn replayed_sessions_persist_once_across_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archive(dir.path());
    let db = dir.path().join("replay.db");
    let db = db.to_str().expect("utf-8 path");

    for _ in 0..2 {
        let labels = LabelFileClassifier::from_reader(LABELS.as_bytes()).expect("labels");
        let mut harness = ReplayHarness::new(ReplayOptions::default(), labels, dir.path());
        let report = harness.run_archive(&mut ()).expect("replay");
        let mut store = SqliteSessionStore::open(db).expect("open store");
        for completed in &report.sessions {
            store.save_session(completed).expect("save");
        }
    }

    let mut store = SqliteSessionStore::open(db).expect("reopen store");
    assert_eq!(store.count().expect("count"), 2);
    let stored = store.sessions_between(0.0, 10_000.0).expect("query");
    assert_eq!(stored[0].entity, "Mochi");
    assert_eq!(stored[0].duration_secs(), 40.0);
    assert_eq!(stored[1].end_reason, EndReason::Flushed);
}

#[test]
fn limit_caps_replayed_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_archive(dir.path());
    let labels = LabelFileClassifier::from_reader(LABELS.as_bytes()).expect("labels");
    let options = ReplayOptions {
        limit: Some(1),
        ..ReplayOptions::default()
    };
    let mut harness = ReplayHarness::new(options, labels, dir.path());
    let report = harness.run_archive(&mut ()).expect("replay");
    assert_eq!(report.frames, 1);
    assert_eq!(report.calls, 1);
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.sessions[0].reason, EndReason::Flushed);
}

#[test]
fn missing_index_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let labels = LabelFileClassifier::from_reader("".as_bytes()).expect("labels");
    let mut harness = ReplayHarness::new(ReplayOptions::default(), labels, dir.path());
    let err = harness.run_archive(&mut ()).unwrap_err();
    assert!(format!("{:#}", err).contains(ARCHIVE_INDEX));
}
