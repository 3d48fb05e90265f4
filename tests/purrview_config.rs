use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use purrview::config::PurrviewConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PURRVIEW_CONFIG",
        "PURRVIEW_STREAM_URL",
        "PURRVIEW_FRAME_INTERVAL_SECS",
        "PURRVIEW_MOTION_THRESHOLD",
        "PURRVIEW_MOTION_COOLDOWN_SECS",
        "PURRVIEW_IDLE_TIMEOUT_SECS",
        "PURRVIEW_SWEEP_INTERVAL_SECS",
        "PURRVIEW_CLASSIFY_DEADLINE_SECS",
        "PURRVIEW_CLASSIFIER_URL",
        "PURRVIEW_CLASSIFIER_API_KEY",
        "PURRVIEW_DB_PATH",
        "PURRVIEW_WEBHOOK_URL",
        "PURRVIEW_RETENTION_DAYS",
        "PURRVIEW_MIN_CONFIDENCE",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PurrviewConfig::load().expect("load defaults");
    assert_eq!(cfg.stream.url, "stub://bowl_camera");
    assert_eq!((cfg.stream.width, cfg.stream.height), (1280, 720));
    assert_eq!(cfg.stream.frame_interval, Duration::from_secs(2));
    assert_eq!(cfg.motion.threshold, 500);
    assert_eq!(cfg.motion.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.tracker.idle_timeout, Duration::from_secs(120));
    assert_eq!(cfg.tracker.sweep_interval, Duration::from_secs(10));
    assert_eq!(cfg.classifier.deadline, Duration::from_secs(60));
    assert_eq!(cfg.retention, Duration::from_secs(14 * 24 * 3600));
    assert!(cfg.classifier.url.is_none());
    assert!(cfg.webhook_url.is_none());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
db_path = "feeding.db"
retention_days = 30

[stream]
url = "rtmp://nas.local/live/bowls"
frame_interval_secs = 1.5

[motion]
threshold = 800
cooldown_secs = 20
roi = [100, 50, 900, 600]

[tracker]
idle_timeout_secs = 90

[classifier]
url = "https://model.local/classify"
min_confidence = 0.4
"#,
    );
    std::env::set_var("PURRVIEW_CONFIG", file.path());
    std::env::set_var("PURRVIEW_IDLE_TIMEOUT_SECS", "180");
    std::env::set_var("PURRVIEW_WEBHOOK_URL", "https://hooks.local/x");

    let cfg = PurrviewConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "feeding.db");
    assert_eq!(cfg.retention, Duration::from_secs(30 * 24 * 3600));
    assert_eq!(cfg.stream.url, "rtmp://nas.local/live/bowls");
    assert_eq!(cfg.stream.frame_interval, Duration::from_millis(1500));
    assert_eq!(cfg.motion.threshold, 800);
    assert_eq!(cfg.motion.roi, Some([100, 50, 900, 600]));
    assert_eq!(cfg.tracker.idle_timeout, Duration::from_secs(180));
    assert_eq!(cfg.classifier.url.as_deref(), Some("https://model.local/classify"));
    assert!((cfg.classifier.min_confidence - 0.4).abs() < 1e-6);
    assert_eq!(cfg.webhook_url.as_deref(), Some("https://hooks.local/x"));
    assert!(cfg.motion_scorer().is_ok());

    clear_env();
}

#[test]
fn loads_json_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(".json", r#"{"stream": {"url": "rtsp://cam"}, "motion": {"threshold": 42}}"#);
    std::env::set_var("PURRVIEW_CONFIG", file.path());
    let cfg = PurrviewConfig::load().expect("load config");
    assert_eq!(cfg.stream.url, "rtsp://cam");
    assert_eq!(cfg.motion.threshold, 42);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PURRVIEW_SWEEP_INTERVAL_SECS", "200");
    assert!(PurrviewConfig::load().is_err(), "sweep interval above idle timeout");
    clear_env();

    std::env::set_var("PURRVIEW_MOTION_COOLDOWN_SECS", "0");
    assert!(PurrviewConfig::load().is_err(), "zero cooldown");
    clear_env();

    std::env::set_var("PURRVIEW_IDLE_TIMEOUT_SECS", "1e30");
    assert!(PurrviewConfig::load().is_err(), "idle timeout too large for a duration");
    clear_env();

    std::env::set_var("PURRVIEW_FRAME_INTERVAL_SECS", "NaN");
    assert!(PurrviewConfig::load().is_err(), "non-finite frame interval");
    clear_env();

    std::env::set_var("PURRVIEW_MIN_CONFIDENCE", "1.5");
    assert!(PurrviewConfig::load().is_err(), "confidence above 1");
    clear_env();

    std::env::set_var("PURRVIEW_MOTION_THRESHOLD", "lots");
    let err = PurrviewConfig::load().unwrap_err();
    assert!(err.to_string().contains("PURRVIEW_MOTION_THRESHOLD"));
    clear_env();

    let file = temp_config(".json", r#"{"unknown_key": true}"#);
    std::env::set_var("PURRVIEW_CONFIG", file.path());
    assert!(PurrviewConfig::load().is_err(), "unknown keys rejected");
    clear_env();
}
