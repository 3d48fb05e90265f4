//! purrviewd - live feeding session daemon
//!
//! This daemon:
//! 1. Captures frames from the configured stream (ffmpeg or `stub://`)
//! 2. Gates them on motion score and cooldown
//! 3. Classifies admitted frames off-loop with a deadline
//! 4. Tracks per-cat sessions and closes idle ones on a sweep cadence
//! 5. Persists completed sessions to SQLite and sends notifications
//! 6. Prunes sessions older than the retention window

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use purrview::classify::{ClassifyDispatcher, Classifier};
use purrview::config::PurrviewConfig;
use purrview::ingest::{open_source, run_capture, Backoff, ReconnectingSource};
use purrview::pipeline::{Pipeline, PipelineOptions};
use purrview::sink::{LogNotifier, Notifier, SinkWorker, SqliteSessionStore};
use purrview::LatestFrameSlot;

#[derive(Parser, Debug)]
#[command(name = "purrviewd", version, about = "Live cat feeding session tracker")]
struct Args {
    /// Config file (TOML or JSON); overridden by PURRVIEW_* variables
    #[arg(long, env = "PURRVIEW_CONFIG")]
    config: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("PURRVIEW_CONFIG", path);
    }
    let cfg = PurrviewConfig::load()?;

    let classifier = build_classifier(&cfg)?;
    let dispatcher = ClassifyDispatcher::spawn(classifier, cfg.classifier.deadline)?;

    let store = SqliteSessionStore::open(&cfg.db_path)
        .with_context(|| format!("open session store {}", cfg.db_path))?;
    let sinks = SinkWorker::spawn(Box::new(store), build_notifiers(&cfg)?, Backoff::default())?;

    let source = open_source(&cfg.stream.url, cfg.ffmpeg_config())?;
    let slot = Arc::new(LatestFrameSlot::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    let capture = {
        let slot = Arc::clone(&slot);
        let shutdown = Arc::clone(&shutdown);
        let source = ReconnectingSource::new(source, Backoff::default());
        std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || run_capture(source, slot, shutdown))
            .context("spawn capture thread")?
    };

    let options = PipelineOptions {
        tracker: cfg.tracker_options(),
        sweep_interval: cfg.tracker.sweep_interval,
        min_confidence: cfg.classifier.min_confidence,
        retention: Some(cfg.retention),
        ..PipelineOptions::default()
    };
    let pipeline = Pipeline::new(
        options,
        cfg.motion_gate(),
        Box::new(cfg.motion_scorer()?),
        dispatcher,
        sinks,
    );

    log::info!("purrviewd running. stream={} db={}", cfg.stream.url, cfg.db_path);
    log::info!(
        "motion threshold={} cooldown={:?} idle_timeout={:?}",
        cfg.motion.threshold,
        cfg.motion.cooldown,
        cfg.tracker.idle_timeout
    );

    let result = pipeline.run(&slot, &shutdown);
    shutdown.store(true, Ordering::SeqCst);
    slot.close();
    if capture.join().is_err() {
        log::error!("capture thread panicked");
    }

    let (stats, sinks) = result?;
    log::info!(
        "purrviewd stopped: {} frames, {} calls ({} failed), {} sessions, {} saved, {} unsaved",
        stats.frames,
        stats.submitted,
        stats.classify_failures,
        stats.sessions,
        sinks.saved,
        sinks.pending
    );
    Ok(())
}

#[cfg(feature = "classify-http")]
fn build_classifier(cfg: &PurrviewConfig) -> Result<Box<dyn Classifier>> {
    use purrview::classify::HttpClassifier;

    let Some(url) = &cfg.classifier.url else {
        bail!("no classifier configured: set PURRVIEW_CLASSIFIER_URL or classifier.url");
    };
    let classifier =
        HttpClassifier::new(url, cfg.classifier.deadline)?.with_api_key(cfg.classifier.api_key.clone());
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "classify-http"))]
fn build_classifier(_cfg: &PurrviewConfig) -> Result<Box<dyn Classifier>> {
    bail!("purrviewd needs a live classifier; rebuild with --features classify-http")
}

fn build_notifiers(cfg: &PurrviewConfig) -> Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier::new())];
    if let Some(url) = &cfg.webhook_url {
        #[cfg(feature = "notify-webhook")]
        notifiers.push(Box::new(purrview::sink::WebhookNotifier::new(url)?));
        #[cfg(not(feature = "notify-webhook"))]
        log::warn!(
            "webhook {} configured but notify-webhook feature is disabled; logging only",
            url
        );
    }
    Ok(notifiers)
}
