//! purrview_replay - replay a captured frame archive through gate, classifier and tracker.
//!
//! Uses archive timestamps, not the wall clock, so a day of frames replays in
//! seconds with a label file, and tuning changes (threshold, cooldown, idle
//! timeout) can be checked against hand-labelled ground truth.

use anyhow::{bail, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use purrview::classify::{Classifier, LabelFileClassifier};
use purrview::replay::{ArchiveRecord, FrameOutcome, ReplayHarness, ReplayListener, ReplayOptions};
use purrview::sink::{LogNotifier, Notifier, SessionStore, SqliteSessionStore};
use purrview::ui::{FrameProgress, Ui};
use purrview::CompletedSession;

#[derive(Parser, Debug)]
#[command(
    name = "purrview_replay",
    about = "Replay a captured frame archive and print the detected sessions"
)]
struct Args {
    /// Archive directory holding gallery_meta.jsonl and the frame images
    #[arg(long, value_name = "DIR")]
    archive: PathBuf,

    /// JSONL label file ({"frame": ..., "result": ...} per line)
    #[arg(long, value_name = "PATH")]
    labels: Option<PathBuf>,

    /// Classify with the HTTP model endpoint instead of a label file
    #[arg(long, env = "PURRVIEW_CLASSIFIER_URL", conflicts_with = "labels")]
    classifier_url: Option<String>,

    /// Max motion frames to replay (0 = all)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Motion score a frame must exceed to be considered
    #[arg(long, default_value_t = purrview::replay::DEFAULT_ARCHIVE_THRESHOLD)]
    threshold: u64,

    /// Seconds between classification calls
    #[arg(long, default_value_t = 30.0)]
    cooldown: f64,

    /// Session idle timeout in seconds
    #[arg(long, default_value_t = 60.0)]
    idle_timeout: f64,

    /// Drop entities below this confidence
    #[arg(long, default_value_t = 0.0)]
    min_confidence: f32,

    /// Persist completed sessions to this SQLite DB
    #[arg(long, value_name = "DB", env = "PURRVIEW_DB_PATH")]
    save: Option<String>,

    /// Send a notification per completed session
    #[arg(long)]
    notify: bool,

    /// Print the full report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

struct CliListener {
    progress: FrameProgress,
    store: Option<SqliteSessionStore>,
    notifiers: Vec<Box<dyn Notifier>>,
}

impl ReplayListener for CliListener {
    fn on_frame(&mut self, index: usize, total: usize, record: &ArchiveRecord, outcome: &FrameOutcome) {
        let detail = match outcome {
            FrameOutcome::Missing => "missing, skipped".to_string(),
            FrameOutcome::CooledDown => "cooldown".to_string(),
            FrameOutcome::Classified { entities } => entities.clone(),
            FrameOutcome::Failed { error } => format!("ERR {}", error),
        };
        self.progress
            .step(&format!("[{}/{}] {} -> {}", index + 1, total, record.filename, detail));
    }

    fn on_session(&mut self, completed: &CompletedSession) {
        self.progress.println(&format!("  {}", completed.summary()));
        if let Some(store) = self.store.as_mut() {
            match store.save_session(completed) {
                Ok(id) => self.progress.println(&format!("    -> saved {}", id)),
                Err(e) => self.progress.println(&format!("    -> save FAILED: {:#}", e)),
            }
        }
        for notifier in self.notifiers.iter_mut() {
            if let Err(e) = notifier.notify(completed) {
                log::warn!("notifier {} failed: {:#}", notifier.name(), e);
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, args.json);

    if args.cooldown < 0.0 || args.idle_timeout <= 0.0 {
        bail!("cooldown must be >= 0 and idle timeout > 0");
    }
    let options = ReplayOptions {
        threshold: args.threshold,
        cooldown: Duration::from_secs_f64(args.cooldown),
        idle_timeout: Duration::from_secs_f64(args.idle_timeout),
        limit: (args.limit > 0).then_some(args.limit),
        min_confidence: args.min_confidence,
        log_passive_frames: false,
    };

    let records = {
        let _stage = ui.stage("Load archive index");
        purrview::replay::load_archive(&args.archive, options.threshold, options.limit)?
    };
    eprintln!(
        "purrview_replay: {} motion frame(s) in {}",
        records.len(),
        args.archive.display()
    );

    let classifier = build_classifier(&args)?;
    let store = match &args.save {
        Some(db) => {
            eprintln!("purrview_replay: saving sessions to {}", db);
            Some(SqliteSessionStore::open(db)?)
        }
        None => None,
    };
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
    if args.notify {
        notifiers.push(Box::new(LogNotifier::new()));
        #[cfg(feature = "notify-webhook")]
        if let Ok(url) = std::env::var("PURRVIEW_WEBHOOK_URL") {
            notifiers.push(Box::new(purrview::sink::WebhookNotifier::new(&url)?));
        }
    }

    let mut listener = CliListener {
        progress: ui.frames(records.len()),
        store,
        notifiers,
    };
    let mut harness = ReplayHarness::new(options, classifier, &args.archive);
    let report = harness.run(&records, &mut listener)?;
    listener.progress.finish();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "=".repeat(60));
    println!("Sessions detected: {}", report.sessions.len());
    println!("Classify calls:    {}", report.calls);
    println!("Errors:            {}", report.errors);
    println!("Skipped (missing): {}", report.skipped);
    println!("Cooled down:       {}", report.cooled_down);
    if !report.sessions.is_empty() {
        println!();
        print!("{}", report.table());
    }
    Ok(())
}

fn build_classifier(args: &Args) -> Result<Box<dyn Classifier>> {
    if let Some(path) = &args.labels {
        let labels = LabelFileClassifier::open(path)?;
        eprintln!("purrview_replay: {} labelled frame(s) from {}", labels.len(), path.display());
        return Ok(Box::new(labels));
    }
    match &args.classifier_url {
        #[cfg(feature = "classify-http")]
        Some(url) => Ok(Box::new(purrview::classify::HttpClassifier::new(
            url,
            Duration::from_secs(60),
        )?)),
        #[cfg(not(feature = "classify-http"))]
        Some(_) => bail!("--classifier-url needs the classify-http feature"),
        None => bail!("either --labels or --classifier-url is required"),
    }
}
