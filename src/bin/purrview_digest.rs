//! purrview_digest - per-cat feeding digest for one UTC day.
//!
//! Compares the day against the preceding week and flags cats that did not
//! eat (or ate much less than usual).

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::io::IsTerminal;

use purrview::digest::{summarize, utc_day_start, DAY_SECS};
use purrview::sink::{SessionStore, SqliteSessionStore};
use purrview::ui::Ui;

#[derive(Parser, Debug)]
#[command(name = "purrview_digest", about = "Daily per-cat feeding digest")]
struct Args {
    /// Path to the PurrView SQLite DB
    #[arg(long, env = "PURRVIEW_DB_PATH", default_value = "purrview.db")]
    db: String,

    /// Day to summarize (YYYY-MM-DD, UTC); defaults to yesterday
    #[arg(long, value_name = "DATE")]
    date: Option<String>,

    /// Days of history used as the baseline
    #[arg(long, default_value_t = 7)]
    baseline_days: u32,

    /// Print the digest as JSON
    #[arg(long)]
    json: bool,

    /// Post the digest card to PURRVIEW_WEBHOOK_URL
    #[arg(long)]
    notify: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal(), args.json);

    let (day_start, label) = match &args.date {
        Some(date) => {
            let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| anyhow!("invalid --date '{}': {}", date, e))?;
            let start = day
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| anyhow!("invalid --date '{}'", date))?
                .and_utc()
                .timestamp() as f64;
            (start, date.clone())
        }
        None => {
            let start = utc_day_start(purrview::now_s()?) - DAY_SECS;
            let label = chrono::DateTime::<chrono::Utc>::from_timestamp(start as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| format!("{:.0}", start));
            (start, label)
        }
    };
    let day_end = day_start + DAY_SECS;
    let baseline_start = day_start - DAY_SECS * f64::from(args.baseline_days);

    let (day, baseline) = {
        let _stage = ui.stage("Query sessions");
        let mut store = SqliteSessionStore::open(&args.db)?;
        // Windows on end time; summarize filters again on start time.
        let day = store.sessions_between(day_start, day_end + DAY_SECS)?;
        let baseline = store.sessions_between(baseline_start, day_start + DAY_SECS)?;
        (day, baseline)
    };
    let baseline: Vec<_> = baseline
        .into_iter()
        .filter(|s| s.started_at >= baseline_start && s.started_at < day_start)
        .collect();

    let digest = summarize(&day, day_start, day_end, &label).with_baseline(&baseline, args.baseline_days);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&digest)?);
    } else {
        print!("{}", digest.render());
    }

    if args.notify {
        send(&digest)?;
    }
    Ok(())
}

#[cfg(feature = "notify-webhook")]
fn send(digest: &purrview::digest::Digest) -> Result<()> {
    let url = std::env::var("PURRVIEW_WEBHOOK_URL")
        .map_err(|_| anyhow!("--notify needs PURRVIEW_WEBHOOK_URL"))?;
    purrview::sink::WebhookNotifier::new(&url)?.send_digest(digest)?;
    log::info!("digest sent");
    Ok(())
}

#[cfg(not(feature = "notify-webhook"))]
fn send(_digest: &purrview::digest::Digest) -> Result<()> {
    Err(anyhow!("--notify needs the notify-webhook feature"))
}
