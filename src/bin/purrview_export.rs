//! purrview_export - dump stored sessions as JSON.

use anyhow::{bail, Result};
use clap::Parser;
use std::io::IsTerminal;

use purrview::replay::parse_timestamp;
use purrview::sink::{SessionStore, SqliteSessionStore};
use purrview::ui::Ui;

#[derive(Parser, Debug)]
#[command(name = "purrview_export", about = "Export stored feeding sessions as JSON")]
struct Args {
    /// Path to the PurrView SQLite DB
    #[arg(long, env = "PURRVIEW_DB_PATH", default_value = "purrview.db")]
    db: String,

    /// Window start (unix seconds or RFC 3339); default: 24h ago
    #[arg(long)]
    from: Option<String>,

    /// Window end (unix seconds or RFC 3339); default: now
    #[arg(long)]
    to: Option<String>,

    /// One JSON object per line instead of a pretty array
    #[arg(long)]
    jsonl: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal(), !stdout_is_tty);

    let now = purrview::now_s()?;
    let to = match &args.to {
        Some(t) => parse_timestamp(t)?,
        None => now,
    };
    let from = match &args.from {
        Some(t) => parse_timestamp(t)?,
        None => to - 86_400.0,
    };
    if from >= to {
        bail!("--from must be earlier than --to");
    }

    let sessions = {
        let _stage = ui.stage("Read sessions");
        SqliteSessionStore::open(&args.db)?.sessions_between(from, to)?
    };

    if args.jsonl {
        for s in &sessions {
            println!("{}", serde_json::to_string(s)?);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    }
    eprintln!("purrview_export: {} session(s)", sessions.len());
    Ok(())
}
