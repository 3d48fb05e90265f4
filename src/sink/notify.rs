use anyhow::Result;
use chrono::{DateTime, Utc};

use super::Notifier;
use crate::CompletedSession;

/// "HH:MM - HH:MM" in UTC for a session's observed span.
pub(crate) fn time_range(started_at: f64, ended_at: f64) -> String {
    let fmt = |ts: f64| {
        DateTime::<Utc>::from_timestamp(ts.floor() as i64, 0)
            .map(|dt| dt.format("%H:%M").to_string())
            .unwrap_or_else(|| "??:??".to_string())
    };
    format!("{} - {}", fmt(started_at), fmt(ended_at))
}

/// Logs a one-line summary per completed session.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    sent: u64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&mut self, completed: &CompletedSession) -> Result<()> {
        self.sent += 1;
        log::info!(
            "{} at {} (session {})",
            completed.summary(),
            time_range(completed.session.started_at, completed.session.last_seen_at),
            &completed.id()[..12]
        );
        Ok(())
    }
}

#[cfg(feature = "notify-webhook")]
pub use webhook::WebhookNotifier;

#[cfg(feature = "notify-webhook")]
mod webhook {
    use anyhow::{anyhow, bail, Context, Result};
    use serde_json::{json, Value};
    use std::time::Duration;
    use url::Url;

    use super::time_range;
    use crate::digest::Digest;
    use crate::sink::Notifier;
    use crate::{Activity, CompletedSession};

    /// Posts interactive cards to a chat webhook (Lark/Feishu card schema).
    pub struct WebhookNotifier {
        agent: ureq::Agent,
        url: String,
    }

    impl WebhookNotifier {
        pub fn new(webhook_url: &str) -> Result<Self> {
            let url = Url::parse(webhook_url).context("parse webhook url")?;
            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(anyhow!("webhook url must be http(s)"));
            }
            let agent = ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build();
            Ok(Self {
                agent,
                url: url.to_string(),
            })
        }

        pub fn send_digest(&mut self, digest: &Digest) -> Result<()> {
            let breakdown = if digest.entities.is_empty() {
                "No feedings recorded".to_string()
            } else {
                digest
                    .entities
                    .iter()
                    .map(|e| {
                        format!(
                            "**{}**: {} meal(s), ~{:.0} min{}",
                            e.entity,
                            e.count(Activity::Eating),
                            e.minutes(Activity::Eating),
                            e.alert.map(|a| format!(" ({})", a)).unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            let card = json!({
                "msg_type": "interactive",
                "card": {
                    "header": {
                        "template": "blue",
                        "title": {"tag": "plain_text", "content": format!("PurrView Daily - {}", digest.label)},
                    },
                    "elements": [
                        {"tag": "div", "fields": [
                            short_field("Total feedings", &digest.total(Activity::Eating).to_string()),
                            short_field("Cats fed", &digest.entities_with(Activity::Eating).to_string()),
                        ]},
                        {"tag": "hr"},
                        {"tag": "div", "text": {"tag": "lark_md", "content": breakdown}},
                    ],
                },
            });
            self.post(&card)
        }

        fn post(&self, payload: &Value) -> Result<()> {
            let response = self
                .agent
                .post(&self.url)
                .send_json(payload.clone())
                .context("post webhook card")?;
            let body: Value = response.into_json().context("decode webhook response")?;
            match body.get("code").and_then(Value::as_i64) {
                Some(0) | None => Ok(()),
                Some(code) => bail!("webhook rejected card (code {}): {}", code, body),
            }
        }
    }

    fn short_field(title: &str, value: &str) -> Value {
        json!({
            "is_short": true,
            "text": {"tag": "lark_md", "content": format!("**{}**\n{}", title, value)},
        })
    }

    impl Notifier for WebhookNotifier {
        fn name(&self) -> &'static str {
            "webhook"
        }

        fn notify(&mut self, completed: &CompletedSession) -> Result<()> {
            let session = &completed.session;
            let verb = match session.activity {
                Activity::Drinking => "just drank",
                _ => "just ate",
            };
            let card = json!({
                "msg_type": "interactive",
                "card": {
                    "header": {
                        "template": "green",
                        "title": {"tag": "plain_text", "content": format!("{} {}!", session.entity, verb)},
                    },
                    "elements": [
                        {"tag": "div", "fields": [
                            short_field("Cat", &session.entity),
                            short_field("Activity", session.activity.as_str()),
                        ]},
                        {"tag": "div", "fields": [
                            short_field("Duration", &format!("{:.1} min", session.duration_secs() / 60.0)),
                            short_field("Frames", &session.frames.len().to_string()),
                        ]},
                        {"tag": "hr"},
                        {"tag": "note", "elements": [
                            {"tag": "plain_text", "content": time_range(session.started_at, session.last_seen_at)},
                        ]},
                    ],
                },
            });
            self.post(&card)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activity, EndReason, FrameRef, Session};

    #[test]
    fn formats_utc_time_range() {
        // 2024-01-01T08:30:00Z .. 08:45:00Z
        assert_eq!(time_range(1_704_097_800.0, 1_704_098_700.0), "08:30 - 08:45");
    }

    #[test]
    fn log_notifier_counts() {
        let mut notifier = LogNotifier::new();
        let completed = CompletedSession {
            session: Session::open("Mochi", Activity::Eating, 100.0, FrameRef::new("a.jpg", 100.0, 1.0)),
            reason: EndReason::Flushed,
            closed_at: 100.0,
        };
        notifier.notify(&completed).unwrap();
        assert_eq!(notifier.sent(), 1);
        assert_eq!(notifier.name(), "log");
    }
}
