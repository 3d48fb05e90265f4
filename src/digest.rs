//! Daily feeding digest over stored sessions.
//!
//! Aggregates one window (normally yesterday, UTC) into per-cat session
//! counts and minutes per activity, and compares eating against a baseline
//! window to flag cats that stopped or nearly stopped eating.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::sink::StoredSession;
use crate::{Activity, Timestamp};

pub const DAY_SECS: f64 = 86_400.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlert {
    /// No eating in the window although the baseline averages at least one meal a day.
    NoEating,
    /// At most one meal although the baseline averages two or more.
    LowEating,
}

impl fmt::Display for DigestAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlert::NoEating => f.write_str("NO EATING"),
            DigestAlert::LowEating => f.write_str("LOW"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ActivityTotals {
    pub sessions: u32,
    pub minutes: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityDigest {
    pub entity: String,
    pub activities: BTreeMap<Activity, ActivityTotals>,
    /// Baseline sessions per day for eating, when a baseline was supplied.
    pub baseline_eating_per_day: Option<f64>,
    pub alert: Option<DigestAlert>,
}

impl EntityDigest {
    fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            activities: BTreeMap::new(),
            baseline_eating_per_day: None,
            alert: None,
        }
    }

    pub fn count(&self, activity: Activity) -> u32 {
        self.activities.get(&activity).map_or(0, |t| t.sessions)
    }

    pub fn minutes(&self, activity: Activity) -> f64 {
        self.activities.get(&activity).map_or(0.0, |t| t.minutes)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Digest {
    /// Human label for the window, e.g. `2026-02-20`.
    pub label: String,
    pub from: Timestamp,
    pub to: Timestamp,
    /// Sorted by entity id.
    pub entities: Vec<EntityDigest>,
}

impl Digest {
    pub fn total(&self, activity: Activity) -> u32 {
        self.entities.iter().map(|e| e.count(activity)).sum()
    }

    /// Number of entities with at least one session of `activity`.
    pub fn entities_with(&self, activity: Activity) -> usize {
        self.entities.iter().filter(|e| e.count(activity) > 0).count()
    }

    pub fn entity(&self, entity: &str) -> Option<&EntityDigest> {
        self.entities.iter().find(|e| e.entity == entity)
    }

    /// Compare eating against `baseline` sessions spanning `baseline_days`.
    ///
    /// Entities present only in the baseline are added with zero counts so
    /// that a cat who stopped eating still shows up.
    pub fn with_baseline(mut self, baseline: &[StoredSession], baseline_days: u32) -> Self {
        let days = f64::from(baseline_days.max(1));
        let mut per_entity: BTreeMap<&str, u32> = BTreeMap::new();
        for s in baseline.iter().filter(|s| s.activity == Activity::Eating) {
            *per_entity.entry(s.entity.as_str()).or_default() += 1;
        }
        for entity in per_entity.keys() {
            if self.entity(entity).is_none() {
                self.entities.push(EntityDigest::new(entity));
            }
        }
        self.entities.sort_by(|a, b| a.entity.cmp(&b.entity));

        for e in self.entities.iter_mut() {
            let avg = f64::from(per_entity.get(e.entity.as_str()).copied().unwrap_or(0)) / days;
            let eaten = e.count(Activity::Eating);
            e.baseline_eating_per_day = Some(avg);
            e.alert = if eaten == 0 && avg >= 1.0 {
                Some(DigestAlert::NoEating)
            } else if avg >= 2.0 && eaten <= 1 {
                Some(DigestAlert::LowEating)
            } else {
                None
            };
        }
        self
    }

    /// Plain-text table for terminals.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Digest {}: {} eating, {} drinking session(s)\n",
            self.label,
            self.total(Activity::Eating),
            self.total(Activity::Drinking)
        );
        out.push_str(&format!(
            "  {:<10} {:>4} {:>7} {:>6} {:>7} {:>6}  {}\n",
            "Cat", "Eat", "Min", "Drink", "Min", "Avg", "Alert"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(52)));
        if self.entities.is_empty() {
            out.push_str("  No feedings recorded\n");
        }
        for e in &self.entities {
            let avg = e
                .baseline_eating_per_day
                .map(|a| format!("{:.1}", a))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  {:<10} {:>4} {:>7.1} {:>6} {:>7.1} {:>6}  {}\n",
                e.entity,
                e.count(Activity::Eating),
                e.minutes(Activity::Eating),
                e.count(Activity::Drinking),
                e.minutes(Activity::Drinking),
                avg,
                e.alert.map(|a| a.to_string()).unwrap_or_default()
            ));
        }
        out
    }
}

/// Aggregate sessions that started within `[from, to)`.
pub fn summarize(sessions: &[StoredSession], from: Timestamp, to: Timestamp, label: &str) -> Digest {
    let mut entities: BTreeMap<String, EntityDigest> = BTreeMap::new();
    for s in sessions.iter().filter(|s| s.started_at >= from && s.started_at < to) {
        let entry = entities
            .entry(s.entity.clone())
            .or_insert_with(|| EntityDigest::new(&s.entity));
        let totals = entry.activities.entry(s.activity).or_default();
        totals.sessions += 1;
        totals.minutes += s.duration_secs().max(0.0) / 60.0;
    }
    Digest {
        label: label.to_string(),
        from,
        to,
        entities: entities.into_values().collect(),
    }
}

/// Start of the UTC day containing `ts`.
pub fn utc_day_start(ts: Timestamp) -> Timestamp {
    (ts / DAY_SECS).floor() * DAY_SECS
}
