//! Statistics derived from stored events.
//!
//! Payloads are opaque JSON produced by the webhook layer. [`MemoryView`]
//! picks out the handful of fields statistics care about, each behind an
//! explicit presence check; anything missing or of the wrong shape counts
//! as zero. Results are computed on demand and never cached.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use memvault_core::object::{Payload, StoredObject};
use memvault_core::types::UserId;
use memvault_core::Result;

use crate::fallback::FallbackCoordinator;

/// The statistics-relevant fields of one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryView {
    /// Duration in seconds.
    pub duration_secs: f64,
    pub language: Option<String>,
    /// `YYYY-MM-DD` the memory was created on.
    pub day: Option<String>,
    pub word_count: usize,
    pub action_items: usize,
    pub insights: usize,
}

impl MemoryView {
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            duration_secs: duration_secs(payload),
            language: payload
                .get("language")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            day: payload
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(parse_time)
                .map(|t| t.format("%Y-%m-%d").to_string()),
            word_count: word_count(payload),
            action_items: payload
                .get("structured")
                .and_then(|s| s.get("action_items"))
                .map(array_len)
                .unwrap_or(0),
            insights: payload
                .get("insights")
                .or_else(|| payload.get("structured").and_then(|s| s.get("insights")))
                .map(array_len)
                .unwrap_or(0),
        }
    }

    /// View of a stored object; the day falls back to the event time.
    pub fn from_object(object: &StoredObject) -> Self {
        let mut view = Self::from_payload(&object.payload);
        if view.day.is_none() {
            view.day = Some(object.event_time().format("%Y-%m-%d").to_string());
        }
        view
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `duration`, else `finished_at - started_at`. Never negative.
fn duration_secs(payload: &Payload) -> f64 {
    let explicit = payload.get("duration").and_then(number);
    let derived = || {
        let started = payload.get("started_at")?.as_str().and_then(parse_time)?;
        let finished = payload.get("finished_at")?.as_str().and_then(parse_time)?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    };
    explicit
        .or_else(derived)
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0)
}

fn word_count(payload: &Payload) -> usize {
    let Some(segments) = payload.get("transcript_segments").and_then(Value::as_array) else {
        return 0;
    };
    segments
        .iter()
        .filter_map(|s| s.get("text").and_then(Value::as_str))
        .map(|text| text.split_whitespace().count())
        .sum()
}

fn array_len(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

/// Summary statistics over a set of memories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_memories: usize,
    pub total_duration_minutes: u64,
    pub average_duration_minutes: u64,
    /// Distinct languages, sorted.
    pub languages: Vec<String>,
    pub most_active_day: Option<String>,
    pub total_words: usize,
    pub total_action_items: usize,
    pub total_insights: usize,
}

impl UserStats {
    /// Aggregate `objects` in iteration order.
    pub fn from_objects(objects: &[StoredObject]) -> Self {
        if objects.is_empty() {
            return Self::default();
        }

        let mut total_secs = 0.0;
        let mut languages = Vec::new();
        // Insertion-ordered so ties go to the first day encountered.
        let mut days: Vec<(String, usize)> = Vec::new();
        let mut stats = Self {
            total_memories: objects.len(),
            ..Self::default()
        };

        for object in objects {
            let view = MemoryView::from_object(object);
            total_secs += view.duration_secs;
            stats.total_words += view.word_count;
            stats.total_action_items += view.action_items;
            stats.total_insights += view.insights;
            if let Some(language) = view.language {
                languages.push(language);
            }
            if let Some(day) = view.day {
                match days.iter_mut().find(|(d, _)| *d == day) {
                    Some((_, count)) => *count += 1,
                    None => days.push((day, 1)),
                }
            }
        }

        languages.sort();
        languages.dedup();
        stats.languages = languages;

        let mut best: Option<&(String, usize)> = None;
        for entry in &days {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        stats.most_active_day = best.map(|(day, _)| day.clone());

        stats.total_duration_minutes = (total_secs / 60.0).round() as u64;
        stats.average_duration_minutes =
            (total_secs / objects.len() as f64 / 60.0).round() as u64;
        stats
    }
}

/// Statistics over one day's events across all users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub unique_users: usize,
    pub summary: UserStats,
}

/// Computes statistics by scanning stored objects through the coordinator.
pub struct StatsAggregator {
    coordinator: Arc<FallbackCoordinator>,
    scan_limit: usize,
}

impl StatsAggregator {
    pub fn new(coordinator: Arc<FallbackCoordinator>, scan_limit: usize) -> Self {
        Self {
            coordinator,
            scan_limit,
        }
    }

    /// Statistics over a user's most recent objects.
    pub async fn user_stats(&self, user_id: &UserId) -> Result<UserStats> {
        let objects = self
            .coordinator
            .list_user_objects(user_id, self.scan_limit)
            .await?;
        debug!(user_id = %user_id, scanned = objects.len(), "Computed user stats");
        Ok(UserStats::from_objects(&objects))
    }

    /// Statistics over today's (UTC) events.
    pub async fn daily_stats(&self) -> Result<DailyStats> {
        let objects = self
            .coordinator
            .list_daily_objects(self.scan_limit)
            .await?;
        let unique_users = objects
            .iter()
            .map(|o| &o.metadata.user_id)
            .collect::<HashSet<_>>()
            .len();
        Ok(DailyStats {
            date: Utc::now().date_naive(),
            unique_users,
            summary: UserStats::from_objects(&objects),
        })
    }
}
