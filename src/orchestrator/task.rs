// src/orchestrator/task.rs
//
// Durable task state (spec §3/§4.7). Plain data; persistence lives in
// `db::tasks`, control flow in `orchestrator::mod`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Error
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "error" => Ok(TaskStatus::Error),
            other => Err(crate::errors::Error::BadInput(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    Serial,
    Parallel,
}

impl ScrapeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrapeMode::Serial => "serial",
            ScrapeMode::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for ScrapeMode {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(ScrapeMode::Serial),
            "parallel" => Ok(ScrapeMode::Parallel),
            other => Err(crate::errors::Error::BadInput(format!("unknown scrape mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: NaiveDateTime,
    pub scraper: String,
    pub area: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    pub message: String,
}

/// A capped ring buffer (spec §4.7.6). Oldest entries silently drop
/// once `capacity` is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRing {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounters {
    pub total_processed: i64,
    pub total_new: i64,
    pub total_updated: i64,
    pub total_errors: i64,
}

#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub id: String,
    pub status: TaskStatus,
    pub scrapers: Vec<String>,
    pub area_codes: Vec<String>,
    pub max_properties: i64,
    pub force_detail_fetch: bool,
    pub mode: ScrapeMode,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub pause_timestamp: Option<NaiveDateTime>,
    pub counters: TaskCounters,
    pub elapsed_seconds: f64,
    pub logs: LogRing,
    pub error_logs: LogRing,
    pub warning_logs: LogRing,
}

impl ScrapeTask {
    pub fn new(
        id: String,
        scrapers: Vec<String>,
        area_codes: Vec<String>,
        max_properties: i64,
        force_detail_fetch: bool,
        mode: ScrapeMode,
        now: NaiveDateTime,
    ) -> Self {
        ScrapeTask {
            id,
            status: TaskStatus::Pending,
            scrapers,
            area_codes,
            max_properties,
            force_detail_fetch,
            mode,
            created_at: now,
            started_at: None,
            finished_at: None,
            pause_timestamp: None,
            counters: TaskCounters::default(),
            elapsed_seconds: 0.0,
            logs: LogRing::new(50),
            error_logs: LogRing::new(30),
            warning_logs: LogRing::new(50),
        }
    }

    /// Every (scraper, area) pair this task covers, in deterministic
    /// order (spec §4.7.1).
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for scraper in &self.scrapers {
            for area in &self.area_codes {
                out.push((scraper.clone(), area.clone()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeTaskProgress {
    pub status: String,
    pub properties_found: i64,
    pub properties_attempted: i64,
    pub properties_processed: i64,
    pub detail_fetched: i64,
    pub detail_fetch_failed: i64,
    pub detail_skipped: i64,
    pub new_listings: i64,
    pub price_updated: i64,
    pub other_updates: i64,
    pub refetched_unchanged: i64,
    pub save_failed: i64,
    pub price_missing: i64,
    pub building_info_missing: i64,
    pub other_errors: i64,
    pub resume_state: Option<ResumeState>,
}

impl ScrapeTaskProgress {
    /// Merges a delta in, never letting a nonzero value regress to
    /// zero (spec §4.7.5: "Writers must never overwrite a nonzero
    /// value with zero").
    pub fn merge_counters(&mut self, delta: &ScrapeTaskProgress) {
        self.properties_found = self.properties_found.max(delta.properties_found);
        self.properties_attempted = self.properties_attempted.max(delta.properties_attempted);
        self.properties_processed = self.properties_processed.max(delta.properties_processed);
        self.detail_fetched = self.detail_fetched.max(delta.detail_fetched);
        self.detail_fetch_failed = self.detail_fetch_failed.max(delta.detail_fetch_failed);
        self.detail_skipped = self.detail_skipped.max(delta.detail_skipped);
        self.new_listings = self.new_listings.max(delta.new_listings);
        self.price_updated = self.price_updated.max(delta.price_updated);
        self.other_updates = self.other_updates.max(delta.other_updates);
        self.refetched_unchanged = self.refetched_unchanged.max(delta.refetched_unchanged);
        self.save_failed = self.save_failed.max(delta.save_failed);
        self.price_missing = self.price_missing.max(delta.price_missing);
        self.building_info_missing = self.building_info_missing.max(delta.building_info_missing);
        self.other_errors = self.other_errors.max(delta.other_errors);
    }
}

/// The orchestrator's checkpoint (spec §4.7.4), snapshotted every 5s
/// and once at pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub phase: Phase,
    pub current_page: i64,
    pub processed_count: i64,
    pub collected_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    List,
    Detail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn log_ring_drops_oldest_past_capacity() {
        let mut ring = LogRing::new(2);
        let now = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        for i in 0..3 {
            ring.push(LogEntry {
                ts: now,
                scraper: "suumo".to_string(),
                area: "13101".to_string(),
                kind: "new".to_string(),
                url: None,
                message: format!("entry {i}"),
            });
        }
        let messages: Vec<_> = ring.entries().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["entry 1", "entry 2"]);
    }

    #[test]
    fn merge_counters_never_regresses_to_zero() {
        let mut progress = ScrapeTaskProgress {
            properties_processed: 10,
            ..Default::default()
        };
        let delta = ScrapeTaskProgress::default();
        progress.merge_counters(&delta);
        assert_eq!(progress.properties_processed, 10);
    }

    #[test]
    fn pairs_enumerate_deterministically() {
        let task = ScrapeTask::new(
            "t1".to_string(),
            vec!["suumo".to_string(), "homes".to_string()],
            vec!["13101".to_string(), "13102".to_string()],
            100,
            false,
            ScrapeMode::Serial,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        );
        assert_eq!(
            task.pairs(),
            vec![
                ("suumo".to_string(), "13101".to_string()),
                ("suumo".to_string(), "13102".to_string()),
                ("homes".to_string(), "13101".to_string()),
                ("homes".to_string(), "13102".to_string()),
            ]
        );
    }
}
