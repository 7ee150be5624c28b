// src/db/tasks.rs
//
// Persistence for `ScrapeTask`/`ScrapeTaskProgress` (C7, spec §3/§4.7).
// Grounded on the teacher's `scrape_runs` table (see the superseded
// `ScrapeRun`), generalized to the full task/progress-map shape.

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{Error, Result};
use crate::orchestrator::task::{
    LogEntry, LogRing, ScrapeMode, ScrapeTask, ScrapeTaskProgress, TaskCounters, TaskStatus,
};

pub fn insert(conn: &Connection, task: &ScrapeTask) -> Result<()> {
    conn.execute(
        "INSERT INTO scrape_tasks \
            (id, status, scrapers, area_codes, max_properties, force_detail_fetch, mode, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id,
            task.status.as_str(),
            serde_json::to_string(&task.scrapers).unwrap_or_default(),
            serde_json::to_string(&task.area_codes).unwrap_or_default(),
            task.max_properties,
            task.force_detail_fetch,
            task.mode.as_str(),
            task.created_at,
        ],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, task_id: &str, status: TaskStatus) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET status = ?2 WHERE id = ?1",
        params![task_id, status.as_str()],
    )?;
    Ok(())
}

pub fn set_started(conn: &Connection, task_id: &str, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET status = 'running', started_at = ?2 WHERE id = ?1",
        params![task_id, now],
    )?;
    Ok(())
}

pub fn set_finished(conn: &Connection, task_id: &str, status: TaskStatus, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET status = ?2, finished_at = ?3 WHERE id = ?1",
        params![task_id, status.as_str(), now],
    )?;
    Ok(())
}

pub fn set_pause_timestamp(conn: &Connection, task_id: &str, ts: Option<NaiveDateTime>) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET status = ?3, pause_timestamp = ?2 WHERE id = ?1",
        params![task_id, ts, if ts.is_some() { "paused" } else { "running" }],
    )?;
    Ok(())
}

pub fn update_counters(conn: &Connection, task_id: &str, counters: &TaskCounters, elapsed_seconds: f64) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET total_processed = ?2, total_new = ?3, total_updated = ?4, total_errors = ?5, elapsed_seconds = ?6 \
         WHERE id = ?1",
        params![
            task_id,
            counters.total_processed,
            counters.total_new,
            counters.total_updated,
            counters.total_errors,
            elapsed_seconds,
        ],
    )?;
    Ok(())
}

pub fn append_logs(conn: &Connection, task_id: &str, logs: &LogRing, error_logs: &LogRing, warning_logs: &LogRing) -> Result<()> {
    conn.execute(
        "UPDATE scrape_tasks SET logs = ?2, error_logs = ?3, warning_logs = ?4 WHERE id = ?1",
        params![
            task_id,
            serde_json::to_string(&logs.entries().collect::<Vec<_>>()).unwrap_or_default(),
            serde_json::to_string(&error_logs.entries().collect::<Vec<_>>()).unwrap_or_default(),
            serde_json::to_string(&warning_logs.entries().collect::<Vec<_>>()).unwrap_or_default(),
        ],
    )?;
    Ok(())
}

pub fn status(conn: &Connection, task_id: &str) -> Result<Option<TaskStatus>> {
    conn.query_row("SELECT status FROM scrape_tasks WHERE id = ?1", params![task_id], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .map(|s| s.parse().map(Some))
    .unwrap_or(Ok(None))
}

pub fn exists(conn: &Connection, task_id: &str) -> Result<bool> {
    Ok(status(conn, task_id)?.is_some())
}

pub fn pause_timestamp(conn: &Connection, task_id: &str) -> Result<Option<NaiveDateTime>> {
    conn.query_row(
        "SELECT pause_timestamp FROM scrape_tasks WHERE id = ?1",
        params![task_id],
        |row| row.get(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(Error::from)
}

/// Any task rows left `running` at process start get flipped to
/// `paused` (spec §4.7 "Startup recovery").
pub fn recover_running_to_paused(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM scrape_tasks WHERE status = 'running'")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for id in &ids {
        conn.execute("UPDATE scrape_tasks SET status = 'paused' WHERE id = ?1", params![id])?;
    }
    Ok(ids)
}

pub fn list_running_and_paused_newer_than(conn: &Connection) -> Result<Vec<(String, TaskStatus, Option<NaiveDateTime>)>> {
    let mut stmt = conn.prepare("SELECT id, status, pause_timestamp FROM scrape_tasks WHERE status IN ('running', 'paused')")?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(1)?;
        Ok((row.get::<_, String>(0)?, status, row.get::<_, Option<NaiveDateTime>>(2)?))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (id, status, ts) = r?;
        out.push((id, status.parse().unwrap_or(TaskStatus::Error), ts));
    }
    Ok(out)
}

pub fn delete(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute("DELETE FROM scrape_tasks WHERE id = ?1", params![task_id])?;
    Ok(())
}

pub fn list_recent(conn: &Connection, active_only: bool, limit: i64) -> Result<Vec<String>> {
    let sql = if active_only {
        "SELECT id FROM scrape_tasks WHERE status IN ('pending','running','paused') ORDER BY created_at DESC LIMIT ?1"
    } else {
        "SELECT id FROM scrape_tasks ORDER BY created_at DESC LIMIT ?1"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn force_cleanup(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE scrape_tasks SET status = 'cancelled' WHERE status IN ('pending','running','paused')",
        [],
    )?;
    Ok(n)
}

// --- per (task, scraper, area) progress rows ---

pub fn upsert_progress_status(conn: &Connection, task_id: &str, scraper: &str, area: &str, status: &str, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "INSERT INTO scrape_task_progress (task_id, scraper, area, status, last_updated) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(task_id, scraper, area) DO UPDATE SET status = excluded.status, last_updated = excluded.last_updated",
        params![task_id, scraper, area, status, now],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn flush_progress(
    conn: &Connection,
    task_id: &str,
    scraper: &str,
    area: &str,
    progress: &ScrapeTaskProgress,
    now: NaiveDateTime,
) -> Result<()> {
    let resume_state_json = progress
        .resume_state
        .as_ref()
        .map(|s| serde_json::to_string(s).unwrap_or_default());
    conn.execute(
        "UPDATE scrape_task_progress SET \
            properties_found = MAX(properties_found, ?4), \
            properties_attempted = MAX(properties_attempted, ?5), \
            properties_processed = MAX(properties_processed, ?6), \
            detail_fetched = MAX(detail_fetched, ?7), \
            detail_fetch_failed = MAX(detail_fetch_failed, ?8), \
            detail_skipped = MAX(detail_skipped, ?9), \
            new_listings = MAX(new_listings, ?10), \
            price_updated = MAX(price_updated, ?11), \
            other_updates = MAX(other_updates, ?12), \
            refetched_unchanged = MAX(refetched_unchanged, ?13), \
            save_failed = MAX(save_failed, ?14), \
            price_missing = MAX(price_missing, ?15), \
            building_info_missing = MAX(building_info_missing, ?16), \
            other_errors = MAX(other_errors, ?17), \
            resume_state = COALESCE(?18, resume_state), \
            last_updated = ?19 \
         WHERE task_id = ?1 AND scraper = ?2 AND area = ?3",
        params![
            task_id,
            scraper,
            area,
            progress.properties_found,
            progress.properties_attempted,
            progress.properties_processed,
            progress.detail_fetched,
            progress.detail_fetch_failed,
            progress.detail_skipped,
            progress.new_listings,
            progress.price_updated,
            progress.other_updates,
            progress.refetched_unchanged,
            progress.save_failed,
            progress.price_missing,
            progress.building_info_missing,
            progress.other_errors,
            resume_state_json,
            now,
        ],
    )?;
    Ok(())
}

pub fn last_updated_for_task(conn: &Connection, task_id: &str) -> Result<Option<NaiveDateTime>> {
    conn.query_row(
        "SELECT MAX(last_updated) FROM scrape_task_progress WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
    .map_err(Error::from)
}

#[allow(dead_code)]
pub fn mode(conn: &Connection, task_id: &str) -> Result<Option<ScrapeMode>> {
    conn.query_row("SELECT mode FROM scrape_tasks WHERE id = ?1", params![task_id], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .map(|s| s.parse().map(Some))
    .unwrap_or(Ok(None))
}

/// Full task row as the CLI's `status` command needs it (spec §6
/// `GET status(task_id)` — "the full task row + progress map + latest
/// log slices").
#[derive(Debug, Clone)]
pub struct TaskSummary {
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
    pub recent_logs: Vec<LogEntry>,
    pub recent_error_logs: Vec<LogEntry>,
    pub recent_warning_logs: Vec<LogEntry>,
}

pub fn get_summary(conn: &Connection, task_id: &str) -> Result<Option<TaskSummary>> {
    let row: Option<(
        String,
        String,
        String,
        i64,
        bool,
        String,
        NaiveDateTime,
        Option<NaiveDateTime>,
        Option<NaiveDateTime>,
        Option<NaiveDateTime>,
        i64,
        i64,
        i64,
        i64,
        f64,
        String,
        String,
        String,
    )> = conn
        .query_row(
            "SELECT status, scrapers, area_codes, max_properties, force_detail_fetch, mode, \
                created_at, started_at, finished_at, pause_timestamp, \
                total_processed, total_new, total_updated, total_errors, elapsed_seconds, \
                logs, error_logs, warning_logs \
             FROM scrape_tasks WHERE id = ?1",
            params![task_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                    row.get(14)?,
                    row.get(15)?,
                    row.get(16)?,
                    row.get(17)?,
                ))
            },
        )
        .optional()?;

    let Some((
        status,
        scrapers_json,
        areas_json,
        max_properties,
        force_detail_fetch,
        mode,
        created_at,
        started_at,
        finished_at,
        pause_timestamp,
        total_processed,
        total_new,
        total_updated,
        total_errors,
        elapsed_seconds,
        logs_json,
        error_logs_json,
        warning_logs_json,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(TaskSummary {
        id: task_id.to_string(),
        status: status.parse()?,
        scrapers: serde_json::from_str(&scrapers_json).unwrap_or_default(),
        area_codes: serde_json::from_str(&areas_json).unwrap_or_default(),
        max_properties,
        force_detail_fetch,
        mode: mode.parse()?,
        created_at,
        started_at,
        finished_at,
        pause_timestamp,
        counters: TaskCounters {
            total_processed,
            total_new,
            total_updated,
            total_errors,
        },
        elapsed_seconds,
        recent_logs: serde_json::from_str(&logs_json).unwrap_or_default(),
        recent_error_logs: serde_json::from_str(&error_logs_json).unwrap_or_default(),
        recent_warning_logs: serde_json::from_str(&warning_logs_json).unwrap_or_default(),
    }))
}

/// One row per `(scraper, area)` pair the task covers (spec §3
/// `ScrapeTaskProgress`), for the `progress_detail` map in `status`.
pub fn get_progress_map(conn: &Connection, task_id: &str) -> Result<Vec<(String, String, ScrapeTaskProgress)>> {
    let mut stmt = conn.prepare(
        "SELECT scraper, area, status, properties_found, properties_attempted, properties_processed, \
            detail_fetched, detail_fetch_failed, detail_skipped, new_listings, price_updated, \
            other_updates, refetched_unchanged, save_failed, price_missing, building_info_missing, \
            other_errors, resume_state \
         FROM scrape_task_progress WHERE task_id = ?1",
    )?;
    let rows = stmt.query_map(params![task_id], |row| {
        let scraper: String = row.get(0)?;
        let area: String = row.get(1)?;
        let resume_state_json: Option<String> = row.get(17)?;
        let progress = ScrapeTaskProgress {
            status: row.get(2)?,
            properties_found: row.get(3)?,
            properties_attempted: row.get(4)?,
            properties_processed: row.get(5)?,
            detail_fetched: row.get(6)?,
            detail_fetch_failed: row.get(7)?,
            detail_skipped: row.get(8)?,
            new_listings: row.get(9)?,
            price_updated: row.get(10)?,
            other_updates: row.get(11)?,
            refetched_unchanged: row.get(12)?,
            save_failed: row.get(13)?,
            price_missing: row.get(14)?,
            building_info_missing: row.get(15)?,
            other_errors: row.get(16)?,
            resume_state: resume_state_json.and_then(|j| serde_json::from_str(&j).ok()),
        };
        Ok((scraper, area, progress))
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 28).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    #[test]
    fn insert_then_status_roundtrip() {
        let db = test_db();
        db.with_conn(|conn| {
            let task = ScrapeTask::new(
                "t1".to_string(),
                vec!["suumo".to_string()],
                vec!["13101".to_string()],
                50,
                false,
                ScrapeMode::Serial,
                now(),
            );
            insert(conn, &task)?;
            assert_eq!(status(conn, "t1")?, Some(TaskStatus::Pending));
            set_started(conn, "t1", now())?;
            assert_eq!(status(conn, "t1")?, Some(TaskStatus::Running));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn recover_running_flips_to_paused() {
        let db = test_db();
        db.with_conn(|conn| {
            let task = ScrapeTask::new("t1".to_string(), vec![], vec![], 0, false, ScrapeMode::Serial, now());
            insert(conn, &task)?;
            set_started(conn, "t1", now())?;
            let recovered = recover_running_to_paused(conn)?;
            assert_eq!(recovered, vec!["t1".to_string()]);
            assert_eq!(status(conn, "t1")?, Some(TaskStatus::Paused));
            Ok(())
        })
        .unwrap();
    }
}
