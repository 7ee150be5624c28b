// src/orchestrator/mod.rs
//
// C7 — Scrape Task Orchestrator (spec §4.7). Owns the persisted task
// state machine, cooperative pause/cancel, durable checkpointing, and
// the per-pair scrape loop. `parallel` (C8) fans a task's pairs out
// across a bounded worker pool instead of running them serially.

pub mod parallel;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::cache::RecentUpdatesCache;
use crate::config::Settings;
use crate::db::connection::Database;
use crate::db::tasks as db_tasks;
use crate::db::tasks::TaskSummary;
use crate::errors::{Error, Result};
use crate::identity;
use crate::scraper::{HomesScraper, ScrapeFlags, Scraper, SuumoScraper};
use crate::voting;

use task::{LogEntry, LogRing, ResumeState, ScrapeMode, ScrapeTask, ScrapeTaskProgress, TaskCounters, TaskStatus};

/// A task's pause/cancel pair (spec §4.7.2): level-triggered, shared by
/// reference with the in-flight scraper instance so a pause set by one
/// thread is visible to the worker without reconstructing anything.
#[derive(Clone)]
pub struct ControlFlags {
    pub pause: Arc<AtomicBool>,
    pub cancel: Arc<AtomicBool>,
    /// Set by the watchdog, alongside `cancel`, when it is unwinding a
    /// *running* (not paused) stalled task — spec §4.7 "stall detect"
    /// wants that case to land on `error`, not the ordinary `cancelled`
    /// a user-initiated cancel produces.
    stall_as_error: Arc<AtomicBool>,
}

impl ControlFlags {
    fn new() -> Self {
        ControlFlags {
            pause: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            stall_as_error: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Safe-point check (spec §4.7.3). Cancel wins over pause: a cancel set
/// while paused must unwind the waiter, not trap it.
pub fn observe_safe_point(flags: &ControlFlags) -> Result<()> {
    loop {
        if flags.cancel.load(Ordering::SeqCst) {
            return Err(Error::TaskCancelled);
        }
        if flags.pause.load(Ordering::SeqCst) {
            thread::sleep(StdDuration::from_millis(100));
            continue;
        }
        return Ok(());
    }
}

struct TaskHandle {
    #[allow(dead_code)]
    mode: ScrapeMode,
}

/// Holds the three in-memory caches spec §5 requires, plus the handles
/// every control operation needs to reach a running worker. Locks are
/// always acquired `tasks -> instances -> flags` to avoid deadlock
/// (spec §5).
pub struct TaskRegistry {
    db: Database,
    settings: Settings,
    cache: Arc<RecentUpdatesCache>,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    instances: Mutex<HashMap<String, Arc<dyn Scraper>>>,
    flags: Mutex<HashMap<String, ControlFlags>>,
}

fn new_task_id() -> String {
    format!(
        "task-{}-{:06x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>() & 0xFFFFFF
    )
}

fn build_scraper(name: &str, flags: ControlFlags, db: Database, detail_refetch_hours: i64) -> Result<Arc<dyn Scraper>> {
    let client = crate::scraper::build_client()
        .map_err(|e| Error::NetworkTransient(e.to_string()))?;
    match name {
        "suumo" => Ok(Arc::new(SuumoScraper::new(client, flags, db, detail_refetch_hours))),
        "homes" => Ok(Arc::new(HomesScraper::new(client, flags, db, detail_refetch_hours))),
        other => Err(Error::BadInput(format!("unknown scraper '{other}'"))),
    }
}

impl TaskRegistry {
    pub fn new(db: Database, settings: Settings) -> Arc<Self> {
        let cache = Arc::new(RecentUpdatesCache::new(settings.recent_updates_cache_ttl));
        Arc::new(TaskRegistry {
            db,
            settings,
            cache,
            tasks: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            flags: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &Arc<RecentUpdatesCache> {
        &self.cache
    }

    /// Startup recovery (spec §4.7): any row left `running` from a prior
    /// process is rewritten to `paused`, since this process cannot know
    /// whether its worker thread survived.
    pub fn recover_on_startup(&self) -> Result<Vec<String>> {
        self.db.with_conn(|conn| db_tasks::recover_running_to_paused(conn))
    }

    /// `POST start(...)` (spec §6). Spawns the worker thread and returns
    /// immediately with the new task id.
    pub fn start(
        self: &Arc<Self>,
        scrapers: Vec<String>,
        area_codes: Vec<String>,
        max_properties: i64,
        force_detail_fetch: bool,
        mode: ScrapeMode,
    ) -> Result<String> {
        if scrapers.is_empty() || area_codes.is_empty() {
            return Err(Error::BadInput("start requires at least one scraper and one area".to_string()));
        }
        if max_properties <= 0 {
            return Err(Error::BadInput("max_properties must be positive".to_string()));
        }

        let id = new_task_id();
        let now = Utc::now().naive_utc();
        let task = ScrapeTask::new(id.clone(), scrapers, area_codes, max_properties, force_detail_fetch, mode, now);
        self.db.with_conn(|conn| db_tasks::insert(conn, &task))?;

        let flags = ControlFlags::new();
        {
            let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
            tasks.insert(id.clone(), TaskHandle { mode });
            let mut flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.insert(id.clone(), flags.clone());
        }

        let registry = Arc::clone(self);
        let task_id = id.clone();
        thread::spawn(move || registry.run_task(task_id, task, flags, HashSet::new(), HashMap::new()));

        Ok(id)
    }

    /// `POST resume(task_id)` (spec §4.7.4). Reuses the live flags if
    /// this process already has them; otherwise reconstructs a worker
    /// from the persisted task row and per-pair progress.
    pub fn resume(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let status = self
            .db
            .with_conn(|conn| db_tasks::status(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if status != TaskStatus::Paused {
            return Err(Error::Precondition(format!("task {task_id} is not paused")));
        }

        let existing = {
            let flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.get(task_id).cloned()
        };

        if let Some(flags) = existing {
            flags.pause.store(false, Ordering::SeqCst);
            self.db.with_conn(|conn| db_tasks::set_pause_timestamp(conn, task_id, None))?;
            return Ok(());
        }

        self.respawn_from_paused(task_id)
    }

    fn respawn_from_paused(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let summary = self
            .db
            .with_conn(|conn| db_tasks::get_summary(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        let progress = self.db.with_conn(|conn| db_tasks::get_progress_map(conn, task_id))?;

        let completed: HashSet<(String, String)> = progress
            .iter()
            .filter(|(_, _, p)| p.status == "completed")
            .map(|(s, a, _)| (s.clone(), a.clone()))
            .collect();
        let resume_states: HashMap<(String, String), ResumeState> = progress
            .into_iter()
            .filter_map(|(s, a, p)| p.resume_state.map(|rs| ((s, a), rs)))
            .collect();

        let task = ScrapeTask {
            id: summary.id.clone(),
            status: TaskStatus::Paused,
            scrapers: summary.scrapers,
            area_codes: summary.area_codes,
            max_properties: summary.max_properties,
            force_detail_fetch: summary.force_detail_fetch,
            mode: summary.mode,
            created_at: summary.created_at,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            pause_timestamp: None,
            counters: summary.counters,
            elapsed_seconds: summary.elapsed_seconds,
            logs: LogRing::new(50),
            error_logs: LogRing::new(30),
            warning_logs: LogRing::new(50),
        };

        let flags = ControlFlags::new();
        {
            let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
            tasks.insert(task_id.to_string(), TaskHandle { mode: task.mode });
            let mut flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.insert(task_id.to_string(), flags.clone());
        }
        self.db.with_conn(|conn| db_tasks::set_pause_timestamp(conn, task_id, None))?;

        let registry = Arc::clone(self);
        let id = task_id.to_string();
        thread::spawn(move || registry.run_task(id, task, flags, completed, resume_states));
        Ok(())
    }

    /// `POST pause(task_id)` (spec §4.7). Only a live, running task can
    /// be paused — a safe point picks the flag up, never the mutex.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let status = self
            .db
            .with_conn(|conn| db_tasks::status(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if status != TaskStatus::Running {
            return Err(Error::Precondition(format!("task {task_id} is not running")));
        }
        let flags = {
            let flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.get(task_id).cloned()
        }
        .ok_or_else(|| Error::Conflict(format!("task {task_id} has no live worker to pause")))?;

        flags.pause.store(true, Ordering::SeqCst);
        let now = Utc::now().naive_utc();
        self.db.with_conn(|conn| db_tasks::set_pause_timestamp(conn, task_id, Some(now)))?;
        Ok(())
    }

    /// `POST cancel(task_id)` (spec §5: "cancel during pause clears
    /// pause"). A task with no live worker (e.g. paused across a
    /// process restart) is finalized directly since there's no thread
    /// left to observe the flag.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let status = self
            .db
            .with_conn(|conn| db_tasks::status(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if status.is_terminal() {
            return Err(Error::Precondition(format!("task {task_id} is already terminal")));
        }

        let flags = {
            let flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.get(task_id).cloned()
        };

        match flags {
            Some(flags) => {
                flags.cancel.store(true, Ordering::SeqCst);
                flags.pause.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => {
                let now = Utc::now().naive_utc();
                self.db.with_conn(|conn| db_tasks::set_finished(conn, task_id, TaskStatus::Cancelled, now))
            }
        }
    }

    /// `POST force_cleanup` (spec §6): flips every non-terminal task to
    /// `cancelled`, fanning cancel out to any live workers first.
    pub fn force_cleanup(&self) -> Result<usize> {
        let live_ids: Vec<String> = {
            let flag_map = self.flags.lock().expect("flags mutex poisoned");
            flag_map.keys().cloned().collect()
        };
        for id in live_ids {
            let flags = {
                let flag_map = self.flags.lock().expect("flags mutex poisoned");
                flag_map.get(&id).cloned()
            };
            if let Some(flags) = flags {
                flags.cancel.store(true, Ordering::SeqCst);
                flags.pause.store(false, Ordering::SeqCst);
            }
        }
        self.db.with_conn(|conn| db_tasks::force_cleanup(conn))
    }

    /// `DELETE task(task_id)` (spec §6): only for terminal tasks.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let status = self
            .db
            .with_conn(|conn| db_tasks::status(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if !status.is_terminal() {
            return Err(Error::Precondition(format!(
                "task {task_id} must be completed, cancelled, or errored before deletion"
            )));
        }
        self.db.with_conn(|conn| db_tasks::delete(conn, task_id))?;
        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
        tasks.remove(task_id);
        let mut instances = self.instances.lock().expect("instances mutex poisoned");
        instances.retain(|k, _| !k.starts_with(&format!("{task_id}_")));
        let mut flag_map = self.flags.lock().expect("flags mutex poisoned");
        flag_map.remove(task_id);
        Ok(())
    }

    /// `GET status(task_id)` (spec §6).
    pub fn status(&self, task_id: &str) -> Result<TaskSummary> {
        self.db
            .with_conn(|conn| db_tasks::get_summary(conn, task_id))?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    pub fn progress(&self, task_id: &str) -> Result<Vec<(String, String, ScrapeTaskProgress)>> {
        self.db.with_conn(|conn| db_tasks::get_progress_map(conn, task_id))
    }

    /// `GET list_tasks(active_only?)` (spec §6): latest 30.
    pub fn list_tasks(&self, active_only: bool) -> Result<Vec<String>> {
        self.db.with_conn(|conn| db_tasks::list_recent(conn, active_only, 30))
    }

    /// Watchdog tick (spec §4.7 "stall detect" / §5). Call on a fixed
    /// interval from a dedicated background thread.
    pub fn run_watchdog_once(&self) -> Result<()> {
        let now = Utc::now().naive_utc();
        let rows = self.db.with_conn(|conn| db_tasks::list_running_and_paused_newer_than(conn))?;
        for (task_id, status, pause_timestamp) in rows {
            let last_updated = self.db.with_conn(|conn| db_tasks::last_updated_for_task(conn, &task_id))?;
            let stalled = match status {
                TaskStatus::Running => last_updated
                    .map(|t| now - t > chrono::Duration::from_std(self.settings.stall_running_threshold).unwrap())
                    .unwrap_or(false),
                TaskStatus::Paused => {
                    let by_progress = last_updated
                        .map(|t| now - t > chrono::Duration::from_std(self.settings.stall_paused_threshold).unwrap())
                        .unwrap_or(false);
                    let by_pause_timeout = pause_timestamp
                        .map(|t| now - t > chrono::Duration::from_std(self.settings.scraping_pause_timeout).unwrap())
                        .unwrap_or(false);
                    by_progress || by_pause_timeout
                }
                _ => false,
            };
            if !stalled {
                continue;
            }

            warn!(task_id = %task_id, ?status, "watchdog: task stalled, transitioning to terminal state");
            let terminal = if status == TaskStatus::Running { TaskStatus::Error } else { TaskStatus::Cancelled };
            let flags = {
                let flag_map = self.flags.lock().expect("flags mutex poisoned");
                flag_map.get(&task_id).cloned()
            };
            if let Some(flags) = flags {
                if terminal == TaskStatus::Error {
                    flags.stall_as_error.store(true, Ordering::SeqCst);
                }
                flags.cancel.store(true, Ordering::SeqCst);
                flags.pause.store(false, Ordering::SeqCst);
            } else {
                self.db.with_conn(|conn| db_tasks::set_finished(conn, &task_id, terminal, now))?;
            }
        }
        Ok(())
    }

    /// Dispatches to the serial (§4.7.1) or parallel (§4.8 / C8) pair
    /// scheduler depending on `task.mode`, then finalizes the task row
    /// and cleans up the in-memory caches either way.
    fn run_task(
        self: Arc<Self>,
        task_id: String,
        mut task: ScrapeTask,
        flags: ControlFlags,
        completed: HashSet<(String, String)>,
        resume_states: HashMap<(String, String), ResumeState>,
    ) {
        let now = Utc::now().naive_utc();
        if task.started_at.is_none() {
            task.started_at = Some(now);
        }
        let _ = self.db.with_conn(|conn| db_tasks::set_started(conn, &task_id, now));

        let mut final_status = match task.mode {
            ScrapeMode::Serial => self.run_pairs_serial(&task_id, &task, &flags, &completed, &resume_states),
            ScrapeMode::Parallel => parallel::run_pairs_parallel(&self, &task_id, &task, &flags, &completed, &resume_states),
        };
        // A watchdog-initiated stall on a *running* task wants `error`,
        // not the `cancelled` an ordinary cancel produces (spec §4.7).
        if final_status == TaskStatus::Cancelled && flags.stall_as_error.load(Ordering::SeqCst) {
            final_status = TaskStatus::Error;
        }

        let finished_at = Utc::now().naive_utc();
        let _ = self.db.with_conn(|conn| db_tasks::set_finished(conn, &task_id, final_status, finished_at));
        self.cache.invalidate_all();

        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
        tasks.remove(&task_id);
        let mut instances = self.instances.lock().expect("instances mutex poisoned");
        instances.retain(|k, _| !k.starts_with(&format!("{task_id}_")));
        let mut flag_map = self.flags.lock().expect("flags mutex poisoned");
        flag_map.remove(&task_id);
    }

    /// The sequential scrape loop (spec §4.7.1): runs every (scraper,
    /// area) pair strictly one at a time on the calling thread.
    fn run_pairs_serial(
        &self,
        task_id: &str,
        task: &ScrapeTask,
        flags: &ControlFlags,
        completed: &HashSet<(String, String)>,
        resume_states: &HashMap<(String, String), ResumeState>,
    ) -> TaskStatus {
        let mut final_status = TaskStatus::Completed;
        for (scraper_name, area) in task.pairs() {
            if completed.contains(&(scraper_name.clone(), area.clone())) {
                continue;
            }
            let resume_state = resume_states.get(&(scraper_name.clone(), area.clone())).cloned();

            match self.run_pair(task_id, task, &scraper_name, &area, flags, resume_state) {
                Ok(()) => {}
                Err(Error::TaskCancelled) => {
                    final_status = TaskStatus::Cancelled;
                    break;
                }
                Err(Error::FatalSchemaError(msg)) => {
                    tracing::error!(task_id = %task_id, error = %msg, "fatal schema error, aborting task");
                    final_status = TaskStatus::Failed;
                    break;
                }
                Err(e) => {
                    // Non-fatal per-pair failure: logged, task carries on
                    // to the next pair (spec §7 — only FatalSchemaError
                    // and TaskCancelled abort the whole task).
                    tracing::error!(task_id = %task_id, scraper = %scraper_name, area = %area, error = %e, "pair failed");
                }
            }
        }
        final_status
    }

    /// Runs one (scraper, area) pair to completion (spec §4.7.1/§4.7.4).
    /// Consults C9 before scheduling a detail fetch is the scraper's own
    /// job; this loop's responsibility is the safe point before
    /// persisting, the checkpoint cadence, and feeding each yielded
    /// listing to C2/C3.
    pub(crate) fn run_pair(
        &self,
        task_id: &str,
        task: &ScrapeTask,
        scraper_name: &str,
        area: &str,
        flags: &ControlFlags,
        resume_state: Option<ResumeState>,
    ) -> Result<()> {
        let instance_key = format!("{task_id}_{scraper_name}_{area}");
        let scraper = {
            let mut instances = self.instances.lock().expect("instances mutex poisoned");
            if let Some(existing) = instances.get(&instance_key) {
                Arc::clone(existing)
            } else {
                let built = build_scraper(scraper_name, flags.clone(), self.db.clone(), self.settings.detail_refetch_hours)?;
                if let Some(state) = resume_state {
                    built.set_resume_state(Some(state));
                }
                instances.insert(instance_key.clone(), Arc::clone(&built));
                built
            }
        };

        let now0 = Utc::now().naive_utc();
        self.db.with_conn(|conn| {
            db_tasks::upsert_progress_status(conn, task_id, scraper_name, area, "running", now0)
        })?;

        let scrape_flags = ScrapeFlags { force_detail_fetch: task.force_detail_fetch };
        let listings = scraper.scrape_area(area, task.max_properties, scrape_flags)?;

        let mut progress = ScrapeTaskProgress::default();
        let mut logs = LogRing::new(50);
        let mut error_logs = LogRing::new(30);
        let mut warning_logs = LogRing::new(50);
        let mut last_checkpoint = Instant::now();

        for item in listings {
            observe_safe_point(flags)?;

            progress.properties_attempted += 1;
            match item {
                Ok(raw) => {
                    progress.properties_found += 1;
                    match self.persist_one(&raw) {
                        Ok(classification) => {
                            progress.properties_processed += 1;
                            use identity::Classification::*;
                            let kind = match classification {
                                NewListing => {
                                    progress.new_listings += 1;
                                    "new"
                                }
                                PriceChanged => {
                                    progress.price_updated += 1;
                                    "price_change"
                                }
                                OtherUpdates => {
                                    progress.other_updates += 1;
                                    "update"
                                }
                                RefetchedUnchanged => {
                                    progress.refetched_unchanged += 1;
                                    "refetched_unchanged"
                                }
                            };
                            logs.push(LogEntry {
                                ts: Utc::now().naive_utc(),
                                scraper: scraper_name.to_string(),
                                area: area.to_string(),
                                kind: kind.to_string(),
                                url: Some(raw.url.clone()),
                                message: format!("{} {}", raw.building_name, raw.site_property_id),
                            });
                        }
                        Err(Error::AmbiguousMatch(msg)) => {
                            progress.properties_processed += 1;
                            warning_logs.push(LogEntry {
                                ts: Utc::now().naive_utc(),
                                scraper: scraper_name.to_string(),
                                area: area.to_string(),
                                kind: "ambiguous_match".to_string(),
                                url: Some(raw.url.clone()),
                                message: msg,
                            });
                        }
                        Err(e) => {
                            progress.save_failed += 1;
                            progress.other_errors += 1;
                            error_logs.push(LogEntry {
                                ts: Utc::now().naive_utc(),
                                scraper: scraper_name.to_string(),
                                area: area.to_string(),
                                kind: "save_failed".to_string(),
                                url: Some(raw.url.clone()),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Err(Error::ParseFailed(msg)) => {
                    progress.save_failed += 1;
                    error_logs.push(LogEntry {
                        ts: Utc::now().naive_utc(),
                        scraper: scraper_name.to_string(),
                        area: area.to_string(),
                        kind: "save_failed".to_string(),
                        url: None,
                        message: msg,
                    });
                }
                Err(Error::PriceMismatch { url, list_price, detail_price }) => {
                    progress.price_missing += 1;
                    warning_logs.push(LogEntry {
                        ts: Utc::now().naive_utc(),
                        scraper: scraper_name.to_string(),
                        area: area.to_string(),
                        kind: "price_mismatch".to_string(),
                        url: Some(url),
                        message: format!("list={list_price} detail={detail_price}"),
                    });
                }
                Err(Error::NetworkPermanent(msg)) => {
                    progress.other_errors += 1;
                    warning_logs.push(LogEntry {
                        ts: Utc::now().naive_utc(),
                        scraper: scraper_name.to_string(),
                        area: area.to_string(),
                        kind: "network_permanent".to_string(),
                        url: None,
                        message: msg,
                    });
                }
                Err(Error::TaskCancelled) => return Err(Error::TaskCancelled),
                Err(e) => {
                    progress.other_errors += 1;
                    error_logs.push(LogEntry {
                        ts: Utc::now().naive_utc(),
                        scraper: scraper_name.to_string(),
                        area: area.to_string(),
                        kind: "other_error".to_string(),
                        url: None,
                        message: e.to_string(),
                    });
                }
            }

            if last_checkpoint.elapsed() >= StdDuration::from_secs(5) {
                self.checkpoint(task_id, scraper_name, area, &scraper, &progress, &logs, &error_logs, &warning_logs)?;
                last_checkpoint = Instant::now();
            }
        }

        self.checkpoint(task_id, scraper_name, area, &scraper, &progress, &logs, &error_logs, &warning_logs)?;
        let now1 = Utc::now().naive_utc();
        self.db.with_conn(|conn| {
            db_tasks::upsert_progress_status(conn, task_id, scraper_name, area, "completed", now1)
        })?;
        self.cache.invalidate_all();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn checkpoint(
        &self,
        task_id: &str,
        scraper_name: &str,
        area: &str,
        scraper: &Arc<dyn Scraper>,
        progress: &ScrapeTaskProgress,
        logs: &LogRing,
        error_logs: &LogRing,
        warning_logs: &LogRing,
    ) -> Result<()> {
        let mut snapshot = progress.clone();
        snapshot.resume_state = scraper.resume_state();
        let now = Utc::now().naive_utc();
        self.db.with_conn(|conn| db_tasks::flush_progress(conn, task_id, scraper_name, area, &snapshot, now))?;
        self.db.with_conn(|conn| db_tasks::append_logs(conn, task_id, logs, error_logs, warning_logs))?;

        let mut counters = TaskCounters {
            total_processed: progress.properties_processed,
            total_new: progress.new_listings,
            total_updated: progress.price_updated + progress.other_updates,
            total_errors: progress.save_failed + progress.other_errors,
        };
        // Never regress an already-persisted nonzero counter (spec §4.7.5).
        if let Some(existing) = self.db.with_conn(|conn| db_tasks::get_summary(conn, task_id))? {
            counters.total_processed = counters.total_processed.max(existing.counters.total_processed);
            counters.total_new = counters.total_new.max(existing.counters.total_new);
            counters.total_updated = counters.total_updated.max(existing.counters.total_updated);
            counters.total_errors = counters.total_errors.max(existing.counters.total_errors);
        }
        self.db.with_conn(|conn| db_tasks::update_counters(conn, task_id, &counters, 0.0))?;
        info!(task_id = %task_id, scraper = %scraper_name, area = %area, processed = progress.properties_processed, "checkpoint");
        Ok(())
    }

    /// Feeds one raw listing through C2 then synchronously refreshes C3
    /// for the affected property and building (spec §4.2 step 7:
    /// "Enqueue C3 for the affected building and property" — there is
    /// no durable C3 queue table, unlike C5's, so this runs it inline).
    fn persist_one(&self, raw: &crate::domain::RawListing) -> Result<identity::Classification> {
        self.db.with_conn(|conn| {
            let resolved = identity::resolve(conn, raw)?;
            voting::refresh_property(conn, resolved.master_property_id)?;
            voting::refresh_building(conn, resolved.building_id)?;
            Ok(resolved.classification)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    fn registry() -> Arc<TaskRegistry> {
        TaskRegistry::new(test_db(), Settings::from_env())
    }

    fn insert_task(reg: &TaskRegistry, status: TaskStatus) -> String {
        let id = new_task_id();
        let now = Utc::now().naive_utc();
        let mut task = ScrapeTask::new(
            id.clone(),
            vec!["suumo".to_string()],
            vec!["13101".to_string()],
            10,
            false,
            ScrapeMode::Serial,
            now,
        );
        task.status = status;
        reg.db.with_conn(|conn| db_tasks::insert(conn, &task)).unwrap();
        id
    }

    #[test]
    fn safe_point_cancel_wins_over_pause() {
        let flags = ControlFlags::new();
        flags.pause.store(true, Ordering::SeqCst);
        flags.cancel.store(true, Ordering::SeqCst);
        match observe_safe_point(&flags) {
            Err(Error::TaskCancelled) => {}
            other => panic!("expected TaskCancelled, got {other:?}"),
        }
    }

    #[test]
    fn safe_point_blocks_on_pause_until_cleared() {
        let flags = ControlFlags::new();
        flags.pause.store(true, Ordering::SeqCst);
        let waiter_flags = flags.clone();
        let handle = thread::spawn(move || observe_safe_point(&waiter_flags));

        thread::sleep(StdDuration::from_millis(250));
        assert!(!handle.is_finished(), "should still be blocked on pause");
        flags.pause.store(false, Ordering::SeqCst);

        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn safe_point_returns_ok_when_neither_flag_set() {
        let flags = ControlFlags::new();
        assert!(observe_safe_point(&flags).is_ok());
    }

    #[test]
    fn pause_requires_running_status() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Pending);
        match reg.pause(&id) {
            Err(Error::Precondition(_)) => {}
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[test]
    fn pause_with_no_live_worker_is_a_conflict() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Running);
        // No flags registered for this id: simulates a task whose owning
        // process has already exited (spec §9 CLI process model).
        match reg.pause(&id) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn cancel_on_terminal_task_is_rejected() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Completed);
        match reg.cancel(&id) {
            Err(Error::Precondition(_)) => {}
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[test]
    fn cancel_with_no_live_worker_finalizes_directly() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Paused);
        reg.cancel(&id).unwrap();
        let status = reg.db.with_conn(|conn| db_tasks::status(conn, &id)).unwrap();
        assert_eq!(status, Some(TaskStatus::Cancelled));
    }

    #[test]
    fn cancel_fans_out_to_live_worker_and_releases_pause() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Running);
        let flags = ControlFlags::new();
        flags.pause.store(true, Ordering::SeqCst);
        reg.flags.lock().unwrap().insert(id.clone(), flags.clone());

        reg.cancel(&id).unwrap();
        assert!(flags.cancel.load(Ordering::SeqCst));
        assert!(!flags.pause.load(Ordering::SeqCst), "cancel must clear pause so a waiter observes it");
    }

    #[test]
    fn delete_requires_terminal_status() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Running);
        match reg.delete_task(&id) {
            Err(Error::Precondition(_)) => {}
            other => panic!("expected Precondition, got {other:?}"),
        }
        let done = insert_task(&reg, TaskStatus::Cancelled);
        reg.delete_task(&done).unwrap();
        let status = reg.db.with_conn(|conn| db_tasks::status(conn, &done)).unwrap();
        assert!(status.is_none());
    }

    #[test]
    fn force_cleanup_cancels_live_workers_and_flips_non_terminal_rows() {
        let reg = registry();
        let running = insert_task(&reg, TaskStatus::Running);
        let flags = ControlFlags::new();
        reg.flags.lock().unwrap().insert(running.clone(), flags.clone());
        let pending = insert_task(&reg, TaskStatus::Pending);

        let n = reg.force_cleanup().unwrap();
        assert!(n >= 2);
        assert!(flags.cancel.load(Ordering::SeqCst));
        let status = reg.db.with_conn(|conn| db_tasks::status(conn, &pending)).unwrap();
        assert_eq!(status, Some(TaskStatus::Cancelled));
    }

    #[test]
    fn watchdog_marks_stalled_running_task_as_error_when_no_live_worker() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Running);
        let stale = Utc::now().naive_utc() - chrono::Duration::hours(1);
        reg.db
            .with_conn(|conn| db_tasks::upsert_progress_status(conn, &id, "suumo", "13101", "running", stale))
            .unwrap();

        reg.run_watchdog_once().unwrap();
        let status = reg.db.with_conn(|conn| db_tasks::status(conn, &id)).unwrap();
        assert_eq!(status, Some(TaskStatus::Error));
    }

    #[test]
    fn watchdog_sets_stall_as_error_on_live_worker_running_task() {
        let reg = registry();
        let id = insert_task(&reg, TaskStatus::Running);
        let flags = ControlFlags::new();
        reg.flags.lock().unwrap().insert(id.clone(), flags.clone());
        let stale = Utc::now().naive_utc() - chrono::Duration::hours(1);
        reg.db
            .with_conn(|conn| db_tasks::upsert_progress_status(conn, &id, "suumo", "13101", "running", stale))
            .unwrap();

        reg.run_watchdog_once().unwrap();
        assert!(flags.cancel.load(Ordering::SeqCst));
        assert!(flags.stall_as_error.load(Ordering::SeqCst));
    }
}
