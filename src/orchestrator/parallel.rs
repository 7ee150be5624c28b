// src/orchestrator/parallel.rs
//
// C8 — Parallel Task Manager (spec §4.8). Fans a task's (scraper, area)
// pairs out across a bounded worker pool instead of running them one
// at a time. Pause/cancel need no extra plumbing here: `ControlFlags`'
// `Arc<AtomicBool>`s are shared by reference across every worker of
// the same task, so a single `pause()`/`cancel()` call on the registry
// reaches all of them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use super::task::{ResumeState, ScrapeTask, TaskStatus};
use super::{ControlFlags, TaskRegistry};
use crate::errors::Error;

/// Runs `task`'s pending (scraper, area) pairs across up to
/// `registry.settings.parallel_limit` worker threads (spec §4.8). The
/// parent task's terminal status mirrors the serial scheduler's rules:
/// a fatal schema error or a cancellation aborts the whole task; any
/// other per-pair error is logged and the remaining pairs still run.
pub fn run_pairs_parallel(
    registry: &Arc<TaskRegistry>,
    task_id: &str,
    task: &ScrapeTask,
    flags: &ControlFlags,
    completed: &HashSet<(String, String)>,
    resume_states: &HashMap<(String, String), ResumeState>,
) -> TaskStatus {
    let pending: VecDeque<(String, String)> = task
        .pairs()
        .into_iter()
        .filter(|p| !completed.contains(p))
        .collect();
    let queue = Mutex::new(pending);
    let worker_count = registry.settings.parallel_limit.max(1);

    let cancelled = Mutex::new(false);
    let failed = Mutex::new(false);

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                if *cancelled.lock().expect("cancelled mutex poisoned")
                    || *failed.lock().expect("failed mutex poisoned")
                {
                    break;
                }
                let next = queue.lock().expect("parallel queue mutex poisoned").pop_front();
                let Some((scraper_name, area)) = next else {
                    break;
                };
                let resume_state = resume_states.get(&(scraper_name.clone(), area.clone())).cloned();

                match registry.run_pair(task_id, task, &scraper_name, &area, flags, resume_state) {
                    Ok(()) => {}
                    Err(Error::TaskCancelled) => {
                        *cancelled.lock().expect("cancelled mutex poisoned") = true;
                        break;
                    }
                    Err(Error::FatalSchemaError(msg)) => {
                        tracing::error!(task_id = %task_id, error = %msg, "fatal schema error, aborting task");
                        *failed.lock().expect("failed mutex poisoned") = true;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task_id, scraper = %scraper_name, area = %area, error = %e, "pair failed");
                    }
                }
            });
        }
    });

    if *cancelled.lock().expect("cancelled mutex poisoned") {
        TaskStatus::Cancelled
    } else if *failed.lock().expect("failed mutex poisoned") {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    }
}
