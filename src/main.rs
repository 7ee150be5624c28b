// src/main.rs
//
// Thin CLI shell (spec §6, SPEC_FULL §A.5) over `condo_ledger`. `start`
// spawns its scrape task and then runs the periodic workers spec §5
// requires (watchdog, C4 lifecycle, C5 queue drain) in the foreground
// for the task's duration; every other subcommand is a short,
// stateless round trip against the persisted task state — a process
// that starts a task owns its in-memory `ControlFlags`/scraper
// instances, so `pause`/`cancel` issued from a separate invocation can
// only reach a task that invocation's own process is running (see
// DESIGN.md, "CLI process model").

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use condo_ledger::cli::{Cli, Command};
use condo_ledger::config::Settings;
use condo_ledger::db::connection::Database;
use condo_ledger::errors::Error;
use condo_ledger::geocoding::{self, NoopGeocodingProvider};
use condo_ledger::orchestrator::task::ScrapeMode;
use condo_ledger::orchestrator::TaskRegistry;
use condo_ledger::{db, lifecycle, price_change, voting};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const LIFECYCLE_INTERVAL: Duration = Duration::from_secs(300);
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(30);
const QUEUE_DRAIN_BATCH: i64 = 200;
const GEOCODE_BACKFILL_BATCH: i64 = 50;

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database = Database::new(cli.database_path.clone());
    if let Err(e) = database.init_schema() {
        eprintln!("failed to initialize database: {e}");
        std::process::exit(1);
    }

    let registry = TaskRegistry::new(database.clone(), Settings::from_env());
    match registry.recover_on_startup() {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::info!(count = recovered.len(), "recovered stale running tasks to paused");
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("startup recovery failed: {e}");
            std::process::exit(1);
        }
    }

    let code = dispatch(cli.command, &registry, &database);
    std::process::exit(code);
}

fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::BadInput(_) => 2,
        Error::NotFound(_) => 3,
        Error::Precondition(_) => 4,
        Error::Conflict(_) => 5,
        _ => 1,
    }
}

fn fail(e: Error) -> i32 {
    let code = exit_code_for(&e);
    eprintln!("error: {e}");
    code
}

fn dispatch(command: Command, registry: &Arc<TaskRegistry>, db: &Database) -> i32 {
    match command {
        Command::Start { scrapers, area_codes, max_properties, force_detail_fetch, mode } => {
            let mode = match ScrapeMode::from_str(&mode) {
                Ok(m) => m,
                Err(e) => return fail(e),
            };
            run_start(registry, db, scrapers, area_codes, max_properties, force_detail_fetch, mode)
        }
        Command::Pause { task_id } => match registry.pause(&task_id) {
            Ok(()) => {
                println!("paused {task_id}");
                0
            }
            Err(e) => fail(e),
        },
        Command::Resume { task_id } => match registry.resume(&task_id) {
            Ok(()) => {
                println!("resumed {task_id}");
                0
            }
            Err(e) => fail(e),
        },
        Command::Cancel { task_id } => match registry.cancel(&task_id) {
            Ok(()) => {
                println!("cancelled {task_id}");
                0
            }
            Err(e) => fail(e),
        },
        Command::Status { task_id } => match registry.status(&task_id) {
            Ok(summary) => {
                print_status(&summary);
                match registry.progress(&task_id) {
                    Ok(progress) => print_progress(&progress),
                    Err(e) => eprintln!("warning: could not load progress map: {e}"),
                }
                0
            }
            Err(e) => fail(e),
        },
        Command::ListTasks { active_only } => match registry.list_tasks(active_only) {
            Ok(ids) => {
                for id in ids {
                    println!("{id}");
                }
                0
            }
            Err(e) => fail(e),
        },
        Command::Delete { task_id } => match registry.delete_task(&task_id) {
            Ok(()) => {
                println!("deleted {task_id}");
                0
            }
            Err(e) => fail(e),
        },
        Command::ForceCleanup => match registry.force_cleanup() {
            Ok(n) => {
                println!("cancelled {n} non-terminal task(s)");
                0
            }
            Err(e) => fail(e),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn run_start(
    registry: &Arc<TaskRegistry>,
    db: &Database,
    scrapers: Vec<String>,
    area_codes: Vec<String>,
    max_properties: i64,
    force_detail_fetch: bool,
    mode: ScrapeMode,
) -> i32 {
    let task_id = match registry.start(scrapers, area_codes, max_properties, force_detail_fetch, mode) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    println!("started task {task_id}");

    let stop = Arc::new(AtomicBool::new(false));
    let workers = spawn_periodic_workers(Arc::clone(registry), db.clone(), Arc::clone(&stop));

    let final_status = loop {
        std::thread::sleep(Duration::from_millis(500));
        match registry.status(&task_id) {
            Ok(summary) if summary.status.is_terminal() => break summary.status,
            Ok(_) => continue,
            Err(e) => {
                eprintln!("error polling task status: {e}");
                break condo_ledger::orchestrator::task::TaskStatus::Error;
            }
        }
    };

    stop.store(true, Ordering::SeqCst);
    for handle in workers {
        let _ = handle.join();
    }

    println!("task {task_id} finished: {}", final_status.as_str());
    if let Ok(summary) = registry.status(&task_id) {
        print_status(&summary);
    }
    0
}

/// Spec §5's watchdog + C4 periodic worker + C5 queue worker, run on
/// dedicated threads for the lifetime of a foreground `start` command.
fn spawn_periodic_workers(
    registry: Arc<TaskRegistry>,
    db: Database,
    stop: Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
    let watchdog = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Err(e) = registry.run_watchdog_once() {
                    tracing::warn!(error = %e, "watchdog tick failed");
                }
                std::thread::sleep(WATCHDOG_INTERVAL);
            }
        })
    };

    let lifecycle_worker = {
        let db = db.clone();
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let geocoder = NoopGeocodingProvider;
            while !stop.load(Ordering::SeqCst) {
                match db.with_conn(|conn| lifecycle::run(conn)) {
                    Ok(report) => {
                        tracing::debug!(?report, "lifecycle sweep complete");
                        if !report.affected_property_ids.is_empty() || !report.affected_building_ids.is_empty() {
                            let refreshed = db.with_conn(|conn| {
                                for property_id in &report.affected_property_ids {
                                    voting::refresh_property(conn, *property_id)?;
                                }
                                for building_id in &report.affected_building_ids {
                                    voting::refresh_building(conn, *building_id)?;
                                }
                                Ok(())
                            });
                            if let Err(e) = refreshed {
                                tracing::warn!(error = %e, "post-lifecycle vote refresh failed");
                            }
                            registry.cache().invalidate_all();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "lifecycle sweep failed"),
                }
                match db.with_conn(|conn| geocoding::backfill(conn, &geocoder, GEOCODE_BACKFILL_BATCH)) {
                    Ok(report) => tracing::debug!(?report, "geocoding backfill pass complete"),
                    Err(e) => tracing::warn!(error = %e, "geocoding backfill failed"),
                }
                std::thread::sleep(LIFECYCLE_INTERVAL);
            }
        })
    };

    let queue_worker = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match db.with_conn(|conn| price_change::drain_queue(conn, QUEUE_DRAIN_BATCH)) {
                    Ok(n) if n > 0 => tracing::debug!(count = n, "drained price-change queue"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "price-change queue drain failed"),
                }
                std::thread::sleep(QUEUE_DRAIN_INTERVAL);
            }
        })
    };

    vec![watchdog, lifecycle_worker, queue_worker]
}

fn print_status(summary: &db::tasks::TaskSummary) {
    println!("task:            {}", summary.id);
    println!("status:          {}", summary.status.as_str());
    println!("scrapers:        {}", summary.scrapers.join(","));
    println!("area_codes:      {}", summary.area_codes.join(","));
    println!("mode:            {}", summary.mode.as_str());
    println!("created_at:      {}", summary.created_at);
    println!("started_at:      {:?}", summary.started_at);
    println!("finished_at:     {:?}", summary.finished_at);
    println!("pause_timestamp: {:?}", summary.pause_timestamp);
    println!(
        "counters:        processed={} new={} updated={} errors={}",
        summary.counters.total_processed, summary.counters.total_new, summary.counters.total_updated, summary.counters.total_errors
    );
    println!("elapsed_seconds: {:.1}", summary.elapsed_seconds);
    for entry in &summary.recent_error_logs {
        println!("  [error] {} {} {}: {}", entry.ts, entry.scraper, entry.area, entry.message);
    }
    for entry in &summary.recent_warning_logs {
        println!("  [warn]  {} {} {}: {}", entry.ts, entry.scraper, entry.area, entry.message);
    }
}

fn print_progress(progress: &[(String, String, condo_ledger::orchestrator::task::ScrapeTaskProgress)]) {
    for (scraper, area, p) in progress {
        println!(
            "  {scraper}/{area}: found={} processed={} new={} price_updated={} errors={}",
            p.properties_found, p.properties_processed, p.new_listings, p.price_updated, p.other_errors
        );
    }
}
