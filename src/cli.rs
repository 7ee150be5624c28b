// src/cli.rs
//
// `clap`-derived task-control surface (spec §6, SPEC_FULL §A.5). Spec
// names these operations with HTTP verbs (`POST start(...)`) but also
// calls the surface a "CLI/HTTP surface" and specifies process exit
// codes, so this ships as subcommands rather than routes; the
// read-catalog HTTP API (listings search, bookmarks, auth) is out of
// scope per spec §1 and isn't built here.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "condo-ledger", about = "Real-estate listing aggregation and reconciliation engine")]
pub struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, env = "DATABASE_PATH", default_value = "condo_ledger.db", global = true)]
    pub database_path: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a new scrape task. Runs it to completion in the foreground,
    /// printing the task id immediately and a final summary on exit.
    Start {
        /// Comma-separated scraper names (suumo, homes).
        #[arg(long, value_delimiter = ',', required = true)]
        scrapers: Vec<String>,
        /// Comma-separated area codes.
        #[arg(long = "area-codes", value_delimiter = ',', required = true)]
        area_codes: Vec<String>,
        #[arg(long, default_value_t = 500)]
        max_properties: i64,
        #[arg(long)]
        force_detail_fetch: bool,
        /// "serial" (one pair at a time) or "parallel" (bounded pool, C8).
        #[arg(long, default_value = "serial")]
        mode: String,
    },
    /// Pause a running task.
    Pause { task_id: String },
    /// Resume a paused task.
    Resume { task_id: String },
    /// Cancel a task that hasn't reached a terminal state.
    Cancel { task_id: String },
    /// Print a task's full row, progress map, and latest log slices.
    Status { task_id: String },
    /// List the 30 most recent tasks.
    ListTasks {
        #[arg(long)]
        active_only: bool,
    },
    /// Delete a completed/cancelled/errored task.
    Delete { task_id: String },
    /// Flip every non-terminal task to cancelled.
    ForceCleanup,
}
