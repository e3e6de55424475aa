//! Clap command surface for `coordinatord` (§6).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "coordinatord", version, about = "Multi-agent coordinator daemon")]
pub struct Cli {
    /// Optional TOML file overlaying `Config::from_env()`'s environment
    /// defaults (persistence.backend, persistence.connection, ...).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the coordinator daemon in the foreground.
    Start {
        /// How often to run the dead-agent cleanup sweep, in seconds.
        #[arg(long, default_value_t = 300)]
        cleanup_interval_secs: u64,
    },
    /// Stop a running coordinator daemon.
    Stop,
    /// Dump currently active (non-expired) locks.
    Locks {
        /// Narrow the dump to one holder.
        #[arg(long)]
        holder: Option<String>,
    },
    /// List pending work-queue tasks within a priority window.
    Queue {
        /// Only tasks with priority <= this value (1 highest .. 10 lowest).
        #[arg(long, default_value_t = 10)]
        max_priority: i64,
        /// Maximum rows to return.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Run one dead-agent cleanup sweep and report what it released.
    Cleanup {
        /// Sessions with no heartbeat in this many seconds are dead.
        #[arg(long, default_value_t = 900)]
        staleness_secs: i64,
    },
    /// Validate a work-package document and print its topological order.
    Plan {
        /// Path to the work-package document (JSON).
        path: PathBuf,
    },
}
