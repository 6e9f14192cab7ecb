//! Spindle command-line probes
//!
//! Small workloads that exercise the scheduler and report timing figures:
//! sleep lateness, nested task throughput and periodic clock drift.

mod commands;
mod logger;

use clap::{Parser, Subcommand};
use spindle::{Scheduler, SchedulerConfig};

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Cooperative scheduler probes", long_about = None)]
#[command(version)]
struct Cli {
    /// Worker threads for the pool (0 = one per CPU)
    #[arg(short, long, global = true, default_value_t = 0)]
    workers: usize,

    /// Run work on the calling thread instead of a pool
    #[arg(long, global = true)]
    inline: bool,

    /// Log level (off, error, warn, info, debug, trace); falls back to SPINDLE_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure how late concurrent coroutine sleeps complete
    SleepAccuracy {
        /// Number of concurrent sleeps
        #[arg(short, long, default_value_t = 100)]
        count: usize,
        /// Sleep length in milliseconds
        #[arg(short, long, default_value_t = 10)]
        millis: u64,
    },

    /// Run chains of nested child tasks and report throughput
    Fanout {
        /// Number of root tasks
        #[arg(short, long, default_value_t = 1000)]
        tasks: usize,
        /// Child tasks nested under each root
        #[arg(short, long, default_value_t = 8)]
        depth: u32,
    },

    /// Measure periodic clock drift
    Ticker {
        /// Tick interval in milliseconds
        #[arg(short, long, default_value_t = 10)]
        interval_ms: u64,
        /// Number of ticks to wait for
        #[arg(short, long, default_value_t = 50)]
        ticks: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.log_level.as_deref())?;

    let config = if cli.inline {
        SchedulerConfig::inline()
    } else {
        SchedulerConfig::thread_pool(cli.workers)
    };
    log::info!("Scheduler config: {:?}", config);
    let scheduler = Scheduler::with_config(config);

    match cli.command {
        Commands::SleepAccuracy { count, millis } => {
            commands::sleep_accuracy::execute(&scheduler, count, millis)
        }
        Commands::Fanout { tasks, depth } => commands::fanout::execute(&scheduler, tasks, depth),
        Commands::Ticker { interval_ms, ticks } => {
            commands::ticker::execute(&scheduler, interval_ms, ticks)
        }
    }
}
