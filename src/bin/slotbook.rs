use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use ulid::Ulid;

use slotbook::compactor::{compact_if_due, spawn_compactor};
use slotbook::{expand_schedule, Config, Engine, Schedule, ScheduleRule, TimeRange};

/// Maintenance tool for a slotbook journal.
#[derive(Parser)]
#[command(name = "slotbook")]
#[command(version, about = "Inspect and maintain a slotbook journal", long_about = None)]
struct Cli {
    /// Override SLOTBOOK_DATA_DIR
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay the journal and print slot and booking counts
    Stats,

    /// Rewrite the journal as a snapshot of its current state
    Compact {
        /// Compact even below SLOTBOOK_COMPACT_THRESHOLD
        #[arg(long)]
        force: bool,
    },

    /// Keep the journal open and compact it in the background until Ctrl-C
    Watch,

    /// Expand a schedule rule and print the occurrences in UTC
    Expand {
        /// Rule as JSON, e.g. {"frequency":"daily","starts_at":"2026-01-05T09:00:00Z","duration_min":60}
        rule: String,
        /// Window start (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,
        /// Window end (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,
        /// IANA timezone of the schedule
        #[arg(long, default_value = "UTC")]
        tz: String,
        /// First valid local date of the schedule
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Last valid local date of the schedule
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Stats => {
            let engine = Engine::open(&config.journal_path())?;
            let stats = engine.stats().await;
            println!("providers:       {}", stats.providers);
            println!("slots:           {}", stats.slots);
            println!("free slots:      {}", stats.free_slots);
            println!("bookings:        {}", stats.bookings);
            println!("active bookings: {}", stats.active_bookings);
        }
        Command::Compact { force } => {
            let path = config.journal_path();
            let engine = Engine::open(&path)?;
            let threshold = if force { 1 } else { config.compact_threshold };
            match compact_if_due(&engine, threshold).await {
                Some(written) => info!("compacted {} to {written} events", path.display()),
                None => info!("{} is below the compaction threshold", path.display()),
            }
        }
        Command::Watch => {
            let engine = Arc::new(Engine::open(&config.journal_path())?);
            let compactor = spawn_compactor(engine, &config);
            tokio::signal::ctrl_c().await?;
            compactor.abort();
        }
        Command::Expand {
            rule,
            from,
            to,
            tz,
            start_date,
            end_date,
        } => {
            let rule: ScheduleRule = serde_json::from_str(&rule)?;
            let schedule = Schedule::new(Ulid::nil(), tz, &rule)?.with_dates(start_date, end_date);
            if !schedule.has_valid_timezone() {
                return Err(format!("unknown timezone: {}", schedule.time_zone).into());
            }
            let window = TimeRange::utc(from, to)?;
            for occurrence in expand_schedule(&schedule, &window)? {
                println!("{}\t{}", occurrence.start.to_rfc3339(), occurrence.end.to_rfc3339());
            }
        }
    }
    Ok(())
}
