use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use sluice_cli::{run, Workload};
use sluice_infra::{init_telemetry, shutdown_telemetry, LogFormat};
use sluice_limiter::{Datastore, LimiterSettings, Strategy};

#[derive(Parser, Debug)]
#[command(name = "sluice-sim")]
#[command(about = "Run a synthetic workload through a Sluice limiter")]
struct Args {
    /// Limiter id (overrides SLUICE_ID)
    #[arg(long)]
    id: Option<String>,

    /// Maximum total weight running at once
    #[arg(long)]
    max_concurrent: Option<u64>,

    /// Minimum spacing between job starts
    #[arg(long, value_name = "MS")]
    min_time_ms: Option<u64>,

    /// Queue length that triggers the overflow strategy
    #[arg(long)]
    high_water: Option<u64>,

    /// leak, overflow, overflow_priority or block
    #[arg(long)]
    strategy: Option<Strategy>,

    #[arg(long, value_name = "MS")]
    penalty_ms: Option<u64>,

    /// Jobs admitted before the reservoir is depleted
    #[arg(long)]
    reservoir: Option<u64>,

    /// local or distributed
    #[arg(long)]
    datastore: Option<Datastore>,

    /// Number of jobs to schedule
    #[arg(long, default_value_t = 20)]
    jobs: usize,

    #[arg(long, value_name = "MS", default_value_t = 50)]
    job_ms: u64,

    /// Random extra duration per job, up to this many milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0)]
    jitter_ms: u64,

    /// Probability (0 to 1) that an attempt fails
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Retries allowed per job
    #[arg(long, default_value_t = 0)]
    retries: u32,

    #[arg(long, value_name = "MS", default_value_t = 100)]
    retry_delay_ms: u64,

    /// Limiters sharing one in-memory backend
    #[arg(long, default_value_t = 1)]
    processes: usize,

    /// Give jobs random priorities
    #[arg(long)]
    random_priorities: bool,

    /// Log output: pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

impl Args {
    fn apply(&self, settings: &mut LimiterSettings) {
        if let Some(id) = &self.id {
            settings.id = id.clone();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            settings.store.max_concurrent = Some(max_concurrent);
        }
        if let Some(min_time) = self.min_time_ms {
            settings.store.min_time = Duration::from_millis(min_time);
        }
        if let Some(high_water) = self.high_water {
            settings.store.high_water = Some(high_water);
        }
        if let Some(strategy) = self.strategy {
            settings.store.strategy = strategy;
        }
        if let Some(penalty) = self.penalty_ms {
            settings.store.penalty = Some(Duration::from_millis(penalty));
        }
        if let Some(reservoir) = self.reservoir {
            settings.store.reservoir = Some(reservoir);
        }
        if let Some(datastore) = self.datastore {
            settings.datastore = datastore;
        }
    }

    fn workload(&self) -> Workload {
        Workload {
            jobs: self.jobs,
            job_duration: Duration::from_millis(self.job_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            failure_rate: self.failure_rate,
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            processes: self.processes,
            random_priorities: self.random_priorities,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_telemetry("sluice-sim", args.log_format)?;

    let mut settings = LimiterSettings::from_env()?;
    args.apply(&mut settings);
    settings.validate()?;

    let report = run(settings, &args.workload()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    shutdown_telemetry().await;
    Ok(())
}
