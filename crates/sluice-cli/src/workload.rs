use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use sluice_limiter::{
    AtomicBackend, Datastore, JobOptions, Limiter, LimiterError, LimiterSettings, MemoryBackend,
    StatusCounts,
};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shape of the generated jobs.
#[derive(Debug, Clone)]
pub struct Workload {
    pub jobs: usize,
    pub job_duration: Duration,
    /// Up to this much is added to each job's duration.
    pub jitter: Duration,
    /// Probability that any single attempt fails.
    pub failure_rate: f64,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Limiters sharing one in-memory backend. More than one forces the
    /// distributed datastore.
    pub processes: usize,
    pub random_priorities: bool,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            jobs: 20,
            job_duration: Duration::from_millis(50),
            jitter: Duration::ZERO,
            failure_rate: 0.0,
            retries: 0,
            retry_delay: Duration::from_millis(100),
            processes: 1,
            random_priorities: false,
        }
    }
}

impl Workload {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            anyhow::bail!("failure rate must be between 0 and 1, got {}", self.failure_rate);
        }
        if self.processes == 0 {
            anyhow::bail!("at least one process is required");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub settings: LimiterSettings,
    pub processes: usize,
    pub jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
    pub retried: usize,
    pub peak_running: u64,
    pub done_weight: u64,
    pub elapsed_ms: u64,
    /// Job states per process at the end of the run.
    pub counts: Vec<StatusCounts>,
}

struct PlannedJob {
    options: JobOptions,
    duration: Duration,
    failing_attempts: u32,
}

fn plan(workload: &Workload) -> Vec<PlannedJob> {
    let mut rng = rand::rng();
    (0..workload.jobs)
        .map(|i| {
            let mut options = JobOptions::new().with_id(format!("job-{i}"));
            if workload.random_priorities {
                options = options.with_priority(rng.random_range(0..10));
            }
            let jitter = workload.jitter.as_millis() as u64;
            let extra = if jitter > 0 { rng.random_range(0..=jitter) } else { 0 };
            let failing_attempts = (0..=workload.retries)
                .take_while(|_| rng.random_bool(workload.failure_rate))
                .count() as u32;
            PlannedJob {
                options,
                duration: workload.job_duration + Duration::from_millis(extra),
                failing_attempts,
            }
        })
        .collect()
}

fn build_limiters(
    mut settings: LimiterSettings,
    processes: usize,
) -> Result<Vec<Limiter>, LimiterError> {
    if processes > 1 {
        settings.datastore = Datastore::Distributed;
    }
    match settings.datastore {
        Datastore::Local => Ok(vec![Limiter::new(settings)?]),
        Datastore::Distributed => {
            let backend: Arc<dyn AtomicBackend> = MemoryBackend::shared();
            (0..processes)
                .map(|_| Limiter::with_backend(settings.clone(), Arc::clone(&backend)))
                .collect()
        }
    }
}

/// Schedules the workload across `workload.processes` limiters and waits for
/// every job to settle.
pub async fn run(settings: LimiterSettings, workload: &Workload) -> anyhow::Result<Report> {
    workload.validate()?;
    let limiters = build_limiters(settings, workload.processes)?;
    for limiter in &limiters {
        limiter.ready().await?;
    }

    let retried = Arc::new(AtomicUsize::new(0));
    for limiter in &limiters {
        let retried = Arc::clone(&retried);
        let (retries, delay) = (workload.retries, workload.retry_delay);
        limiter.on_failed(move |_, job| {
            if job.retry_count < retries {
                retried.fetch_add(1, Ordering::SeqCst);
                Some(delay)
            } else {
                None
            }
        });
    }

    let active = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    tracing::info!(
        jobs = workload.jobs,
        processes = limiters.len(),
        "Starting workload"
    );

    let mut handles = Vec::with_capacity(workload.jobs);
    for (i, job) in plan(workload).into_iter().enumerate() {
        let limiter = &limiters[i % limiters.len()];
        let attempts = Arc::new(AtomicU32::new(0));
        let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
        let PlannedJob {
            options,
            duration,
            failing_attempts,
        } = job;
        let handle = limiter
            .schedule(options, move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
                async move {
                    let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(duration).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    if attempt < failing_attempts {
                        anyhow::bail!("synthetic failure on attempt {}", attempt + 1);
                    }
                    Ok(())
                }
            })
            .await;
        handles.push(handle);
    }

    let mut report = Report {
        settings: limiters[0].settings(),
        processes: limiters.len(),
        jobs: workload.jobs,
        ..Report::default()
    };
    for result in join_all(handles).await {
        match result {
            Ok(()) => report.succeeded += 1,
            Err(LimiterError::Dropped(_)) => report.dropped += 1,
            Err(_) => report.failed += 1,
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report.retried = retried.load(Ordering::SeqCst);
    report.peak_running = peak.load(Ordering::SeqCst);
    report.done_weight = limiters[0].done().await?;
    report.counts = limiters.iter().map(Limiter::counts).collect();

    for limiter in &limiters {
        limiter.disconnect().await?;
    }
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        dropped = report.dropped,
        elapsed_ms = report.elapsed_ms,
        "Workload finished"
    );
    Ok(report)
}
