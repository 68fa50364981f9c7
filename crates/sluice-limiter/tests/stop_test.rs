mod helpers;

use helpers::{ms, Probe};
use sluice_limiter::{JobOptions, Limiter, LimiterError, LimiterSettings, StopOptions};
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_stop_drops_waiting_jobs_and_waits_for_executing() {
    let limiter = Limiter::new(LimiterSettings::new("stop").with_max_concurrent(1)).unwrap();
    let probe = Probe::new();

    let running = limiter
        .schedule_task(JobOptions::new(), probe.task("running", ms(200)))
        .await;
    let first = limiter
        .schedule_task(JobOptions::new(), probe.task("first", ms(10)))
        .await;
    let second = limiter
        .schedule_task(JobOptions::new(), probe.task("second", ms(10)))
        .await;
    sleep(ms(10)).await;

    let started = Instant::now();
    limiter.stop(StopOptions::default()).await.unwrap();
    assert!(started.elapsed() >= ms(190));

    assert_eq!(running.await.unwrap(), "running");
    for handle in [first, second] {
        let error = handle.await.unwrap_err();
        assert_eq!(error.to_string(), "This limiter has been stopped.");
    }
    assert_eq!(limiter.counts().pending(), 0);
    assert_eq!(probe.order(), ["running"]);

    let late = limiter
        .schedule(JobOptions::new(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .await
        .unwrap_err();
    assert!(matches!(late, LimiterError::Stopped(_)));
    assert_eq!(
        late.to_string(),
        "This limiter has been stopped and cannot accept new jobs."
    );
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_lets_accepted_jobs_finish() {
    let limiter = Limiter::new(LimiterSettings::new("graceful").with_max_concurrent(1)).unwrap();
    let probe = Probe::new();

    let mut handles = Vec::new();
    for i in 0..3 {
        let task = probe.task(&format!("job-{i}"), ms(50));
        handles.push(limiter.schedule_task(JobOptions::new(), task).await);
    }

    limiter.stop(StopOptions::graceful()).await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(probe.order(), ["job-0", "job-1", "job-2"]);

    let late = limiter
        .schedule(JobOptions::new(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .await;
    assert!(matches!(late, Err(LimiterError::Stopped(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_fails() {
    let limiter = Limiter::new(LimiterSettings::new("twice")).unwrap();
    limiter.stop(StopOptions::default()).await.unwrap();

    let error = limiter.stop(StopOptions::default()).await.unwrap_err();
    assert!(matches!(error, LimiterError::AlreadyStopped));
}

#[tokio::test(start_paused = true)]
async fn test_custom_stop_messages() {
    let limiter = Limiter::new(LimiterSettings::new("custom").with_max_concurrent(1)).unwrap();
    let probe = Probe::new();
    let _running = limiter
        .schedule_task(JobOptions::new(), probe.task("running", ms(100)))
        .await;
    let waiting = limiter
        .schedule_task(JobOptions::new(), probe.task("waiting", ms(10)))
        .await;
    sleep(ms(1)).await;

    let options = StopOptions {
        drop_error_message: "shutting down".to_string(),
        enqueue_error_message: "closed".to_string(),
        ..StopOptions::default()
    };
    limiter.stop(options).await.unwrap();

    assert_eq!(waiting.await.unwrap_err().to_string(), "shutting down");
    let late = limiter
        .schedule(JobOptions::new(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .await
        .unwrap_err();
    assert_eq!(late.to_string(), "closed");
}
