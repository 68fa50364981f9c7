mod helpers;

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use helpers::{drain_events, ms, Probe};
use sluice_limiter::{
    JobOptions, JobStatus, Limiter, LimiterError, LimiterEvent, LimiterSettings,
    LimiterSettingsUpdate, StoreSettingsUpdate,
};

#[tokio::test(start_paused = true)]
async fn test_running_never_exceeds_max_concurrent() {
    let limiter = Limiter::new(LimiterSettings::new("cap").with_max_concurrent(2)).unwrap();
    let mut events = limiter.subscribe();
    let probe = Probe::new();

    let mut handles = Vec::new();
    for i in 0..6 {
        let task = probe.task(&format!("job-{i}"), ms(100));
        handles.push(limiter.schedule_task(JobOptions::new(), task).await);
    }
    assert_eq!(limiter.queued(None), 4);

    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(probe.peak(), 2);
    assert_eq!(probe.start_times()[4], ms(200));
    assert_eq!(limiter.done().await.unwrap(), 6);
    assert_eq!(limiter.running().await.unwrap(), 0);
    assert!(limiter.empty());

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(e, LimiterEvent::Idle)));
    assert!(events.iter().any(|e| matches!(e, LimiterEvent::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_admissions_are_spaced_by_min_time() {
    let limiter = Limiter::new(LimiterSettings::new("spacing").with_min_time(ms(100))).unwrap();
    let probe = Probe::new();

    let mut handles = Vec::new();
    for i in 0..4 {
        let task = probe.task(&format!("job-{i}"), ms(0));
        handles.push(limiter.schedule_task(JobOptions::new(), task).await);
    }
    join_all(handles).await;

    let times = probe.start_times();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= ms(100), "{times:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_reservoir_depletes_and_retries_do_not_consume_it() {
    let limiter = Limiter::new(LimiterSettings::new("quota").with_reservoir(3)).unwrap();
    let mut events = limiter.subscribe();
    limiter.on_failed(|_, job| (job.id == "flaky" && job.retry_count == 0).then(|| ms(25)));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = limiter
        .schedule(JobOptions::new().with_id("flaky"), move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok("recovered".to_string())
            }
        })
        .await;

    let probe = Probe::new();
    let b = limiter
        .schedule_task(JobOptions::new(), probe.task("b", ms(10)))
        .await;
    let c = limiter
        .schedule_task(JobOptions::new(), probe.task("c", ms(10)))
        .await;
    let d = limiter
        .schedule_task(JobOptions::new().with_id("d"), probe.task("d", ms(10)))
        .await;

    assert_eq!(flaky.await.unwrap(), "recovered");
    assert_eq!(b.await.unwrap(), "b");
    assert_eq!(c.await.unwrap(), "c");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    assert_eq!(limiter.current_reservoir().await.unwrap(), Some(0));
    assert_eq!(limiter.queued(None), 1);
    assert_eq!(limiter.job_status("d"), Some(JobStatus::Queued));

    assert_eq!(limiter.increment_reservoir(1).await.unwrap(), Some(1));
    assert_eq!(d.await.unwrap(), "d");
    assert_eq!(limiter.current_reservoir().await.unwrap(), Some(0));

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, LimiterEvent::Retry { delay, .. } if *delay == ms(25))));
    assert!(events
        .iter()
        .any(|e| matches!(e, LimiterEvent::Depleted { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_queued_jobs_drain_by_priority() {
    let limiter = Limiter::new(LimiterSettings::new("prio").with_max_concurrent(1)).unwrap();
    let probe = Probe::new();

    let mut handles = vec![
        limiter
            .schedule_task(JobOptions::new(), probe.task("blocker", ms(50)))
            .await,
    ];
    for (name, priority) in [("a", 5), ("b", 1), ("c", 5), ("d", 0)] {
        let options = JobOptions::new().with_priority(priority);
        handles.push(limiter.schedule_task(options, probe.task(name, ms(10))).await);
    }
    assert_eq!(limiter.queued(Some(5)), 2);

    join_all(handles).await;
    assert_eq!(probe.order(), ["blocker", "d", "b", "a", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_jobs_reject_and_release_capacity() {
    let limiter = Limiter::new(LimiterSettings::new("expiry").with_max_concurrent(1)).unwrap();
    let probe = Probe::new();

    let slow = limiter
        .schedule_task(
            JobOptions::new().with_expiration(ms(50)),
            probe.task("slow", ms(200)),
        )
        .await;
    let next = limiter
        .schedule_task(JobOptions::new(), probe.task("next", ms(10)))
        .await;

    let error = slow.await.unwrap_err();
    assert!(matches!(&error, LimiterError::Expired { after } if *after == ms(50)));
    assert_eq!(error.to_string(), "This job timed out after 50 ms.");
    assert_eq!(next.await.unwrap(), "next");
    assert_eq!(probe.start_times()[1], ms(50));
}

#[tokio::test(start_paused = true)]
async fn test_min_time_update_round_trip() {
    let limiter = Limiter::new(LimiterSettings::new("update")).unwrap();
    limiter
        .update_settings(LimiterSettingsUpdate::store(
            StoreSettingsUpdate::default().min_time(ms(250)),
        ))
        .await
        .unwrap();
    assert_eq!(limiter.settings().store.min_time, ms(250));

    let probe = Probe::new();
    let first = limiter
        .schedule_task(JobOptions::new(), probe.task("first", ms(0)))
        .await;
    let second = limiter
        .schedule_task(JobOptions::new(), probe.task("second", ms(0)))
        .await;
    first.await.unwrap();
    second.await.unwrap();
    let times = probe.start_times();
    assert!(times[1] - times[0] >= ms(250));

    limiter
        .update_settings(LimiterSettingsUpdate::store(
            StoreSettingsUpdate::default().min_time(ms(0)),
        ))
        .await
        .unwrap();
    assert_eq!(limiter.settings().store.min_time, ms(0));
}

#[tokio::test(start_paused = true)]
async fn test_chained_limiter_gates_execution() {
    let outer = Limiter::new(LimiterSettings::new("outer")).unwrap();
    let inner = Limiter::new(LimiterSettings::new("inner").with_max_concurrent(1)).unwrap();
    outer.chain(Some(&inner));
    let probe = Probe::new();

    let mut handles = Vec::new();
    for i in 0..3 {
        let task = probe.task(&format!("job-{i}"), ms(50));
        handles.push(outer.schedule_task(JobOptions::new(), task).await);
    }
    for result in join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(probe.peak(), 1);
    assert_eq!(outer.done().await.unwrap(), 3);
    assert_eq!(inner.done().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_weighted_jobs_share_capacity() {
    let limiter = Limiter::new(LimiterSettings::new("weights").with_max_concurrent(3)).unwrap();
    let probe = Probe::new();

    let heavy = limiter
        .schedule_task(JobOptions::new().with_weight(2), probe.task("heavy", ms(100)))
        .await;
    let other = limiter
        .schedule_task(JobOptions::new().with_weight(2), probe.task("other", ms(100)))
        .await;
    let light = limiter
        .schedule_task(JobOptions::new().with_weight(1), probe.task("light", ms(100)))
        .await;

    // The head of the queue needs 2 units, so the lighter job waits behind it
    assert!(!limiter.check(2).await.unwrap());
    heavy.await.unwrap();
    other.await.unwrap();
    light.await.unwrap();
    assert_eq!(probe.order(), ["heavy", "other", "light"]);
    assert_eq!(limiter.done().await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_status_queries_follow_the_lifecycle() {
    let limiter = Limiter::new(
        LimiterSettings::new("status")
            .with_max_concurrent(1)
            .with_track_done_status(true),
    )
    .unwrap();
    let probe = Probe::new();

    let first = limiter
        .schedule_task(JobOptions::new().with_id("first"), probe.task("first", ms(100)))
        .await;
    let second = limiter
        .schedule_task(JobOptions::new().with_id("second"), probe.task("second", ms(100)))
        .await;
    tokio::time::sleep(ms(10)).await;

    assert_eq!(limiter.job_status("first"), Some(JobStatus::Executing));
    assert_eq!(limiter.job_status("second"), Some(JobStatus::Queued));
    assert_eq!(limiter.jobs(Some(JobStatus::Queued)).unwrap(), ["second"]);
    let counts = limiter.counts();
    assert_eq!((counts.queued, counts.executing), (1, 1));

    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(limiter.counts().done, 2);
    assert_eq!(limiter.job_status("first"), Some(JobStatus::Done));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_releases_its_capacity() {
    let limiter = Limiter::new(LimiterSettings::new("panics").with_max_concurrent(1)).unwrap();

    let a = limiter
        .schedule(JobOptions::new(), || async {
            if true {
                panic!("task blew up");
            }
            Ok::<u32, anyhow::Error>(1)
        })
        .await;
    let b = limiter
        .schedule(JobOptions::new(), || async { Ok::<u32, anyhow::Error>(2) })
        .await;

    let error = a.await.unwrap_err();
    assert!(matches!(error, LimiterError::Task(_)));
    assert_eq!(error.to_string(), "Task panicked: task blew up");
    assert_eq!(b.await.unwrap(), 2);
    assert_eq!(limiter.running().await.unwrap(), 0);
    assert_eq!(limiter.counts().pending(), 0);

    limiter.stop(sluice_limiter::StopOptions::default()).await.unwrap();
}
