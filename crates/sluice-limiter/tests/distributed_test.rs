mod helpers;

use futures::future::join_all;
use helpers::{drain_events, ms, Probe};
use sluice_limiter::{
    AtomicBackend, Datastore, JobOptions, Limiter, LimiterEvent, LimiterSettings,
    MemoryBackend,
};
use std::sync::Arc;
use tokio::time::sleep;

fn cluster(settings: LimiterSettings, processes: usize) -> Vec<Limiter> {
    let backend: Arc<dyn AtomicBackend> = MemoryBackend::shared();
    let settings = settings.with_datastore(Datastore::Distributed);
    (0..processes)
        .map(|_| Limiter::with_backend(settings.clone(), Arc::clone(&backend)).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_processes_share_a_concurrency_limit() {
    let limiters = cluster(LimiterSettings::new("fleet").with_max_concurrent(2), 2);
    for limiter in &limiters {
        limiter.ready().await.unwrap();
    }
    let probe = Probe::new();

    let mut handles = Vec::new();
    for i in 0..4 {
        for (process, limiter) in limiters.iter().enumerate() {
            let task = probe.task(&format!("p{process}-{i}"), ms(100));
            handles.push(limiter.schedule_task(JobOptions::new(), task).await);
        }
    }
    for result in join_all(handles).await {
        result.unwrap();
    }

    assert!(probe.peak() <= 2, "peak was {}", probe.peak());
    assert_eq!(probe.order().len(), 8);
    assert_eq!(limiters[0].done().await.unwrap(), 8);
    assert_eq!(limiters[1].running().await.unwrap(), 0);
    assert_eq!(limiters[0].cluster_queued().await.unwrap(), 0);

    for limiter in &limiters {
        limiter.disconnect().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_shared_reservoir_is_consumed_once() {
    let limiters = cluster(LimiterSettings::new("quota").with_reservoir(3), 2);
    for limiter in &limiters {
        limiter.ready().await.unwrap();
    }

    let probe = Probe::new();
    let mut handles = Vec::new();
    for i in 0..2 {
        for (process, limiter) in limiters.iter().enumerate() {
            let task = probe.task(&format!("p{process}-{i}"), ms(10));
            handles.push(limiter.schedule_task(JobOptions::new(), task).await);
        }
    }
    sleep(ms(100)).await;

    assert_eq!(probe.order().len(), 3);
    assert_eq!(limiters[1].current_reservoir().await.unwrap(), Some(0));
    assert_eq!(limiters[0].cluster_queued().await.unwrap(), 1);

    limiters[1].increment_reservoir(1).await.unwrap();
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(probe.order().len(), 4);

    for limiter in &limiters {
        limiter.disconnect().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_published_messages_reach_every_process() {
    let limiters = cluster(LimiterSettings::new("chat"), 2);
    for limiter in &limiters {
        limiter.ready().await.unwrap();
    }
    let mut receivers: Vec<_> = limiters.iter().map(Limiter::subscribe).collect();

    limiters[0].publish("hello").await.unwrap();
    sleep(ms(10)).await;

    for receiver in &mut receivers {
        let events = drain_events(receiver);
        assert!(events
            .iter()
            .any(|e| matches!(e, LimiterEvent::Message(m) if m == "hello")));
    }

    for limiter in &limiters {
        limiter.disconnect().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_limiter_reports_errors() {
    let limiters = cluster(LimiterSettings::new("gone"), 1);
    let limiter = &limiters[0];
    limiter.ready().await.unwrap();
    limiter.disconnect().await.unwrap();

    assert!(limiter.running().await.is_err());
    let result = limiter
        .schedule(JobOptions::new(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .await;
    assert!(result.is_err());
}
