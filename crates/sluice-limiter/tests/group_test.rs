mod helpers;

use helpers::ms;
use sluice_limiter::{Group, GroupEvent, GroupSettings, JobOptions, Limiter, LimiterSettings};
use tokio::time::sleep;

async fn run_one(limiter: &Limiter) {
    limiter
        .schedule(JobOptions::new(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_limiters_are_swept() {
    let settings = GroupSettings::new("sweep", LimiterSettings::default())
        .with_timeout(Some(ms(1000)));
    let group = Group::new(settings).unwrap();
    let mut events = group.subscribe();

    let limiter = group.key("tenant").unwrap();
    run_one(&limiter).await;
    assert_eq!(group.keys(), ["tenant"]);

    sleep(ms(2000)).await;
    assert!(group.keys().is_empty());

    group.key("tenant").unwrap();
    let mut created = 0;
    while let Ok(GroupEvent::Created { key, .. }) = events.try_recv() {
        assert_eq!(key, "tenant");
        created += 1;
    }
    assert_eq!(created, 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_limiters_survive_the_sweep() {
    let settings = GroupSettings::new("busy", LimiterSettings::default())
        .with_timeout(Some(ms(1000)));
    let group = Group::new(settings).unwrap();
    let limiter = group.key("tenant").unwrap();

    for _ in 0..4 {
        sleep(ms(600)).await;
        run_one(&limiter).await;
    }
    assert_eq!(group.keys(), ["tenant"]);
}

#[tokio::test(start_paused = true)]
async fn test_group_limiters_are_independent() {
    let settings = GroupSettings::new(
        "tenants",
        LimiterSettings::default().with_max_concurrent(1),
    );
    let group = Group::new(settings).unwrap();

    let a = group.key("a").unwrap();
    let b = group.key("b").unwrap();
    assert_eq!(a.id(), "tenants-a");
    assert_eq!(b.settings().store.max_concurrent, Some(1));

    let slow = a
        .schedule(JobOptions::new(), || async {
            sleep(ms(1000)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await;
    // b is not held up by a's running job
    run_one(&b).await;
    assert_eq!(a.running().await.unwrap(), 1);
    slow.await.unwrap();

    let mut keys = group.keys();
    keys.sort();
    assert_eq!(keys, ["a", "b"]);
    assert!(group.last_access("a").is_some());
    assert!(group.last_access("missing").is_none());
}
