#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use sluice_limiter::{task_fn, LimiterEvent, TaskFn};

/// Records when tasks start and how many run at once.
#[derive(Debug)]
pub struct Probe {
    origin: Instant,
    active: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<(String, Duration)>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        })
    }

    /// Task named `name` that runs for `duration` and returns its name.
    pub fn task(self: &Arc<Self>, name: &str, duration: Duration) -> TaskFn<String> {
        let probe = Arc::clone(self);
        let name = name.to_string();
        task_fn(move || {
            let probe = Arc::clone(&probe);
            let name = name.clone();
            async move {
                probe.enter(&name);
                sleep(duration).await;
                probe.active.fetch_sub(1, Ordering::SeqCst);
                Ok(name)
            }
        })
    }

    fn enter(&self, name: &str) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.starts
            .lock()
            .unwrap()
            .push((name.to_string(), self.origin.elapsed()));
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Task names in start order.
    pub fn order(&self) -> Vec<String> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Start offsets from the probe's creation, in start order.
    pub fn start_times(&self) -> Vec<Duration> {
        self.starts.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Every event received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<LimiterEvent>) -> Vec<LimiterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
