//! Limiter: the scheduling façade.
//!
//! Jobs enter through [`Limiter::schedule`], pass the store's `submit` check
//! under the submission lock, wait in the priority queues and leave them
//! through the drain loop, which calls the store's `register` under the
//! registration lock. Both locks are FIFO, so submissions and drains are
//! processed in arrival order.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tokio::time::sleep;

use sluice_core::{
    random_index, Datastore, Events, JobInfo, JobOptions, JobStatus, LimiterError,
    LimiterEvent, LimiterSettings, LimiterSettingsUpdate, Queues, StatusCounts, StopOptions,
    Strategy, NUM_PRIORITIES,
};
use sluice_store::{
    create_store, keys, AdmissionStore, AtomicBackend, StoreContext, StoreError, StoreSignal,
};

use crate::job::{lock, task_fn, Job, JobHandle, JobHost, JobTracker, TaskFn};

struct Scheduled {
    timeout: AbortHandle,
    expiration: Option<AbortHandle>,
    job: Arc<Job>,
}

/// Counts a submission waiting for the submission lock.
struct PendingSubmission<'a> {
    count: &'a AtomicUsize,
}

impl<'a> PendingSubmission<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for PendingSubmission<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct LimiterInner {
    me: Weak<LimiterInner>,
    id: String,
    settings: Mutex<LimiterSettings>,
    store: Arc<dyn AdmissionStore>,
    events: Events,
    tracker: Arc<JobTracker>,
    queues: Arc<Mutex<Queues<Arc<Job>>>>,
    scheduled: Mutex<HashMap<String, Scheduled>>,
    submit_lock: AsyncMutex<()>,
    register_lock: AsyncMutex<()>,
    pending_submissions: AtomicUsize,
    chained: Mutex<Option<Limiter>>,
    stopped: OnceLock<StopOptions>,
    dropping: AtomicBool,
    signals: Mutex<Option<AbortHandle>>,
}

async fn signal_loop(inner: Weak<LimiterInner>, mut signals: mpsc::UnboundedReceiver<StoreSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match signal {
            StoreSignal::Drain { capacity, reply } => {
                tokio::spawn(async move {
                    let drained = inner.drain_all(capacity).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(drained);
                    }
                });
            }
            StoreSignal::DropAllQueued => inner.drop_all_queued(None),
            StoreSignal::Message(message) => inner.events.emit(LimiterEvent::Message(message)),
            StoreSignal::Error(error) => {
                tracing::warn!(limiter_id = %inner.id, error = %error, "Store reported an error");
                inner.events.emit(LimiterEvent::Error(error.into()));
            }
        }
    }
}

impl LimiterInner {
    fn is_empty(&self) -> bool {
        lock(&self.queues).is_empty() && self.pending_submissions.load(Ordering::SeqCst) == 0
    }

    fn drop_message(&self) -> Option<String> {
        self.stopped
            .get()
            .map(|options| options.drop_error_message.clone())
    }

    fn make_job<T: Send + 'static>(
        &self,
        options: JobOptions,
        task: TaskFn<T>,
    ) -> (Arc<Job>, JobHandle<T>) {
        let reject_on_drop = lock(&self.settings).reject_on_drop;
        Job::new(
            options.sanitize(),
            task,
            reject_on_drop,
            Arc::clone(&self.tracker),
            self.events.clone(),
        )
    }

    async fn receive(&self, job: Arc<Job>) -> bool {
        if let Some(options) = self.stopped.get() {
            job.reject(LimiterError::Stopped(options.enqueue_error_message.clone()));
            return false;
        }
        self.enqueue(job).await
    }

    async fn enqueue(&self, job: Arc<Job>) -> bool {
        if !job.do_receive() {
            return false;
        }
        let pending = PendingSubmission::new(&self.pending_submissions);
        let _submission = self.submit_lock.lock().await;
        drop(pending);
        self.add_to_queue(job).await
    }

    /// Returns whether the queue had reached its high-water mark.
    async fn add_to_queue(&self, job: Arc<Job>) -> bool {
        let queued = lock(&self.queues).len() as u64;
        let weight = job.spec().weight;

        let outcome = match self.store.submit(queued, weight).await {
            Ok(outcome) => outcome,
            Err(error @ StoreError::Overweight { .. }) => {
                job.do_drop(Some(error.into()));
                return false;
            }
            Err(error) => {
                let error = LimiterError::from(error);
                tracing::error!(
                    limiter_id = %self.id,
                    job_id = %job.id(),
                    error = %error,
                    "Submission failed"
                );
                self.events.emit(LimiterEvent::Error(error.clone()));
                job.do_drop(Some(error));
                return false;
            }
        };

        if outcome.blocked {
            tracing::debug!(
                limiter_id = %self.id,
                job_id = %job.id(),
                "Limiter blocked, dropping queue"
            );
            job.do_drop(None);
            self.drop_all_queued(None);
            return true;
        }

        if outcome.reached_hwm {
            let priority = job.spec().priority as usize;
            let shifted = match outcome.strategy {
                Strategy::Leak => lock(&self.queues).shift_last_from(priority),
                Strategy::OverflowPriority => lock(&self.queues).shift_last_from(priority + 1),
                Strategy::Overflow => Some(Arc::clone(&job)),
                Strategy::Block => None,
            };
            match shifted {
                Some(evicted) => {
                    tracing::debug!(
                        limiter_id = %self.id,
                        job_id = %evicted.id(),
                        strategy = ?outcome.strategy,
                        "High-water mark reached, dropping job"
                    );
                    evicted.do_drop(None);
                    if outcome.strategy == Strategy::Overflow {
                        return true;
                    }
                }
                None => {
                    job.do_drop(None);
                    return true;
                }
            }
        }

        if let Err(error) = job.do_queue(outcome.reached_hwm, outcome.blocked) {
            job.fail_loudly(error);
            return outcome.reached_hwm;
        }
        lock(&self.queues).push(job);
        self.drain_all(None).await;
        outcome.reached_hwm
    }

    /// Admits the head of the queue. Returns the weight admitted, or `None`
    /// when nothing more can be admitted.
    async fn drain_one(&self, capacity: Option<u64>) -> Option<u64> {
        if self.dropping.load(Ordering::SeqCst) {
            return None;
        }
        let _registration = self.register_lock.lock().await;

        let head = lock(&self.queues).first().cloned();
        let job = head?;
        let weight = job.spec().weight;
        if capacity.is_some_and(|capacity| weight > capacity) {
            return None;
        }

        let index = random_index();
        let outcome = match self
            .store
            .register(&index, weight, job.spec().expiration)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                let error = LimiterError::from(error);
                tracing::error!(
                    limiter_id = %self.id,
                    job_id = %job.id(),
                    error = %error,
                    "Registration failed"
                );
                self.events.emit(LimiterEvent::Error(error.clone()));
                let removed = lock(&self.queues).remove(job.spec().priority, job.id());
                if let Some(job) = removed {
                    job.do_drop(Some(error));
                }
                return None;
            }
        };
        if !outcome.success {
            return None;
        }

        let removed = lock(&self.queues).remove(job.spec().priority, job.id());
        if removed.is_none() {
            // Evicted while registering
            self.release(&index, weight).await;
            return Some(0);
        }

        let empty = self.is_empty();
        if empty {
            self.events.emit(LimiterEvent::Empty);
        }
        if outcome.reservoir == Some(0) {
            self.events.emit(LimiterEvent::Depleted { empty });
        }
        tracing::debug!(
            limiter_id = %self.id,
            job_id = %job.id(),
            wait_ms = outcome.wait.as_millis() as u64,
            "Job admitted"
        );
        self.run(index, job, outcome.wait);
        Some(weight)
    }

    async fn drain_all(&self, mut capacity: Option<u64>) -> u64 {
        let mut total = 0;
        while let Some(drained) = self.drain_one(capacity).await {
            total += drained;
            capacity = capacity.map(|capacity| capacity.saturating_sub(drained));
        }
        total
    }

    fn drop_all_queued(&self, message: Option<&str>) {
        let jobs = lock(&self.queues).shift_all();
        for job in jobs {
            job.do_drop(message.map(|message| LimiterError::Dropped(message.to_string())));
        }
    }

    /// Schedules the job's execution after `wait`, and its expiration if it has one.
    fn run(&self, index: String, job: Arc<Job>, wait: Duration) {
        if self.dropping.load(Ordering::SeqCst) {
            job.do_drop(self.drop_message().map(LimiterError::Dropped));
            return;
        }
        if let Err(error) = job.do_run() {
            job.fail_loudly(error);
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        // Held while the timers start so they cannot finish before being recorded
        let mut scheduled = lock(&self.scheduled);
        let timeout = {
            let (me, job, index) = (Arc::clone(&me), Arc::clone(&job), index.clone());
            tokio::spawn(async move {
                sleep(wait).await;
                tokio::spawn(async move { job.do_execute(&*me, &index).await });
            })
            .abort_handle()
        };
        let expiration = job.spec().expiration.map(|expiration| {
            let (me, job, index) = (Arc::clone(&me), Arc::clone(&job), index.clone());
            tokio::spawn(async move {
                sleep(wait + expiration).await;
                tokio::spawn(async move { job.do_expire(&*me, &index).await });
            })
            .abort_handle()
        });
        scheduled.insert(
            index,
            Scheduled {
                timeout,
                expiration,
                job,
            },
        );
    }

    async fn release(&self, index: &str, weight: u64) {
        match self.store.free(index, weight).await {
            Ok(running) => {
                tracing::debug!(limiter_id = %self.id, index, running, "Released capacity");
                if running == 0 && self.is_empty() {
                    self.events.emit(LimiterEvent::Idle);
                }
            }
            Err(error) => {
                tracing::error!(
                    limiter_id = %self.id,
                    index,
                    error = %error,
                    "Failed to release capacity"
                );
                self.events.emit(LimiterEvent::Error(error.into()));
            }
        }
    }

    async fn stop(&self, options: StopOptions) -> Result<(), LimiterError> {
        if self.stopped.set(options.clone()).is_err() {
            return Err(LimiterError::AlreadyStopped);
        }
        tracing::info!(
            limiter_id = %self.id,
            drop_waiting_jobs = options.drop_waiting_jobs,
            "Stopping limiter"
        );

        if !options.drop_waiting_jobs {
            let tracker = Arc::clone(&self.tracker);
            let sentinel = JobOptions::new()
                .with_priority(NUM_PRIORITIES as i32 - 1)
                .with_weight(0);
            let (job, handle) = self.make_job(
                sentinel,
                task_fn(move || {
                    let tracker = Arc::clone(&tracker);
                    async move {
                        tracker.wait_until(|counts| counts.pending() <= 1).await;
                        Ok(())
                    }
                }),
            );
            self.enqueue(job).await;
            return match handle.settle().await {
                Some(Err(error)) => Err(error),
                _ => Ok(()),
            };
        }

        self.dropping.store(true, Ordering::SeqCst);
        let _registration = self.register_lock.lock().await;
        let _submission = self.submit_lock.lock().await;

        let waiting: Vec<Scheduled> = {
            let mut scheduled = lock(&self.scheduled);
            let indexes: Vec<String> = scheduled
                .iter()
                // Admitted, or waiting to retry, but not started yet
                .filter(|(_, entry)| {
                    matches!(
                        self.tracker.status(entry.job.id()),
                        Some(JobStatus::Running | JobStatus::Executing)
                    ) && !entry.timeout.is_finished()
                })
                .map(|(index, _)| index.clone())
                .collect();
            indexes
                .iter()
                .filter_map(|index| scheduled.remove(index))
                .collect()
        };
        for entry in waiting {
            entry.timeout.abort();
            if let Some(expiration) = entry.expiration {
                expiration.abort();
            }
            entry
                .job
                .do_drop(Some(LimiterError::Dropped(options.drop_error_message.clone())));
        }
        self.drop_all_queued(Some(&options.drop_error_message));

        self.tracker.wait_until(|counts| counts.pending() == 0).await;
        tracing::info!(limiter_id = %self.id, "Limiter stopped");
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHost for LimiterInner {
    fn clear_global_state(&self, index: &str) -> bool {
        let entry = lock(&self.scheduled).remove(index);
        match entry {
            Some(entry) => {
                entry.timeout.abort();
                if let Some(expiration) = entry.expiration {
                    expiration.abort();
                }
                true
            }
            None => false,
        }
    }

    fn schedule_retry(&self, index: &str, job: Arc<Job>, delay: Duration) {
        self.run(index.to_string(), job, delay);
    }

    async fn free(&self, index: &str, weight: u64) {
        self.release(index, weight).await;
    }

    fn chained(&self) -> Option<Limiter> {
        lock(&self.chained).clone()
    }
}

/// Rate limiter handle. Cheap to clone; clones share one limiter.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("id", &self.inner.id)
            .field("datastore", &self.inner.store.datastore())
            .field("queued", &self.queued(None))
            .finish()
    }
}

impl Limiter {
    /// Limiter with in-process accounting. Distributed limiters are built with
    /// [`Limiter::with_backend`].
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(settings: LimiterSettings) -> Result<Self, LimiterError> {
        Self::build(settings, None)
    }

    /// Limiter whose distributed store runs on `backend`.
    pub fn with_backend(
        settings: LimiterSettings,
        backend: Arc<dyn AtomicBackend>,
    ) -> Result<Self, LimiterError> {
        Self::build(settings, Some(backend))
    }

    fn build(
        settings: LimiterSettings,
        backend: Option<Arc<dyn AtomicBackend>>,
    ) -> Result<Self, LimiterError> {
        settings
            .validate()
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        let events = Events::new();
        let queues = Arc::new(Mutex::new(Queues::new(Some(events.clone()))));
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::clone(&queues);
        let context = StoreContext::new(tx, Arc::new(move || lock(&probe).len() as u64));
        let store = create_store(&settings, backend, context)?;

        let inner = Arc::new_cyclic(|me| LimiterInner {
            me: me.clone(),
            id: settings.id.clone(),
            tracker: Arc::new(JobTracker::new(settings.track_done_status)),
            settings: Mutex::new(settings),
            store,
            events,
            queues,
            scheduled: Mutex::new(HashMap::new()),
            submit_lock: AsyncMutex::new(()),
            register_lock: AsyncMutex::new(()),
            pending_submissions: AtomicUsize::new(0),
            chained: Mutex::new(None),
            stopped: OnceLock::new(),
            dropping: AtomicBool::new(false),
            signals: Mutex::new(None),
        });
        let signals = tokio::spawn(signal_loop(Arc::downgrade(&inner), rx));
        *lock(&inner.signals) = Some(signals.abort_handle());

        tracing::debug!(
            limiter_id = %inner.id,
            datastore = %inner.store.datastore(),
            "Limiter created"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn datastore(&self) -> Datastore {
        self.inner.store.datastore()
    }

    /// Current settings, with the store limits last applied.
    pub fn settings(&self) -> LimiterSettings {
        let mut settings = lock(&self.inner.settings).clone();
        settings.store = self.inner.store.settings();
        settings
    }

    /// Schedules `task`. Resolves once the job has been queued or rejected;
    /// the returned handle resolves with the task's outcome.
    pub async fn schedule<T, F, Fut>(&self, options: JobOptions, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.schedule_task(options, task_fn(task)).await
    }

    #[tracing::instrument(skip_all, fields(limiter_id = %self.inner.id))]
    pub async fn schedule_task<T: Send + 'static>(
        &self,
        options: JobOptions,
        task: TaskFn<T>,
    ) -> JobHandle<T> {
        let (job, handle) = self.inner.make_job(options, task);
        self.inner.receive(job).await;
        handle
    }

    /// Schedules `task` and hands its outcome to `callback`. Returns whether
    /// the queue had reached its high-water mark. A silently dropped job never
    /// calls `callback`.
    pub async fn submit<T, F, Fut, C>(&self, options: JobOptions, task: F, callback: C) -> bool
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        C: FnOnce(Result<T, LimiterError>) + Send + 'static,
    {
        let (job, handle) = self.inner.make_job(options, task_fn(task));
        tokio::spawn(async move {
            if let Some(result) = handle.settle().await {
                callback(result);
            }
        });
        self.inner.receive(job).await
    }

    /// Rate-limited version of `task`.
    pub fn wrap<A, T, F, Fut>(&self, task: F) -> Wrapped<A, T>
    where
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Wrapped {
            limiter: self.clone(),
            task: Arc::new(move |args| task(args).boxed()),
            _args: PhantomData,
        }
    }

    /// Every job admitted here also has to pass through `limiter` before running.
    pub fn chain(&self, limiter: Option<&Limiter>) {
        *lock(&self.inner.chained) = limiter.cloned();
    }

    /// Drains queued jobs into up to `capacity` weight. Returns the weight admitted.
    pub async fn drain_all(&self, capacity: Option<u64>) -> u64 {
        self.inner.drain_all(capacity).await
    }

    pub async fn update_settings(&self, update: LimiterSettingsUpdate) -> Result<(), LimiterError> {
        let mut candidate = self.settings();
        candidate.apply(&update);
        candidate
            .validate()
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        self.inner.store.update_settings(&update.store).await?;
        lock(&self.inner.settings).apply(&update);
        tracing::debug!(limiter_id = %self.inner.id, "Settings updated");
        Ok(())
    }

    pub async fn current_reservoir(&self) -> Result<Option<u64>, LimiterError> {
        Ok(self.inner.store.current_reservoir().await?)
    }

    pub async fn increment_reservoir(&self, amount: i64) -> Result<Option<u64>, LimiterError> {
        Ok(self.inner.store.increment_reservoir(amount).await?)
    }

    pub async fn running(&self) -> Result<u64, LimiterError> {
        Ok(self.inner.store.running().await?)
    }

    pub async fn done(&self) -> Result<u64, LimiterError> {
        Ok(self.inner.store.done().await?)
    }

    /// Jobs waiting in this process, optionally at one priority.
    pub fn queued(&self, priority: Option<u8>) -> usize {
        lock(&self.inner.queues).queued(priority)
    }

    /// Jobs waiting across every process sharing this limiter.
    pub async fn cluster_queued(&self) -> Result<u64, LimiterError> {
        Ok(self.inner.store.queued().await?)
    }

    /// Whether a job of `weight` would start right now.
    pub async fn check(&self, weight: u64) -> Result<bool, LimiterError> {
        Ok(self.inner.store.check(weight).await?)
    }

    /// No job is queued or waiting to be submitted.
    pub fn empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.inner.tracker.status(id)
    }

    pub fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<String>, LimiterError> {
        self.inner.tracker.jobs(status)
    }

    pub fn counts(&self) -> StatusCounts {
        self.inner.tracker.counts()
    }

    /// Stops accepting jobs.
    ///
    /// With `drop_waiting_jobs`, every job not yet executing is dropped and the
    /// call resolves once executing jobs have finished. Otherwise the call
    /// resolves once every job already accepted has finished.
    pub async fn stop(&self, options: StopOptions) -> Result<(), LimiterError> {
        self.inner.stop(options).await
    }

    pub async fn publish(&self, message: &str) -> Result<(), LimiterError> {
        Ok(self.inner.store.publish(message).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.inner.events.subscribe()
    }

    /// Decides retries: `handler` returns the delay before the next attempt,
    /// or `None` to fail the job.
    pub fn on_failed<H>(&self, handler: H)
    where
        H: Fn(&LimiterError, &JobInfo) -> Option<Duration> + Send + Sync + 'static,
    {
        self.inner.events.set_failure_handler(Arc::new(handler));
    }

    pub async fn ready(&self) -> Result<(), LimiterError> {
        Ok(self.inner.store.ready().await?)
    }

    pub async fn disconnect(&self) -> Result<(), LimiterError> {
        self.inner.store.disconnect().await?;
        if let Some(signals) = lock(&self.inner.signals).take() {
            signals.abort();
        }
        tracing::debug!(limiter_id = %self.inner.id, "Limiter disconnected");
        Ok(())
    }

    /// Broadcast channel shared by every process of this limiter.
    pub fn channel(&self) -> String {
        keys::channel(&self.inner.id)
    }

    /// Channel addressed to this process only.
    pub fn channel_client(&self) -> String {
        keys::client_channel(&self.inner.id, self.inner.store.client_id())
    }

    pub(crate) async fn group_check(&self) -> Result<bool, LimiterError> {
        Ok(self.inner.store.group_check().await?)
    }

    pub(crate) fn report_error(&self, error: LimiterError) {
        tracing::warn!(limiter_id = %self.inner.id, error = %error, "Limiter error");
        self.inner.events.emit(LimiterEvent::Error(error));
    }
}

type WrappedTask<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// A function whose calls are scheduled on a limiter. See [`Limiter::wrap`].
pub struct Wrapped<A, T> {
    limiter: Limiter,
    task: WrappedTask<A, T>,
    _args: PhantomData<fn(A)>,
}

impl<A, T> Clone for Wrapped<A, T> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            task: Arc::clone(&self.task),
            _args: PhantomData,
        }
    }
}

impl<A, T> Wrapped<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    pub async fn call(&self, args: A) -> Result<T, LimiterError> {
        self.call_with_options(JobOptions::new(), args).await
    }

    pub async fn call_with_options(&self, options: JobOptions, args: A) -> Result<T, LimiterError> {
        let wrapped = Arc::clone(&self.task);
        let task: TaskFn<T> = Arc::new(move || wrapped(args.clone()));
        self.limiter.schedule_task(options, task).await.await
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }
}
