//! Job lifecycle
//!
//! A [`Job`] walks RECEIVED → QUEUED → RUNNING → EXECUTING → DONE. Every
//! transition checks the current status first; a job found in an unexpected
//! status emits [`LimiterEvent::Error`] and is dropped with
//! [`LimiterError::InvalidStatus`].
//!
//! The task body is type-erased behind [`Runnable`] so queues and timers only
//! ever handle `Arc<Job>`. The caller keeps a typed [`JobHandle`].

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use sluice_core::{
    Events, JobInfo, JobOptions, JobSpec, JobStates, JobStatus, LimiterError, LimiterEvent,
    LogLevel, Queueable, StatusCounts,
};

use crate::limiter::Limiter;

/// A task body. Called once per attempt.
pub type TaskFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Erases a closure into a [`TaskFn`].
pub fn task_fn<T, F, Fut>(task: F) -> TaskFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move || task().boxed())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State registry shared by a limiter and its jobs. Wakes waiters on every change.
#[derive(Debug)]
pub(crate) struct JobTracker {
    states: Mutex<JobStates>,
    changed: Notify,
}

impl JobTracker {
    pub(crate) fn new(track_done_status: bool) -> Self {
        Self {
            states: Mutex::new(JobStates::new(track_done_status)),
            changed: Notify::new(),
        }
    }

    /// Starts tracking `id`. False if the id is already tracked.
    fn start(&self, id: &str) -> bool {
        {
            let mut states = lock(&self.states);
            if states.job_status(id).is_some() {
                return false;
            }
            states.start(id);
        }
        self.changed.notify_waiters();
        true
    }

    fn next(&self, id: &str) -> Option<JobStatus> {
        let next = lock(&self.states).next(id);
        self.changed.notify_waiters();
        next
    }

    fn remove(&self, id: &str) -> bool {
        let removed = lock(&self.states).remove(id);
        self.changed.notify_waiters();
        removed
    }

    pub(crate) fn status(&self, id: &str) -> Option<JobStatus> {
        lock(&self.states).job_status(id)
    }

    pub(crate) fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<String>, LimiterError> {
        lock(&self.states).status_jobs(status)
    }

    pub(crate) fn counts(&self) -> StatusCounts {
        lock(&self.states).counts()
    }

    /// Resolves once `done` holds for the current counts.
    pub(crate) async fn wait_until(&self, done: impl Fn(&StatusCounts) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(&self.counts()) {
                return;
            }
            notified.await;
        }
    }
}

/// Type-erased task body plus the sender of its result.
pub(crate) trait Runnable: Send + Sync {
    /// Runs one attempt, through `chained` when set, and keeps the output.
    fn attempt(
        self: Arc<Self>,
        chained: Option<Limiter>,
        options: JobOptions,
    ) -> BoxFuture<'static, Result<(), LimiterError>>;

    fn resolve(&self);

    fn reject(&self, error: LimiterError);
}

struct TaskSlot<T> {
    task: TaskFn<T>,
    output: Mutex<Option<T>>,
    sender: Mutex<Option<oneshot::Sender<Result<T, LimiterError>>>>,
}

impl<T: Send + 'static> Runnable for TaskSlot<T> {
    fn attempt(
        self: Arc<Self>,
        chained: Option<Limiter>,
        options: JobOptions,
    ) -> BoxFuture<'static, Result<(), LimiterError>> {
        Box::pin(async move {
            let value = match chained {
                Some(limiter) => {
                    limiter
                        .schedule_task(options, Arc::clone(&self.task))
                        .await
                        .await?
                }
                None => (self.task)().await.map_err(LimiterError::task)?,
            };
            *lock(&self.output) = Some(value);
            Ok(())
        })
    }

    fn resolve(&self) {
        let output = lock(&self.output).take();
        let sender = lock(&self.sender).take();
        if let (Some(value), Some(sender)) = (output, sender) {
            let _ = sender.send(Ok(value));
        }
    }

    fn reject(&self, error: LimiterError) {
        if let Some(sender) = lock(&self.sender).take() {
            let _ = sender.send(Err(error));
        }
    }
}

/// Completion handle of a scheduled job.
///
/// Resolves with the task's output or the error the job failed with. When the
/// job is dropped by a limiter configured with `reject_on_drop = false`, the
/// handle never resolves.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: String,
    reject_on_drop: bool,
    rx: oneshot::Receiver<Result<T, LimiterError>>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Outcome of the job, or `None` when it was dropped silently.
    pub(crate) async fn settle(self) -> Option<Result<T, LimiterError>> {
        match self.rx.await {
            Ok(result) => Some(result),
            Err(_) if self.reject_on_drop => Some(Err(LimiterError::dropped())),
            Err(_) => None,
        }
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) if self.reject_on_drop => {
                Poll::Ready(Err(LimiterError::dropped()))
            }
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

/// What a job needs from the limiter that runs it.
#[async_trait]
pub(crate) trait JobHost: Send + Sync {
    /// Cancels the job's timers. Returns false when another outcome already won.
    fn clear_global_state(&self, index: &str) -> bool;

    /// Runs the job again under the same index after `delay`.
    fn schedule_retry(&self, index: &str, job: Arc<Job>, delay: Duration);

    /// Releases the job's weight in the store.
    async fn free(&self, index: &str, weight: u64);

    fn chained(&self) -> Option<Limiter>;
}

pub(crate) struct Job {
    spec: JobSpec,
    retry_count: AtomicU32,
    runnable: Arc<dyn Runnable>,
    reject_on_drop: bool,
    tracker: Arc<JobTracker>,
    events: Events,
}

impl Queueable for Job {
    fn priority(&self) -> u8 {
        self.spec.priority
    }

    fn queue_id(&self) -> &str {
        &self.spec.id
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("spec", &self.spec)
            .field("retry_count", &self.retry_count())
            .finish()
    }
}

impl Job {
    pub(crate) fn new<T: Send + 'static>(
        spec: JobSpec,
        task: TaskFn<T>,
        reject_on_drop: bool,
        tracker: Arc<JobTracker>,
        events: Events,
    ) -> (Arc<Self>, JobHandle<T>) {
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle {
            id: spec.id.clone(),
            reject_on_drop,
            rx,
        };
        let runnable = Arc::new(TaskSlot {
            task,
            output: Mutex::new(None),
            sender: Mutex::new(Some(tx)),
        });
        let job = Arc::new(Self {
            spec,
            retry_count: AtomicU32::new(0),
            runnable,
            reject_on_drop,
            tracker,
            events,
        });
        (job, handle)
    }

    pub(crate) fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub(crate) fn id(&self) -> &str {
        &self.spec.id
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn info(&self) -> JobInfo {
        JobInfo::new(&self.spec, self.retry_count())
    }

    pub(crate) fn reject(&self, error: LimiterError) {
        self.runnable.reject(error);
    }

    fn assert_status(&self, expected: JobStatus) -> Result<(), LimiterError> {
        let found = self.tracker.status(&self.spec.id);
        if found == Some(expected) || (expected == JobStatus::Done && found.is_none()) {
            return Ok(());
        }
        Err(LimiterError::InvalidStatus {
            id: self.spec.id.clone(),
            found: found.map_or_else(|| "untracked".to_string(), |s| s.to_string()),
            expected,
        })
    }

    /// Reports a lifecycle violation and drops the job with it.
    pub(crate) fn fail_loudly(&self, error: LimiterError) {
        tracing::error!(job_id = %self.spec.id, error = %error, "Job lifecycle violation");
        self.events.emit(LimiterEvent::Error(error.clone()));
        self.do_drop(Some(error));
    }

    /// Starts tracking the job. Rejects it when its id is already in use.
    pub(crate) fn do_receive(&self) -> bool {
        if !self.tracker.start(&self.spec.id) {
            self.runnable
                .reject(LimiterError::DuplicateId(self.spec.id.clone()));
            return false;
        }
        self.events.emit(LimiterEvent::Received(self.info()));
        true
    }

    pub(crate) fn do_queue(&self, reached_hwm: bool, blocked: bool) -> Result<(), LimiterError> {
        self.assert_status(JobStatus::Received)?;
        self.tracker.next(&self.spec.id);
        self.events.emit(LimiterEvent::Queued {
            job: self.info(),
            reached_hwm,
            blocked,
        });
        Ok(())
    }

    pub(crate) fn do_run(&self) -> Result<(), LimiterError> {
        if self.retry_count() == 0 {
            self.assert_status(JobStatus::Queued)?;
            self.tracker.next(&self.spec.id);
        } else {
            self.assert_status(JobStatus::Executing)?;
        }
        self.events.emit(LimiterEvent::Scheduled(self.info()));
        Ok(())
    }

    pub(crate) async fn do_execute(self: &Arc<Self>, host: &dyn JobHost, index: &str) {
        let entered = if self.retry_count() == 0 {
            self.assert_status(JobStatus::Running).map(|()| {
                self.tracker.next(&self.spec.id);
            })
        } else {
            self.assert_status(JobStatus::Executing)
        };
        if let Err(error) = entered {
            self.fail_loudly(error);
            return;
        }

        let info = self.info();
        tracing::debug!(
            job_id = %self.spec.id,
            retry_count = info.retry_count,
            "Executing job"
        );
        self.events.emit(LimiterEvent::Executing(info.clone()));

        let attempt = AssertUnwindSafe(
            Arc::clone(&self.runnable).attempt(host.chained(), JobOptions::from(&self.spec)),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_error(payload)));
        match attempt {
            Ok(()) => {
                if host.clear_global_state(index) && self.finish(host, index, &info).await {
                    self.runnable.resolve();
                }
            }
            Err(error) => self.on_failure(host, index, error, info).await,
        }
    }

    pub(crate) async fn do_expire(self: &Arc<Self>, host: &dyn JobHost, index: &str) {
        if self.tracker.status(&self.spec.id) == Some(JobStatus::Running) {
            self.tracker.next(&self.spec.id);
        }
        if let Err(error) = self.assert_status(JobStatus::Executing) {
            self.fail_loudly(error);
            return;
        }
        let error = LimiterError::Expired {
            after: self.spec.expiration.unwrap_or_default(),
        };
        let info = self.info();
        self.on_failure(host, index, error, info).await;
    }

    async fn on_failure(
        self: &Arc<Self>,
        host: &dyn JobHost,
        index: &str,
        error: LimiterError,
        info: JobInfo,
    ) {
        if !host.clear_global_state(index) {
            return;
        }

        match self.events.failed(&error, &info) {
            Some(delay) => {
                tracing::debug!(
                    job_id = %self.spec.id,
                    retry_count = info.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying job"
                );
                self.events.emit(LimiterEvent::Retry {
                    message: format!("Retrying {} after {} ms", self.spec.id, delay.as_millis()),
                    job: info,
                    delay,
                });
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                host.schedule_retry(index, Arc::clone(self), delay);
            }
            None => {
                log_failure(&self.spec.id, &error);
                if self.finish(host, index, &info).await {
                    self.runnable.reject(error);
                }
            }
        }
    }

    /// Marks the job DONE and releases its weight. False on a lifecycle violation.
    async fn finish(&self, host: &dyn JobHost, index: &str, info: &JobInfo) -> bool {
        if let Err(error) = self.do_done(info) {
            self.fail_loudly(error);
            return false;
        }
        host.free(index, self.spec.weight).await;
        match self.assert_status(JobStatus::Done) {
            Ok(()) => true,
            Err(error) => {
                self.fail_loudly(error);
                false
            }
        }
    }

    fn do_done(&self, info: &JobInfo) -> Result<(), LimiterError> {
        self.assert_status(JobStatus::Executing)?;
        self.tracker.next(&self.spec.id);
        self.events.emit(LimiterEvent::Done(info.clone()));
        Ok(())
    }

    /// Removes the job from tracking. Returns false if it was no longer tracked.
    pub(crate) fn do_drop(&self, error: Option<LimiterError>) -> bool {
        if !self.tracker.remove(&self.spec.id) {
            return false;
        }
        let error = error.unwrap_or_else(LimiterError::dropped);
        tracing::debug!(job_id = %self.spec.id, reason = %error, "Dropped job");
        if self.reject_on_drop {
            self.runnable.reject(error.clone());
        }
        self.events.emit(LimiterEvent::Dropped {
            job: self.info(),
            error,
        });
        true
    }
}

/// Task error for an attempt that panicked.
fn panic_error(payload: Box<dyn Any + Send>) -> LimiterError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    LimiterError::task(anyhow::anyhow!("Task panicked: {}", message))
}

fn log_failure(job_id: &str, error: &LimiterError) {
    let code = error.error_code();
    match error.log_level() {
        LogLevel::Debug => tracing::debug!(job_id, error_code = code, error = %error, "Job failed"),
        LogLevel::Warn => tracing::warn!(job_id, error_code = code, error = %error, "Job failed"),
        LogLevel::Error => tracing::error!(job_id, error_code = code, error = %error, "Job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct RecordingHost {
        cleared: Mutex<bool>,
        freed: AtomicUsize,
        retries: Mutex<Vec<Duration>>,
    }

    impl RecordingHost {
        fn rearm(&self) {
            *lock(&self.cleared) = false;
        }
    }

    #[async_trait]
    impl JobHost for RecordingHost {
        fn clear_global_state(&self, _index: &str) -> bool {
            let mut cleared = lock(&self.cleared);
            !std::mem::replace(&mut *cleared, true)
        }

        fn schedule_retry(&self, _index: &str, _job: Arc<Job>, delay: Duration) {
            lock(&self.retries).push(delay);
        }

        async fn free(&self, _index: &str, weight: u64) {
            self.freed.fetch_add(weight as usize, Ordering::SeqCst);
        }

        fn chained(&self) -> Option<Limiter> {
            None
        }
    }

    fn job<T: Send + 'static>(
        id: &str,
        reject_on_drop: bool,
        task: TaskFn<T>,
    ) -> (Arc<Job>, JobHandle<T>, Events, Arc<JobTracker>) {
        let events = Events::new();
        let tracker = Arc::new(JobTracker::new(false));
        let spec = JobOptions::new().with_id(id).with_weight(2).sanitize();
        let (job, handle) = Job::new(spec, task, reject_on_drop, tracker.clone(), events.clone());
        (job, handle, events, tracker)
    }

    fn drain_names(rx: &mut broadcast::Receiver<LimiterEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event {
                LimiterEvent::Received(_) => "received",
                LimiterEvent::Queued { .. } => "queued",
                LimiterEvent::Scheduled(_) => "scheduled",
                LimiterEvent::Executing(_) => "executing",
                LimiterEvent::Failed { .. } => "failed",
                LimiterEvent::Retry { .. } => "retry",
                LimiterEvent::Done(_) => "done",
                LimiterEvent::Dropped { .. } => "dropped",
                LimiterEvent::Error(_) => "error",
                _ => "other",
            });
        }
        names
    }

    #[tokio::test]
    async fn successful_job_walks_every_status() {
        let (job, handle, events, tracker) = job("a", true, task_fn(|| async { Ok(7) }));
        let mut rx = events.subscribe();
        let host = RecordingHost::default();

        assert!(job.do_receive());
        job.do_queue(false, false).unwrap();
        job.do_run().unwrap();
        assert_eq!(tracker.status("a"), Some(JobStatus::Running));
        job.do_execute(&host, "idx").await;

        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(tracker.status("a"), None);
        assert_eq!(host.freed.load(Ordering::SeqCst), 2);
        assert_eq!(
            drain_names(&mut rx),
            ["received", "queued", "scheduled", "executing", "done"]
        );
    }

    #[tokio::test]
    async fn out_of_order_transition_drops_the_job() {
        let (job, handle, events, tracker) = job("b", true, task_fn(|| async { Ok(()) }));
        let mut rx = events.subscribe();

        assert!(job.do_receive());
        let error = job.do_run().unwrap_err();
        job.fail_loudly(error);

        assert!(matches!(
            handle.await,
            Err(LimiterError::InvalidStatus {
                expected: JobStatus::Queued,
                ..
            })
        ));
        assert_eq!(tracker.counts().pending(), 0);
        assert_eq!(drain_names(&mut rx), ["received", "error", "dropped"]);
    }

    #[tokio::test]
    async fn failure_handler_schedules_a_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (job, handle, events, tracker) = job(
            "c",
            true,
            task_fn(move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        anyhow::bail!("flaky");
                    }
                    Ok("ok")
                }
            }),
        );
        events.set_failure_handler(Arc::new(|_, job| {
            (job.retry_count == 0).then(|| Duration::from_millis(25))
        }));
        let host = RecordingHost::default();

        assert!(job.do_receive());
        job.do_queue(false, false).unwrap();
        job.do_run().unwrap();
        job.do_execute(&host, "idx").await;

        assert_eq!(*lock(&host.retries), [Duration::from_millis(25)]);
        assert_eq!(job.retry_count(), 1);
        assert_eq!(tracker.status("c"), Some(JobStatus::Executing));

        host.rearm();
        job.do_run().unwrap();
        job.do_execute(&host, "idx").await;
        assert_eq!(handle.await.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_failure_rejects_with_task_error() {
        let (job, handle, _events, tracker) =
            job("d", true, task_fn(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }));
        let host = RecordingHost::default();

        assert!(job.do_receive());
        job.do_queue(false, false).unwrap();
        job.do_run().unwrap();
        job.do_execute(&host, "idx").await;

        let error = handle.await.unwrap_err();
        assert_eq!(error.to_string(), "boom");
        assert_eq!(tracker.counts().pending(), 0);
        assert_eq!(host.freed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_fails_like_an_error() {
        let (job, handle, _events, tracker) = job(
            "p",
            true,
            task_fn(|| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), anyhow::Error>(())
            }),
        );
        let host = RecordingHost::default();

        assert!(job.do_receive());
        job.do_queue(false, false).unwrap();
        job.do_run().unwrap();
        job.do_execute(&host, "idx").await;

        let error = handle.await.unwrap_err();
        assert!(matches!(error, LimiterError::Task(_)));
        assert_eq!(error.to_string(), "Task panicked: kaboom");
        assert_eq!(tracker.counts().pending(), 0);
        assert_eq!(host.freed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiration_rejects_with_timeout_message() {
        let events = Events::new();
        let tracker = Arc::new(JobTracker::new(true));
        let spec = JobOptions::new()
            .with_id("e")
            .with_expiration(Duration::from_millis(150))
            .sanitize();
        let (job, handle) = Job::new(
            spec,
            task_fn(|| async { Ok(()) }),
            true,
            tracker.clone(),
            events,
        );
        let host = RecordingHost::default();

        assert!(job.do_receive());
        job.do_queue(false, false).unwrap();
        job.do_run().unwrap();
        job.do_expire(&host, "idx").await;

        let error = handle.await.unwrap_err();
        assert_eq!(error.to_string(), "This job timed out after 150 ms.");
        assert_eq!(tracker.status("e"), Some(JobStatus::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_drop_leaves_handle_pending() {
        let (job, handle, _events, _tracker) = job("f", false, task_fn(|| async { Ok(()) }));
        assert!(job.do_receive());
        assert!(job.do_drop(None));
        assert!(!job.do_drop(None));

        let waited = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn drop_rejects_with_default_message() {
        let (job, handle, _events, _tracker) = job("g", true, task_fn(|| async { Ok(()) }));
        assert!(job.do_receive());
        job.do_drop(None);
        assert_eq!(
            handle.await.unwrap_err().to_string(),
            "This job has been dropped by Sluice"
        );
    }
}
