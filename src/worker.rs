//! Long-running-job worker.
//!
//! The worker polls a [`JobSource`] for batches of jobs, runs the handler on
//! each one, acknowledges jobs whose handler completed, and forwards their
//! [`WorkResult`] to a [`ResultReporter`]. A job whose handler fails or panics
//! is left unacknowledged so the source hands it out again later.
//!
//! With a [`ResultStore`] attached, the worker also records each finished
//! job's status and answers jobs carrying a known `params_key` from the cache.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::callback::{HttpCallback, LogReporter, ResultReporter};
use crate::config::WorkerConfig;
use crate::error::{Result, TetherError};
use crate::job::{Job, Outcome, WorkResult};
use crate::reaper::Reaper;
use crate::source::JobSource;
use crate::status::{params_key_of, ResultStore};

/// Result type for job handlers.
pub type JobResult = std::result::Result<Outcome, JobError>;

/// Error returned from job handlers.
///
/// A handler error means the job did not complete: it is neither
/// acknowledged nor reported.
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
}

impl JobError {
    /// Create a new handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Jobs returned by the source.
    pub fetched: usize,
    /// Jobs whose handler completed and that were acknowledged.
    pub succeeded: usize,
    /// Jobs whose handler returned an error or panicked.
    pub failed: usize,
    /// Jobs whose handler completed but whose acknowledgment failed.
    pub unacknowledged: usize,
}

enum Disposition {
    Completed,
    Failed,
    Unacknowledged,
}

/// Clears the running flag however `run_until` ends, including when its
/// future is dropped mid-poll.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Generate a worker id of the form `hostname-pid-timestamp`.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let ts = chrono::Utc::now().timestamp();
    format!("{}-{}-{}", host, pid, ts)
}

/// Polls a job source and processes jobs one batch at a time.
pub struct Worker<S, F, Fut>
where
    S: JobSource + Clone + 'static,
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    config: WorkerConfig,
    worker_id: String,
    source: S,
    handler: F,
    reporter: Arc<dyn ResultReporter>,
    store: Option<Arc<dyn ResultStore>>,
    span: tracing::Span,
    running: Arc<AtomicBool>,
}

impl<S, F, Fut> Worker<S, F, Fut>
where
    S: JobSource + Clone + 'static,
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a worker. Results go to `config.callback_url` when set and to
    /// the log otherwise.
    pub fn new(config: WorkerConfig, source: S, handler: F) -> Result<Self> {
        let reporter: Arc<dyn ResultReporter> = match &config.callback_url {
            Some(url) => Arc::new(HttpCallback::new(url.clone())?),
            None => Arc::new(LogReporter),
        };
        Self::with_reporter(config, source, handler, reporter)
    }

    /// Create a worker that sends results to `reporter`.
    pub fn with_reporter(
        config: WorkerConfig,
        source: S,
        handler: F,
        reporter: Arc<dyn ResultReporter>,
    ) -> Result<Self> {
        config.validate()?;
        let worker_id = config.worker_id.clone().unwrap_or_else(generate_worker_id);
        let span = tracing::info_span!("worker", worker_id = %worker_id);
        Ok(Self {
            config,
            worker_id,
            source,
            handler,
            reporter,
            store: None,
            span,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a new builder.
    pub fn builder() -> WorkerBuilder<S, F, Fut> {
        WorkerBuilder::new()
    }

    /// The worker id used in logs.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether `run`/`run_until` is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` completes.
    ///
    /// Shutdown is observed while fetching, while sleeping after an empty poll
    /// or a failure, and between cycles. A batch that has been fetched is
    /// always processed to the end. Every event is emitted inside the
    /// worker's span.
    pub async fn run_until<Sh>(&self, shutdown: Sh) -> Result<()>
    where
        Sh: Future<Output = ()> + Send,
    {
        self.run_loop(shutdown).instrument(self.span.clone()).await
    }

    async fn run_loop<Sh>(&self, shutdown: Sh) -> Result<()>
    where
        Sh: Future<Output = ()> + Send,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TetherError::Config(format!(
                "worker {} is already running",
                self.worker_id
            )));
        }
        let _running = RunningGuard(self.running.clone());

        // dropping the set aborts the reaper if this future is dropped
        let mut tasks = JoinSet::new();
        if self.config.enable_reaper {
            let reaper = Reaper::new(
                self.source.clone(),
                self.config.recover_interval,
                self.config.job_timeout,
                self.running.clone(),
            );
            tasks.spawn(async move { reaper.run().await }.instrument(tracing::Span::current()));
        }

        tracing::info!(
            worker_id = %self.worker_id,
            source = self.source.name(),
            kind = %self.source.kind(),
            batch_size = self.config.batch_size,
            "Worker started"
        );

        tokio::pin!(shutdown);

        loop {
            if shutdown.as_mut().now_or_never().is_some() {
                break;
            }

            let fetched = tokio::select! {
                _ = shutdown.as_mut() => break,
                fetched = self.source.fetch_batch(self.config.batch_size) => fetched,
            };

            let pause = match fetched {
                Ok(jobs) if jobs.is_empty() => Some(self.config.poll_interval),
                Ok(jobs) => {
                    let summary = self.dispatch(jobs).await;
                    if summary.unacknowledged > 0 {
                        Some(self.config.retry_backoff)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.worker_id,
                        source = self.source.name(),
                        error = %e,
                        transient = e.is_transient(),
                        "Failed to fetch jobs"
                    );
                    Some(self.config.retry_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.as_mut() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Shutdown requested, stopping");
        self.running.store(false, Ordering::SeqCst);

        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Task panicked");
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    /// Run exactly one poll cycle: fetch a batch and process every job in it.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        async {
            let jobs = self.source.fetch_batch(self.config.batch_size).await?;
            Ok(self.dispatch(jobs).await)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn dispatch(&self, jobs: Vec<Job>) -> PollSummary {
        let mut summary = PollSummary {
            fetched: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match self.process(job).await {
                Disposition::Completed => summary.succeeded += 1,
                Disposition::Failed => summary.failed += 1,
                Disposition::Unacknowledged => summary.unacknowledged += 1,
            }
        }

        if summary.fetched > 0 {
            tracing::debug!(
                worker_id = %self.worker_id,
                fetched = summary.fetched,
                succeeded = summary.succeeded,
                failed = summary.failed,
                unacknowledged = summary.unacknowledged,
                "Batch processed"
            );
        }
        summary
    }

    async fn process(&self, job: Job) -> Disposition {
        tracing::debug!(worker_id = %self.worker_id, job_id = %job.id, "Processing job");

        let params_key = params_key_of(&job);
        let outcome = match self.cached_outcome(&job, params_key).await {
            Some(outcome) => outcome,
            None => match self.run_handler(&job).await {
                Ok(outcome) => {
                    if let (Some(key), Outcome::Success(value)) = (params_key, &outcome) {
                        self.cache_outcome(&job, key, value).await;
                    }
                    outcome
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "Job failed");
                    return Disposition::Failed;
                }
            },
        };

        if let Err(e) = self.acknowledge(&job).await {
            tracing::error!(
                worker_id = %self.worker_id,
                job_id = %job.id,
                error = %e,
                "Failed to acknowledge job, result withheld until redelivery"
            );
            return Disposition::Unacknowledged;
        }

        let result = WorkResult::from_outcome(job.id.clone(), outcome);
        if let Some(store) = &self.store {
            if let Err(e) = store.record_done(&result).await {
                tracing::warn!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "Failed to record job status");
            }
        }
        if let Err(e) = self.reporter.report(&result).await {
            tracing::warn!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "Failed to report result");
        }

        Disposition::Completed
    }

    async fn run_handler(&self, job: &Job) -> Result<Outcome> {
        let handler = &self.handler;
        let input = job.clone();
        match AssertUnwindSafe(async move { handler(input).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(TetherError::Handler(err.message)),
            Err(panic) => Err(TetherError::Handler(format!("panicked: {}", panic_message(&panic)))),
        }
    }

    /// A cache read failure runs the handler as if nothing was cached.
    async fn cached_outcome(&self, job: &Job, params_key: Option<&str>) -> Option<Outcome> {
        let (store, key) = (self.store.as_ref()?, params_key?);
        match store.cached_result(key).await {
            Ok(Some(value)) => {
                tracing::debug!(worker_id = %self.worker_id, job_id = %job.id, params_key = key, "Using cached result");
                Some(Outcome::Success(value))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "Failed to read cached result");
                None
            }
        }
    }

    async fn cache_outcome(&self, job: &Job, key: &str, value: &serde_json::Value) {
        if let Some(store) = &self.store {
            if let Err(e) = store.cache_result(key, value).await {
                tracing::warn!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "Failed to cache result");
            }
        }
    }

    async fn acknowledge(&self, job: &Job) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.source.acknowledge(job).await {
                Ok(()) => return Ok(()),
                Err(e @ TetherError::InvalidInput(_)) => return Err(e),
                Err(e) if attempt < self.config.ack_attempts => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Acknowledgment failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for Worker.
pub struct WorkerBuilder<S, F, Fut>
where
    S: JobSource + Clone + 'static,
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    config: WorkerConfig,
    source: Option<S>,
    handler: Option<F>,
    reporter: Option<Arc<dyn ResultReporter>>,
    store: Option<Arc<dyn ResultStore>>,
    span: Option<tracing::Span>,
}

impl<S, F, Fut> WorkerBuilder<S, F, Fut>
where
    S: JobSource + Clone + 'static,
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            source: None,
            handler: None,
            reporter: None,
            store: None,
            span: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the job source.
    pub fn source(mut self, source: S) -> Self {
        self.config.source = source.kind();
        self.source = Some(source);
        self
    }

    /// Set the job handler.
    pub fn handler(mut self, handler: F) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Send results to a custom reporter instead of the callback URL.
    pub fn reporter<R: ResultReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Record job status and cache results in `store`.
    pub fn result_store<R: ResultStore + 'static>(mut self, store: R) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Emit the worker's events inside `span` instead of the default
    /// `worker` span. See [`crate::logging::LogConfig::service_span`].
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Set the callback URL.
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.config.callback_url = Some(url.into());
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the fixed backoff after failures.
    pub fn retry_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Enable or disable the reaper.
    pub fn enable_reaper(mut self, enable: bool) -> Self {
        self.config.enable_reaper = enable;
        self
    }

    /// Build the Worker.
    pub fn build(self) -> Result<Worker<S, F, Fut>> {
        let source = self
            .source
            .ok_or_else(|| TetherError::Config("Job source is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| TetherError::Config("Handler is required".to_string()))?;

        let mut worker = match self.reporter {
            Some(reporter) => Worker::with_reporter(self.config, source, handler, reporter)?,
            None => Worker::new(self.config, source, handler)?,
        };
        worker.store = self.store;
        if let Some(span) = self.span {
            worker.span = span;
        }
        Ok(worker)
    }
}

impl<S, F, Fut> Default for WorkerBuilder<S, F, Fut>
where
    S: JobSource + Clone + 'static,
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
