//! Job source abstraction.
//!
//! A source is anything the worker can fetch jobs from and acknowledge them
//! to. Queue-backed sources rely on the service's visibility timeout for
//! redelivery; list-backed sources park fetched jobs in an in-flight area and
//! hand them out again through [`JobSource::recover`].

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SourceKind;
use crate::error::{Result, TetherError};
use crate::job::{assign_id, Job, JobBody, JobId};

/// Capability interface over queue and cache-list job sources.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Which kind of source this is.
    fn kind(&self) -> SourceKind;

    /// Name used in logs (queue name, list key, ...).
    fn name(&self) -> &str;

    /// Fetch up to `max` pending jobs. An empty vector means nothing is pending.
    async fn fetch_batch(&self, max: usize) -> Result<Vec<Job>>;

    /// Remove a successfully processed job from the source.
    async fn acknowledge(&self, job: &Job) -> Result<()>;

    /// Add a job to the source and return its id.
    async fn enqueue(&self, body: &JobBody) -> Result<JobId>;

    /// Hand out again jobs that were fetched more than `stale_after` ago and
    /// never acknowledged. Returns how many were moved.
    async fn recover(&self, stale_after: Duration) -> Result<usize> {
        let _ = stale_after;
        Ok(0)
    }
}

/// A type-erased source that can be shared across tasks.
pub type DynSource = Arc<dyn JobSource>;

/// Wrapper around Arc<dyn JobSource> for convenience.
#[derive(Clone)]
pub struct SharedSource {
    inner: DynSource,
}

impl SharedSource {
    /// Create a new SharedSource from any JobSource implementation.
    pub fn new<S: JobSource + 'static>(source: S) -> Self {
        Self {
            inner: Arc::new(source),
        }
    }

    /// Get a reference to the inner source.
    pub fn inner(&self) -> &DynSource {
        &self.inner
    }
}

#[async_trait]
impl JobSource for SharedSource {
    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_batch(&self, max: usize) -> Result<Vec<Job>> {
        self.inner.fetch_batch(max).await
    }

    async fn acknowledge(&self, job: &Job) -> Result<()> {
        self.inner.acknowledge(job).await
    }

    async fn enqueue(&self, body: &JobBody) -> Result<JobId> {
        self.inner.enqueue(body).await
    }

    async fn recover(&self, stale_after: Duration) -> Result<usize> {
        self.inner.recover(stale_after).await
    }
}

/// The receipt of a job, or `InvalidInput` if the job never came from a source.
pub(crate) fn receipt_of(job: &Job) -> Result<&str> {
    job.receipt
        .as_ref()
        .map(|r| r.0.as_str())
        .ok_or_else(|| TetherError::InvalidInput(format!("job {} has no receipt", job.id)))
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<String>,
    in_flight: HashMap<u64, (String, Instant)>,
    next_tag: u64,
    acknowledged: usize,
}

/// Process-local job source with cache-list semantics.
///
/// Fetched jobs stay in flight until acknowledged; `recover` puts stale ones
/// back at the end of the pending list.
#[derive(Clone, Default)]
pub struct InMemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw entry, bypassing validation.
    pub fn push_raw(&self, raw: impl Into<String>) {
        self.lock().pending.push_back(raw.into());
    }

    /// Number of jobs waiting to be fetched.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of fetched jobs not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Number of acknowledgments that removed a job.
    pub fn acknowledged(&self) -> usize {
        self.lock().acknowledged
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a panic while holding the lock cannot leave the queues half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobSource for InMemorySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cache
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_batch(&self, max: usize) -> Result<Vec<Job>> {
        let mut state = self.lock();
        let mut jobs = Vec::new();

        while jobs.len() < max {
            let Some(raw) = state.pending.pop_front() else {
                break;
            };

            match Job::from_json(&raw) {
                Ok(job) => {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    state.in_flight.insert(tag, (raw, Instant::now()));
                    jobs.push(job.with_receipt(tag.to_string()));
                }
                Err(e) => {
                    tracing::error!(error = %e, source = "memory", "Dropping malformed job entry");
                }
            }
        }

        Ok(jobs)
    }

    async fn acknowledge(&self, job: &Job) -> Result<()> {
        let tag: u64 = receipt_of(job)?
            .parse()
            .map_err(|_| TetherError::InvalidInput(format!("bad receipt for job {}", job.id)))?;

        let mut state = self.lock();
        if state.in_flight.remove(&tag).is_some() {
            state.acknowledged += 1;
        } else {
            tracing::debug!(job_id = %job.id, "Acknowledged job was no longer in flight");
        }
        Ok(())
    }

    async fn enqueue(&self, body: &JobBody) -> Result<JobId> {
        let mut body = body.clone();
        let id = assign_id(&mut body);
        let raw = serde_json::to_string(&body)?;
        self.lock().pending.push_back(raw);
        Ok(id)
    }

    async fn recover(&self, stale_after: Duration) -> Result<usize> {
        let mut state = self.lock();
        let mut stale: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, (_, started))| started.elapsed() >= stale_after)
            .map(|(tag, _)| *tag)
            .collect();
        stale.sort_unstable();
        for tag in &stale {
            if let Some((raw, _)) = state.in_flight.remove(tag) {
                state.pending.push_back(raw);
            }
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> JobBody {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fetch_empty_is_not_an_error() {
        let source = InMemorySource::new();
        assert!(source.fetch_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_fetch_acknowledge() {
        let source = InMemorySource::new();
        let id = source.enqueue(&body(json!({"id": "1", "val": 21}))).await.unwrap();
        assert_eq!(id.as_str(), "1");
        assert_eq!(source.pending_len(), 1);

        let jobs = source.fetch_batch(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(source.pending_len(), 0);
        assert_eq!(source.in_flight_len(), 1);

        source.acknowledge(&jobs[0]).await.unwrap();
        assert_eq!(source.in_flight_len(), 0);
        assert_eq!(source.acknowledged(), 1);

        // acknowledging twice does not count twice
        source.acknowledge(&jobs[0]).await.unwrap();
        assert_eq!(source.acknowledged(), 1);
    }

    #[tokio::test]
    async fn test_fetch_respects_max_and_order() {
        let source = InMemorySource::new();
        for i in 0..5 {
            source.enqueue(&body(json!({"id": i}))).await.unwrap();
        }
        let jobs = source.fetch_batch(3).await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
        assert_eq!(source.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_assigns_id() {
        let source = InMemorySource::new();
        let id = source.enqueue(&body(json!({"val": 1}))).await.unwrap();
        let jobs = source.fetch_batch(1).await.unwrap();
        assert_eq!(jobs[0].id, id);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_dropped() {
        let source = InMemorySource::new();
        source.push_raw("not json");
        source.push_raw("[1]");
        source.push_raw(r#"{"id":"ok"}"#);

        let jobs = source.fetch_batch(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id.as_str(), "ok");
        assert_eq!(source.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_without_receipt() {
        let source = InMemorySource::new();
        let job = Job::new(body(json!({"id": "x"})));
        let err = source.acknowledge(&job).await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_requeues_only_stale_jobs() {
        let source = InMemorySource::new();
        source.enqueue(&body(json!({"id": "old"}))).await.unwrap();
        source.fetch_batch(1).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        source.enqueue(&body(json!({"id": "new"}))).await.unwrap();
        source.fetch_batch(1).await.unwrap();

        let moved = source.recover(Duration::from_secs(30)).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(source.in_flight_len(), 1);

        let jobs = source.fetch_batch(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id.as_str(), "old");
    }

    #[tokio::test]
    async fn test_shared_source_delegates() {
        let memory = InMemorySource::new();
        let shared = SharedSource::new(memory.clone());
        assert_eq!(shared.kind(), SourceKind::Cache);
        assert_eq!(shared.name(), "memory");

        shared.enqueue(&body(json!({"id": "s"}))).await.unwrap();
        assert_eq!(memory.pending_len(), 1);
        let jobs = shared.fetch_batch(5).await.unwrap();
        shared.acknowledge(&jobs[0]).await.unwrap();
        assert_eq!(memory.acknowledged(), 1);
    }
}
