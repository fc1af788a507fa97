//! Job status tracking and result caching.
//!
//! A [`ResultStore`] records whether a job has finished and what it produced,
//! so producers can poll for a result instead of running a callback endpoint.
//! It also caches results under a job's `params_key`: a later job carrying
//! the same key is answered from the cache without running the handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::job::{Job, JobBody, JobId, WorkResult};

/// Payload field naming the result-cache key of a job.
pub const PARAMS_KEY_FIELD: &str = "params_key";

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Enqueued and not finished yet.
    Queued,
    /// Processed and acknowledged.
    Done,
}

/// Status of one job as recorded by a [`ResultStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    /// The job's result once it is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkResult>,
}

impl JobStatus {
    pub fn queued(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            result: None,
        }
    }

    pub fn done(result: WorkResult) -> Self {
        Self {
            job_id: result.job_id.clone(),
            state: JobState::Done,
            result: Some(result),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

/// The result-cache key a job carries, if any.
pub fn params_key_of(job: &Job) -> Option<&str> {
    job.get(PARAMS_KEY_FIELD)
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
}

/// Write `key` into a payload as its result-cache key.
pub fn set_params_key(body: &mut JobBody, key: impl Into<String>) {
    body.insert(PARAMS_KEY_FIELD.to_string(), Value::String(key.into()));
}

/// Storage for job status and cached results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Mark a job as enqueued. Replaces any earlier status of the same id.
    async fn record_queued(&self, job_id: &JobId) -> Result<()>;

    /// Mark a job as done with its result.
    async fn record_done(&self, result: &WorkResult) -> Result<()>;

    /// The recorded status of a job, or `None` if it is unknown or expired.
    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>>;

    /// A cached result for `key`.
    async fn cached_result(&self, key: &str) -> Result<Option<Value>>;

    /// Cache a successful result under `key`.
    async fn cache_result(&self, key: &str, value: &Value) -> Result<()>;
}

#[async_trait]
impl<R: ResultStore + ?Sized> ResultStore for Arc<R> {
    async fn record_queued(&self, job_id: &JobId) -> Result<()> {
        (**self).record_queued(job_id).await
    }

    async fn record_done(&self, result: &WorkResult) -> Result<()> {
        (**self).record_done(result).await
    }

    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        (**self).status(job_id).await
    }

    async fn cached_result(&self, key: &str) -> Result<Option<Value>> {
        (**self).cached_result(key).await
    }

    async fn cache_result(&self, key: &str, value: &Value) -> Result<()> {
        (**self).cache_result(key, value).await
    }
}

#[derive(Default)]
struct MemoryState {
    statuses: HashMap<JobId, JobStatus>,
    results: HashMap<String, Value>,
}

/// Process-local result store. Entries never expire.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached results.
    pub fn cached_len(&self) -> usize {
        self.lock().results.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn record_queued(&self, job_id: &JobId) -> Result<()> {
        self.lock()
            .statuses
            .insert(job_id.clone(), JobStatus::queued(job_id.clone()));
        Ok(())
    }

    async fn record_done(&self, result: &WorkResult) -> Result<()> {
        self.lock()
            .statuses
            .insert(result.job_id.clone(), JobStatus::done(result.clone()));
        Ok(())
    }

    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        Ok(self.lock().statuses.get(job_id).cloned())
    }

    async fn cached_result(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().results.get(key).cloned())
    }

    async fn cache_result(&self, key: &str, value: &Value) -> Result<()> {
        self.lock().results.insert(key.to_string(), value.clone());
        Ok(())
    }
}
