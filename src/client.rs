//! Client for enqueueing jobs and polling their status.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{require, Result, TetherError};
use crate::job::{assign_id, JobBody, JobId};
use crate::source::JobSource;
use crate::status::{set_params_key, JobStatus, ResultStore};

/// Producer side of a job source.
#[derive(Clone)]
pub struct Client<S: JobSource> {
    source: S,
    store: Option<Arc<dyn ResultStore>>,
}

impl<S: JobSource> Client<S> {
    /// Create a client that enqueues into `source`.
    pub fn new(source: S) -> Self {
        Self { source, store: None }
    }

    /// Record every enqueued job as queued in `store`, and answer
    /// [`Client::job_status`] from it. Workers should share the same store.
    pub fn with_store<R: ResultStore + 'static>(mut self, store: R) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Enqueue a job payload and return its id.
    ///
    /// The payload's `"id"` field is used as the job id when present;
    /// otherwise one is generated and written into the payload.
    pub async fn enqueue(&self, mut body: JobBody) -> Result<JobId> {
        // the status must exist before a worker can mark the job done
        let job_id = assign_id(&mut body);
        if let Some(store) = &self.store {
            store.record_queued(&job_id).await?;
        }
        let job_id = self.source.enqueue(&body).await?;
        tracing::debug!(job_id = %job_id, source = self.source.name(), "Job enqueued");
        Ok(job_id)
    }

    /// Enqueue a job whose successful result is cached under `params_key`.
    ///
    /// A worker with a result store answers later jobs carrying the same key
    /// from the cache. Build the key with [`crate::backend::redis::build_cache_key`].
    pub async fn enqueue_cached(&self, mut body: JobBody, params_key: impl Into<String>) -> Result<JobId> {
        let params_key = params_key.into();
        require("params_key", &params_key)?;
        set_params_key(&mut body, params_key);
        self.enqueue(body).await
    }

    /// The recorded status of a job, or `None` if the store does not know it.
    pub async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| TetherError::Config("client has no result store".to_string()))?;
        store.status(job_id).await
    }

    /// Enqueue any serializable payload. It must serialize to a JSON object.
    pub async fn enqueue_value<T: Serialize>(&self, payload: &T) -> Result<JobId> {
        match serde_json::to_value(payload)? {
            Value::Object(body) => self.enqueue(body).await,
            _ => Err(TetherError::InvalidInput(
                "job payload must serialize to a JSON object".to_string(),
            )),
        }
    }
}
