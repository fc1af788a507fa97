//! Delivery of work results to a callback endpoint.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{require, Result, TetherError};
use crate::job::WorkResult;

/// Receives the result of every job that completed and was acknowledged.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    /// Deliver one result.
    async fn report(&self, result: &WorkResult) -> Result<()>;
}

#[async_trait]
impl<R: ResultReporter + ?Sized> ResultReporter for Arc<R> {
    async fn report(&self, result: &WorkResult) -> Result<()> {
        (**self).report(result).await
    }
}

/// POSTs results as JSON to a fixed URL.
#[derive(Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
    url: String,
}

impl HttpCallback {
    /// Create a callback for `url` with a 30 second request timeout.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TetherError::Config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(client, url)
    }

    /// Create a callback that reuses an existing HTTP client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        require("callback_url", &url)?;
        Ok(Self { client, url })
    }

    /// The endpoint results are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ResultReporter for HttpCallback {
    async fn report(&self, result: &WorkResult) -> Result<()> {
        let response = self.client.post(&self.url).json(result).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TetherError::Http {
                status: Some(status.as_u16()),
                message: format!("callback rejected result for job {}: {body}", result.job_id),
            });
        }

        tracing::debug!(job_id = %result.job_id, status = status.as_u16(), "Result delivered");
        Ok(())
    }
}

/// Logs results instead of sending them anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl ResultReporter for LogReporter {
    async fn report(&self, result: &WorkResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        tracing::info!(job_id = %result.job_id, result = %payload, "Job result");
        Ok(())
    }
}
