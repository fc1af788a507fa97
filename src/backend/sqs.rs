//! SQS queue operations and the queue-backed job source.

use async_trait::async_trait;
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::operation::purge_queue::PurgeQueueError;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{load_sdk_config, map_sdk_error};
use crate::config::{AwsConfig, AwsService, SourceKind, SqsConfig};
use crate::connection::{Connector, Refreshing};
use crate::error::{require, Result, TetherError};
use crate::job::{assign_id, Job, JobBody, JobId};
use crate::source::{receipt_of, JobSource};

/// SQS caps batch requests and receives at ten messages.
pub const MAX_BATCH: usize = 10;

/// Builds SQS clients, honouring a custom endpoint.
pub struct SqsConnector {
    config: AwsConfig,
}

#[async_trait]
impl Connector for SqsConnector {
    type Handle = Client;

    fn name(&self) -> &str {
        "sqs"
    }

    async fn connect(&self) -> Result<Client> {
        let sdk_config = load_sdk_config(&self.config).await;
        let mut builder = aws_sdk_sqs::config::Builder::from(&sdk_config);
        if let Some(endpoint) = self.config.endpoint_for(AwsService::Sqs) {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Client::from_conf(builder.build()))
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Service-assigned message id.
    pub message_id: String,
    /// Handle needed to delete the message.
    pub receipt_handle: String,
    /// Message body.
    pub body: String,
}

/// A message to send in a batch.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Batch-local id, unique within one request.
    pub id: String,
    /// Message body.
    pub body: String,
    /// Optional delivery delay.
    pub delay: Option<Duration>,
}

impl OutgoingMessage {
    /// A message without delay.
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            delay: None,
        }
    }
}

/// A message to delete in a batch.
#[derive(Debug, Clone)]
pub struct DeleteEntry {
    /// Batch-local id.
    pub id: String,
    /// Receipt handle of the message.
    pub receipt_handle: String,
}

/// A batch entry the service rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Batch-local id of the entry.
    pub id: String,
    /// Error code.
    pub code: String,
    /// Error message, if any.
    pub message: Option<String>,
}

/// Per-entry outcome of a batch request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ids of entries that succeeded.
    pub successful: Vec<String>,
    /// Entries that failed.
    pub failed: Vec<BatchFailure>,
}

/// Options for one receive call.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    /// Messages to receive, at most ten.
    pub max_messages: usize,
    /// Long-poll wait.
    pub wait_time: Duration,
    /// Invisibility period of received messages.
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        let defaults = SqsConfig::default();
        Self {
            max_messages: MAX_BATCH,
            wait_time: defaults.wait_time,
            visibility_timeout: defaults.visibility_timeout,
        }
    }
}

/// SQS operations over a refreshing client. Queue URLs are resolved once per
/// queue name and cached.
#[derive(Clone)]
pub struct SqsQueue {
    clients: Refreshing<SqsConnector>,
    config: SqsConfig,
    urls: Arc<RwLock<HashMap<String, String>>>,
}

impl SqsQueue {
    /// Create a queue wrapper.
    pub fn new(aws: AwsConfig, config: SqsConfig) -> Self {
        let expiry = aws.expiry;
        Self {
            clients: Refreshing::new(SqsConnector { config: aws }, expiry),
            config,
            urls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The client provider.
    pub fn clients(&self) -> &Refreshing<SqsConnector> {
        &self.clients
    }

    /// Default receive options from the configuration.
    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: MAX_BATCH,
            wait_time: self.config.wait_time,
            visibility_timeout: self.config.visibility_timeout,
        }
    }

    /// Create a queue and return its URL. Attribute names follow the SQS API
    /// (`VisibilityTimeout`, `FifoQueue`, ...).
    pub async fn create_queue(&self, name: &str, attributes: HashMap<String, String>) -> Result<String> {
        require("queue", name)?;
        let url = self
            .clients
            .with_handle(|client| async move {
                let attributes = attributes
                    .into_iter()
                    .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v))
                    .collect::<HashMap<_, _>>();
                let response = client
                    .create_queue()
                    .queue_name(name)
                    .set_attributes(Some(attributes))
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Queue))?;
                response
                    .queue_url()
                    .map(ToString::to_string)
                    .ok_or_else(|| TetherError::Queue(format!("no url returned for queue {name}")))
            })
            .await?;

        self.urls.write().await.insert(name.to_string(), url.clone());
        tracing::info!(queue = name, "Queue created");
        Ok(url)
    }

    /// Resolve a queue URL, or `None` if the queue does not exist.
    pub async fn queue_url(&self, name: &str) -> Result<Option<String>> {
        require("queue", name)?;
        if let Some(url) = self.urls.read().await.get(name) {
            return Ok(Some(url.clone()));
        }

        let account = self.config.account_id.clone();
        let url = self
            .clients
            .with_handle(|client| async move {
                match client
                    .get_queue_url()
                    .queue_name(name)
                    .set_queue_owner_aws_account_id(account)
                    .send()
                    .await
                {
                    Ok(response) => Ok(response.queue_url().map(ToString::to_string)),
                    Err(err) => {
                        if matches!(err.as_service_error(), Some(GetQueueUrlError::QueueDoesNotExist(_))) {
                            Ok(None)
                        } else {
                            Err(map_sdk_error(&err, TetherError::Queue))
                        }
                    }
                }
            })
            .await?;

        if let Some(url) = &url {
            self.urls.write().await.insert(name.to_string(), url.clone());
        }
        Ok(url)
    }

    async fn require_url(&self, name: &str) -> Result<String> {
        self.queue_url(name)
            .await?
            .ok_or_else(|| TetherError::Queue(format!("queue {name} does not exist")))
    }

    /// Receive up to `opts.max_messages` messages. An empty vector means the
    /// long poll expired without messages.
    pub async fn receive_messages(&self, name: &str, opts: ReceiveOptions) -> Result<Vec<Message>> {
        if opts.max_messages == 0 || opts.max_messages > MAX_BATCH {
            return Err(TetherError::InvalidInput(format!(
                "max_messages must be between 1 and {MAX_BATCH}"
            )));
        }
        let url = self.require_url(name).await?;

        self.clients
            .with_handle(|client| async move {
                let response = client
                    .receive_message()
                    .queue_url(url)
                    .max_number_of_messages(opts.max_messages as i32)
                    .wait_time_seconds(opts.wait_time.as_secs() as i32)
                    .visibility_timeout(opts.visibility_timeout.as_secs() as i32)
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Queue))?;

                Ok(response
                    .messages()
                    .iter()
                    .filter_map(|m| {
                        Some(Message {
                            message_id: m.message_id()?.to_string(),
                            receipt_handle: m.receipt_handle()?.to_string(),
                            body: m.body().unwrap_or_default().to_string(),
                        })
                    })
                    .collect())
            })
            .await
    }

    /// Send up to ten messages in one request.
    pub async fn send_messages(&self, name: &str, messages: Vec<OutgoingMessage>) -> Result<BatchOutcome> {
        check_batch(messages.len())?;
        let entries = messages
            .into_iter()
            .map(|m| {
                SendMessageBatchRequestEntry::builder()
                    .id(m.id)
                    .message_body(m.body)
                    .set_delay_seconds(m.delay.map(|d| d.as_secs() as i32))
                    .build()
                    .map_err(|e| TetherError::InvalidInput(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let url = self.require_url(name).await?;

        self.clients
            .with_handle(|client| async move {
                let response = client
                    .send_message_batch()
                    .queue_url(url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Queue))?;

                Ok(BatchOutcome {
                    successful: response.successful().iter().map(|e| e.id().to_string()).collect(),
                    failed: response
                        .failed()
                        .iter()
                        .map(|e| BatchFailure {
                            id: e.id().to_string(),
                            code: e.code().to_string(),
                            message: e.message().map(ToString::to_string),
                        })
                        .collect(),
                })
            })
            .await
    }

    /// Delete up to ten messages in one request.
    pub async fn delete_messages(&self, name: &str, entries: Vec<DeleteEntry>) -> Result<BatchOutcome> {
        check_batch(entries.len())?;
        let entries = entries
            .into_iter()
            .map(|e| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(e.id)
                    .receipt_handle(e.receipt_handle)
                    .build()
                    .map_err(|e| TetherError::InvalidInput(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let url = self.require_url(name).await?;

        self.clients
            .with_handle(|client| async move {
                let response = client
                    .delete_message_batch()
                    .queue_url(url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Queue))?;

                Ok(BatchOutcome {
                    successful: response.successful().iter().map(|e| e.id().to_string()).collect(),
                    failed: response
                        .failed()
                        .iter()
                        .map(|e| BatchFailure {
                            id: e.id().to_string(),
                            code: e.code().to_string(),
                            message: e.message().map(ToString::to_string),
                        })
                        .collect(),
                })
            })
            .await
    }

    /// Delete one message by receipt handle.
    pub async fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<()> {
        require("receipt_handle", receipt_handle)?;
        let url = self.require_url(name).await?;
        self.clients
            .with_handle(|client| async move {
                client
                    .delete_message()
                    .queue_url(url)
                    .receipt_handle(receipt_handle)
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Queue))?;
                Ok(())
            })
            .await
    }

    /// Purge a queue. A purge already in progress is reported as
    /// `Some(message)` rather than an error.
    pub async fn purge(&self, name: &str) -> Result<Option<String>> {
        let url = self.require_url(name).await?;
        self.clients
            .with_handle(|client| async move {
                match client.purge_queue().queue_url(url).send().await {
                    Ok(_) => Ok(None),
                    Err(err) => match err.as_service_error() {
                        Some(PurgeQueueError::PurgeQueueInProgress(e)) => Ok(Some(
                            e.message().unwrap_or("purge already in progress").to_string(),
                        )),
                        _ => Err(map_sdk_error(&err, TetherError::Queue)),
                    },
                }
            })
            .await
    }
}

fn check_batch(len: usize) -> Result<()> {
    if len == 0 || len > MAX_BATCH {
        return Err(TetherError::InvalidInput(format!(
            "batch must hold between 1 and {MAX_BATCH} entries, got {len}"
        )));
    }
    Ok(())
}

/// Job source reading one SQS queue.
///
/// Unacknowledged messages reappear after the visibility timeout, so
/// `recover` has nothing to do.
#[derive(Clone)]
pub struct SqsSource {
    queue: SqsQueue,
    name: String,
}

impl SqsSource {
    /// Consume `name` through `queue`.
    pub fn new(queue: SqsQueue, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        require("queue", &name)?;
        Ok(Self { queue, name })
    }
}

#[async_trait]
impl JobSource for SqsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Queue
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_batch(&self, max: usize) -> Result<Vec<Job>> {
        let opts = ReceiveOptions {
            max_messages: max.clamp(1, MAX_BATCH),
            ..self.queue.receive_options()
        };
        let messages = self.queue.receive_messages(&self.name, opts).await?;

        let mut jobs = Vec::with_capacity(messages.len());
        for message in messages {
            match Job::from_json(&message.body) {
                Ok(job) => jobs.push(
                    job.with_fallback_id(message.message_id)
                        .with_receipt(message.receipt_handle),
                ),
                Err(e) => {
                    tracing::error!(
                        queue = %self.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Dropping malformed message"
                    );
                    if let Err(e) = self.queue.delete_message(&self.name, &message.receipt_handle).await {
                        tracing::warn!(queue = %self.name, error = %e, "Failed to delete malformed message");
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn acknowledge(&self, job: &Job) -> Result<()> {
        let receipt = receipt_of(job)?;
        self.queue.delete_message(&self.name, receipt).await
    }

    async fn enqueue(&self, body: &JobBody) -> Result<JobId> {
        let mut body = body.clone();
        let id = assign_id(&mut body);
        let message = OutgoingMessage::new("0", serde_json::to_string(&body)?);

        let outcome = self.queue.send_messages(&self.name, vec![message]).await?;
        if let Some(failure) = outcome.failed.into_iter().next() {
            return Err(TetherError::Queue(format!(
                "send rejected ({}): {}",
                failure.code,
                failure.message.unwrap_or_default()
            )));
        }
        Ok(id)
    }
}
