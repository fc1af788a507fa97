//! Job and work result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TetherError};

/// A job payload: a JSON object.
pub type JobBody = serde_json::Map<String, Value>;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Take the id a producer put in the payload's `"id"` field, if any.
    pub fn from_body(body: &JobBody) -> Option<Self> {
        match body.get("id")? {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Source-specific token needed to acknowledge a job: an SQS receipt handle,
/// or the tagged processing entry for cache-backed sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt(pub String);

/// One unit of work drawn from a job source.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// The job payload.
    pub body: JobBody,
    /// Acknowledgment handle, set by the source that delivered the job.
    pub receipt: Option<Receipt>,
    /// When the job was fetched from its source.
    pub arrived_at: DateTime<Utc>,
}

impl Job {
    /// Create a job from a payload. The id comes from the payload's `"id"`
    /// field when present, otherwise a random one is generated.
    pub fn new(body: JobBody) -> Self {
        let id = JobId::from_body(&body).unwrap_or_default();
        Self {
            id,
            body,
            receipt: None,
            arrived_at: Utc::now(),
        }
    }

    /// Parse a job from its JSON text. The text must be a JSON object.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(Self::new(parse_body(raw)?))
    }

    /// Set the receipt.
    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(Receipt(receipt.into()));
        self
    }

    /// Use `id` unless the payload names its own.
    pub fn with_fallback_id(mut self, id: impl Into<String>) -> Self {
        if JobId::from_body(&self.body).is_none() {
            self.id = JobId(id.into());
        }
        self
    }

    /// Look up a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Serialize the payload to JSON.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(&self.body)
    }
}

/// Parse a JSON object payload.
pub fn parse_body(raw: &str) -> Result<JobBody> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(TetherError::InvalidInput(format!(
            "job payload must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

/// Make sure a payload carries an `"id"`, inserting a random one if needed,
/// and return it. Producers call this so the id survives the round trip.
pub fn assign_id(body: &mut JobBody) -> JobId {
    if let Some(id) = JobId::from_body(body) {
        return id;
    }
    let id = JobId::new();
    body.insert("id".to_string(), Value::String(id.0.clone()));
    id
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// What a handler produced for a job that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job produced a result.
    Success(Value),
    /// The job ran but reports a failure description.
    Failure(String),
}

impl Outcome {
    /// A successful outcome.
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success(value.into())
    }

    /// A completed job that reports an error.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Success(value)
    }
}

/// The status of a work result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    /// The job succeeded.
    Success,
    /// The job reported an error.
    Error,
}

/// The outcome of processing one job, as delivered to the callback endpoint.
///
/// Serialized as `{"job_id", "status", "result"}` or
/// `{"job_id", "status", "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// The job this result belongs to.
    pub job_id: JobId,
    /// Success or error.
    pub status: WorkStatus,
    /// Result payload, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description, on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkResult {
    /// A successful result.
    pub fn success(job_id: JobId, result: Value) -> Self {
        Self {
            job_id,
            status: WorkStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    /// An error result.
    pub fn error(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status: WorkStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Build the result for a completed job.
    pub fn from_outcome(job_id: JobId, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(value) => Self::success(job_id, value),
            Outcome::Failure(message) => Self::error(job_id, message),
        }
    }

    /// Whether the job succeeded.
    pub fn is_success(&self) -> bool {
        self.status == WorkStatus::Success
    }
}
