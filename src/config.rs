//! Typed configuration for every wrapped service and the worker.
//!
//! Every option has a default. Sections for services that are not in use stay
//! `None`, so a process only opens the connections it asks for. Durations are
//! (de)serialized as whole seconds.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::backend::redis::HashAlgorithm;
use crate::error::{Result, TetherError};
use crate::logging::LogConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared AWS settings (S3, SQS, Secrets Manager).
    pub aws: Option<AwsConfig>,
    /// SQS-specific settings.
    pub sqs: Option<SqsConfig>,
    /// Redis cache settings.
    pub redis: Option<RedisConfig>,
    /// PostgreSQL settings.
    pub postgres: Option<PostgresConfig>,
    /// Jira settings.
    pub jira: Option<JiraConfig>,
    /// Long-running-job worker settings.
    pub worker: WorkerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// The AWS services tether wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsService {
    /// S3.
    S3,
    /// SQS.
    Sqs,
    /// Secrets Manager.
    SecretsManager,
}

/// Shared settings for AWS service clients.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// AWS region.
    pub region: String,
    /// Custom endpoint for every service (LocalStack, moto).
    pub endpoint: Option<String>,
    /// S3 endpoint override, e.g. MinIO.
    pub s3_endpoint: Option<String>,
    /// SQS endpoint override.
    pub sqs_endpoint: Option<String>,
    /// Secrets Manager endpoint override.
    pub secrets_endpoint: Option<String>,
    /// Static access key id. The default credential chain is used when unset.
    pub access_key_id: Option<String>,
    /// Static secret access key, paired with `access_key_id`.
    pub secret_access_key: Option<String>,
    /// How long a client may be used before it is rebuilt with fresh credentials.
    #[serde(with = "duration_secs")]
    pub expiry: Duration,
}

impl std::fmt::Debug for AwsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("sqs_endpoint", &self.sqs_endpoint)
            .field("secrets_endpoint", &self.secrets_endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            s3_endpoint: None,
            sqs_endpoint: None,
            secrets_endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            expiry: Duration::from_secs(300),
        }
    }
}

impl AwsConfig {
    /// Create an AwsConfig for a region.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    /// Set a custom endpoint for every service.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Use static credentials instead of the default chain.
    pub fn credentials(mut self, access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Set the client expiry.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// The endpoint a service client should use: its own override, then the shared one.
    pub fn endpoint_for(&self, service: AwsService) -> Option<&str> {
        let own = match service {
            AwsService::S3 => &self.s3_endpoint,
            AwsService::Sqs => &self.sqs_endpoint,
            AwsService::SecretsManager => &self.secrets_endpoint,
        };
        own.as_deref().or(self.endpoint.as_deref())
    }
}

/// SQS receive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    /// Queue the worker consumes, when the worker source is `queue`.
    pub queue: Option<String>,
    /// Owner account of the queue, if it is not the caller's.
    pub account_id: Option<String>,
    /// Long-poll wait time.
    #[serde(with = "duration_secs")]
    pub wait_time: Duration,
    /// How long a received message stays invisible before redelivery.
    #[serde(with = "duration_secs")]
    pub visibility_timeout: Duration,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue: None,
            account_id: None,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Redis cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL.
    pub url: String,
    /// Default expiration for written keys.
    #[serde(with = "duration_secs")]
    pub expire: Duration,
    /// Expiration for job status hashes and cached job results.
    #[serde(with = "duration_secs")]
    pub result_expire: Duration,
    /// Hash cache keys built by `build_cache_key`.
    pub hash_keys: bool,
    /// Algorithm used when hashing cache keys.
    pub hash_algorithm: HashAlgorithm,
    /// Prefix for the worker's list keys.
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            expire: Duration::from_secs(60),
            result_expire: Duration::from_secs(3600),
            hash_keys: false,
            hash_algorithm: HashAlgorithm::Sha256,
            namespace: "tether".to_string(),
        }
    }
}

/// PostgreSQL settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Lifetime of a pooled connection before it is replaced.
    #[serde(with = "duration_secs")]
    pub expiry: Duration,
    /// How long to wait for a free connection.
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            expiry: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Jira credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraConfig {
    /// Account user name (usually an email address).
    pub user: String,
    /// API token.
    pub token: String,
}

/// Where the worker takes its jobs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A managed queue (SQS).
    Queue,
    /// A cache-backed list (Redis).
    #[default]
    Cache,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queue" | "sqs" => Ok(Self::Queue),
            "cache" | "redis" => Ok(Self::Cache),
            other => Err(TetherError::Config(format!("unknown job source: {other}"))),
        }
    }
}

/// Configuration for the long-running-job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Job source selector.
    pub source: SourceKind,
    /// Sleep after a poll that found nothing.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Maximum jobs fetched per poll.
    pub batch_size: usize,
    /// Fixed sleep after a failed fetch or acknowledgment.
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    /// Attempts made to acknowledge one job.
    pub ack_attempts: u32,
    /// Endpoint receiving work results.
    pub callback_url: Option<String>,
    /// Interval of the stale-job reaper.
    #[serde(with = "duration_secs")]
    pub recover_interval: Duration,
    /// Age after which an unacknowledged in-flight job is handed out again.
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    /// Run the reaper next to the worker loop.
    pub enable_reaper: bool,
    /// Worker identity used in logs. Generated when unset.
    pub worker_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Cache,
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            retry_backoff: Duration::from_secs(5),
            ack_attempts: 3,
            callback_url: None,
            recover_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            enable_reaper: true,
            worker_id: None,
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job source selector.
    pub fn source(mut self, source: SourceKind) -> Self {
        self.config.source = source;
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the fixed backoff used after transient failures.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the number of acknowledgment attempts.
    pub fn ack_attempts(mut self, attempts: u32) -> Self {
        self.config.ack_attempts = attempts;
        self
    }

    /// Set the callback URL.
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.config.callback_url = Some(url.into());
        self
    }

    /// Set the reaper interval.
    pub fn recover_interval(mut self, interval: Duration) -> Self {
        self.config.recover_interval = interval;
        self
    }

    /// Set the in-flight job timeout.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    /// Enable or disable the reaper.
    pub fn enable_reaper(mut self, enable: bool) -> Self {
        self.config.enable_reaper = enable;
        self
    }

    /// Set the worker id.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = Some(id.into());
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Check the values that would make the loop misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TetherError::Config("batch_size must be at least 1".to_string()));
        }
        if self.ack_attempts == 0 {
            return Err(TetherError::Config("ack_attempts must be at least 1".to_string()));
        }
        if self.enable_reaper && self.recover_interval.is_zero() {
            return Err(TetherError::Config(
                "recover_interval must be positive when the reaper is enabled".to_string(),
            ));
        }
        if let Some(url) = &self.callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(TetherError::Config(format!(
                    "callback_url must be an http(s) URL, got {url}"
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Build a configuration from `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from any variable lookup.
    ///
    /// A service section is only created when its identifying variable is set:
    /// `TETHER_REGION` for AWS, `TETHER_REDIS_URL` for Redis,
    /// `TETHER_DATABASE_URL` for PostgreSQL and `TETHER_JIRA_USER` for Jira.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let expiry = parse::<u64>(&lookup, "TETHER_EXPIRY_SECS")?.map(Duration::from_secs);

        if let Some(region) = lookup("TETHER_REGION") {
            let mut aws = AwsConfig::new(region);
            aws.endpoint = lookup("TETHER_AWS_ENDPOINT");
            aws.s3_endpoint = lookup("TETHER_S3_ENDPOINT");
            aws.sqs_endpoint = lookup("TETHER_SQS_ENDPOINT");
            aws.secrets_endpoint = lookup("TETHER_SECRETS_ENDPOINT");
            aws.access_key_id = lookup("TETHER_AWS_ACCESS_KEY_ID");
            aws.secret_access_key = lookup("TETHER_AWS_SECRET_ACCESS_KEY");
            if let Some(expiry) = expiry {
                aws.expiry = expiry;
            }
            config.aws = Some(aws);
        }

        if let Some(queue) = lookup("TETHER_SQS_QUEUE") {
            config.sqs = Some(SqsConfig {
                queue: Some(queue),
                account_id: lookup("TETHER_SQS_ACCOUNT_ID"),
                ..Default::default()
            });
        }

        if let Some(url) = lookup("TETHER_REDIS_URL") {
            let mut redis = RedisConfig {
                url,
                ..Default::default()
            };
            if let Some(secs) = parse::<u64>(&lookup, "TETHER_REDIS_EXPIRE_SECS")? {
                redis.expire = Duration::from_secs(secs);
            }
            if let Some(secs) = parse::<u64>(&lookup, "TETHER_REDIS_RESULT_EXPIRE_SECS")? {
                redis.result_expire = Duration::from_secs(secs);
            }
            if let Some(ns) = lookup("TETHER_REDIS_NAMESPACE") {
                redis.namespace = ns;
            }
            config.redis = Some(redis);
        }

        if let Some(url) = lookup("TETHER_DATABASE_URL") {
            let mut postgres = PostgresConfig {
                url,
                ..Default::default()
            };
            if let Some(max) = parse::<u32>(&lookup, "TETHER_DATABASE_MAX_CONNECTIONS")? {
                postgres.max_connections = max;
            }
            if let Some(expiry) = expiry {
                postgres.expiry = expiry;
            }
            config.postgres = Some(postgres);
        }

        if let Some(user) = lookup("TETHER_JIRA_USER") {
            config.jira = Some(JiraConfig {
                user,
                token: lookup("TETHER_JIRA_TOKEN").unwrap_or_default(),
            });
        }

        let worker = &mut config.worker;
        if let Some(source) = lookup("TETHER_SOURCE") {
            worker.source = source.parse()?;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TETHER_POLL_INTERVAL_SECS")? {
            worker.poll_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(&lookup, "TETHER_BATCH_SIZE")? {
            worker.batch_size = size;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TETHER_RETRY_BACKOFF_SECS")? {
            worker.retry_backoff = Duration::from_secs(secs);
        }
        worker.callback_url = lookup("TETHER_CALLBACK_URL");
        worker.validate()?;

        if let Some(format) = lookup("TETHER_LOG_FORMAT") {
            config.log.format = format.parse()?;
        }
        if let Some(service) = lookup("TETHER_SERVICE") {
            config.log.service = service;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| TetherError::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

/// Serde module for Duration as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
