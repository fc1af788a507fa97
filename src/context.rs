//! Process-wide service handles.
//!
//! A [`Context`] is built once from a [`Config`] and owns a handle for every
//! configured service. Sections left out of the configuration are never
//! connected; asking for one of them is a configuration error.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{Database, JiraClient, RedisCache, RedisListSource, S3Store, SecretStore, SqsQueue, SqsSource};
use crate::config::{Config, SourceKind};
use crate::error::{Result, TetherError};
use crate::source::SharedSource;

/// Owns the handles of every configured service.
pub struct Context {
    config: Config,
    s3: Option<S3Store>,
    sqs: Option<SqsQueue>,
    secrets: Option<SecretStore>,
    redis: Option<RedisCache>,
    postgres: Option<Database>,
    jira: Option<JiraClient>,
    stopped: watch::Sender<bool>,
}

impl Context {
    /// Build handles for the configured sections.
    ///
    /// AWS clients are created lazily on first use. Redis and PostgreSQL are
    /// connected here so a bad URL fails at startup.
    pub async fn connect(config: Config) -> Result<Self> {
        let (s3, secrets) = match &config.aws {
            Some(aws) => (Some(S3Store::new(aws.clone())), Some(SecretStore::new(aws.clone()))),
            None => (None, None),
        };

        let sqs = match (&config.aws, &config.sqs) {
            (None, None) => None,
            (aws, sqs) => Some(SqsQueue::new(
                aws.clone().unwrap_or_default(),
                sqs.clone().unwrap_or_default(),
            )),
        };

        let redis = match &config.redis {
            Some(redis) => Some(RedisCache::connect(redis.clone()).await?),
            None => None,
        };

        let postgres = match &config.postgres {
            Some(postgres) => Some(Database::connect(postgres).await?),
            None => None,
        };

        let jira = config.jira.as_ref().map(JiraClient::new).transpose()?;

        config.log.service_span().in_scope(|| {
            tracing::info!(
                s3 = s3.is_some(),
                sqs = sqs.is_some(),
                redis = redis.is_some(),
                postgres = postgres.is_some(),
                jira = jira.is_some(),
                "Context ready"
            )
        });

        Ok(Self {
            config,
            s3,
            sqs,
            secrets,
            redis,
            postgres,
            jira,
            stopped: watch::Sender::new(false),
        })
    }

    /// The configuration this context was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A span tagging events with the configured service name.
    pub fn service_span(&self) -> tracing::Span {
        self.config.log.service_span()
    }

    /// S3 operations.
    pub fn s3(&self) -> Result<&S3Store> {
        self.s3.as_ref().ok_or_else(|| missing("aws"))
    }

    /// SQS operations.
    pub fn sqs(&self) -> Result<&SqsQueue> {
        self.sqs.as_ref().ok_or_else(|| missing("sqs"))
    }

    /// Secrets Manager operations.
    pub fn secrets(&self) -> Result<&SecretStore> {
        self.secrets.as_ref().ok_or_else(|| missing("aws"))
    }

    /// Redis cache operations.
    pub fn redis(&self) -> Result<&RedisCache> {
        self.redis.as_ref().ok_or_else(|| missing("redis"))
    }

    /// PostgreSQL operations.
    pub fn postgres(&self) -> Result<&Database> {
        self.postgres.as_ref().ok_or_else(|| missing("postgres"))
    }

    /// Jira operations.
    pub fn jira(&self) -> Result<&JiraClient> {
        self.jira.as_ref().ok_or_else(|| missing("jira"))
    }

    /// The job source selected by `worker.source`.
    ///
    /// `name` is the queue name or the list name. For a queue it falls back
    /// to `sqs.queue` when `None`.
    pub fn job_source(&self, name: Option<&str>) -> Result<SharedSource> {
        match self.config.worker.source {
            SourceKind::Queue => {
                let queue = self.sqs()?;
                let name = name
                    .map(str::to_string)
                    .or_else(|| self.config.sqs.as_ref().and_then(|s| s.queue.clone()))
                    .ok_or_else(|| TetherError::Config("no queue name configured".to_string()))?;
                Ok(SharedSource::new(SqsSource::new(queue.clone(), name)?))
            }
            SourceKind::Cache => {
                let name = name.ok_or_else(|| TetherError::Config("no list name given".to_string()))?;
                Ok(SharedSource::new(RedisListSource::from_cache(self.redis()?, name)?))
            }
        }
    }

    /// Rebuild AWS clients every `expiry` in the background until
    /// [`Context::shutdown`] is called.
    pub fn spawn_refreshers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(s3) = &self.s3 {
            handles.push(s3.clients().spawn_refresher(self.stop_signal()));
        }
        if let Some(sqs) = &self.sqs {
            handles.push(sqs.clients().spawn_refresher(self.stop_signal()));
        }
        if let Some(secrets) = &self.secrets {
            handles.push(secrets.clients().spawn_refresher(self.stop_signal()));
        }
        handles
    }

    /// Resolves once [`Context::shutdown`] has been called.
    ///
    /// Usable as the shutdown future of [`crate::Worker::run_until`].
    pub fn stop_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.stopped.subscribe();
        async move {
            // an error means the context is gone, which also stops
            let _ = stopped.wait_for(|stopped| *stopped).await;
        }
    }

    /// Stop the background refreshers. They exit without waiting for their next tick.
    pub fn shutdown(&self) {
        self.stopped.send_replace(true);
        self.service_span().in_scope(|| tracing::info!("Context shutting down"));
    }

    /// Whether [`Context::shutdown`] has not been called yet.
    pub fn is_running(&self) -> bool {
        !*self.stopped.borrow()
    }
}

fn missing(section: &str) -> TetherError {
    TetherError::Config(format!("{section} is not configured"))
}
