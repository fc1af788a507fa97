//! Tracing/logging initialization.
//!
//! JSON output is meant for containers whose stdout is shipped to a log
//! aggregator; pretty output is for local runs. The filter honours `RUST_LOG`
//! and falls back to the configured level.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, TetherError};

/// Output format of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human readable, multi-line.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(TetherError::Config(format!("unknown log format: {other}"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Service name recorded on the root span.
    pub service: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            service: "tether".to_string(),
        }
    }
}

impl LogConfig {
    /// Span carrying the service name as its `service` field.
    ///
    /// Subscribers only see spans that are entered, so the name reaches an
    /// event when the event is emitted inside this span: pass it to
    /// [`crate::WorkerBuilder::span`], or enter it or `instrument` a future
    /// with it.
    pub fn service_span(&self) -> tracing::Span {
        tracing::info_span!("service", service = %self.service)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init(config: &LogConfig) {
    let result = match config.format {
        LogFormat::Json => json_subscriber(config, std::io::stdout).try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(config.filter())
            .pretty()
            .finish()
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// JSON subscriber writing to `writer`. The current span's fields, including
/// the service name of [`LogConfig::service_span`], go on every line.
pub(crate) fn json_subscriber<W>(config: &LogConfig, writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_writer(writer)
        .finish()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LogConfig::default();
        init(&config);
        init(&LogConfig {
            format: LogFormat::Pretty,
            ..config
        });
    }

    #[test]
    fn test_events_inside_service_span_carry_service_name() {
        let config = LogConfig {
            service: "billing".to_string(),
            level: "info".to_string(),
            ..Default::default()
        };
        let captured = capture::Captured::default();
        let subscriber = json_subscriber(&config, captured.clone());

        tracing::subscriber::with_default(subscriber, || {
            let span = config.service_span();
            let _entered = span.enter();
            tracing::info!(job_id = "7", "Job finished");
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(event["span"]["service"], "billing");
        assert_eq!(event["fields"]["job_id"], "7");
        assert_eq!(event["fields"]["message"], "Job finished");
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
        assert_eq!(config.service, "tether");
    }
}
