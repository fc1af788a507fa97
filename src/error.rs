//! Error types for the tether library.

use thiserror::Error;

/// The main error type for the tether library.
#[derive(Error, Debug)]
pub enum TetherError {
    /// A required input was missing or malformed. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not reach an external service.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Queue service error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Cache error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// HTTP error from the issue tracker or a callback endpoint.
    #[error("HTTP error{}: {message}", status_suffix(.status))]
    Http {
        /// Response status, if a response was received.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// A job handler failed.
    #[error("Job handler error: {0}")]
    Handler(String),
}

impl TetherError {
    /// Whether the error is a connectivity hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => status.map_or(true, |s| s >= 500 || s == 429),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for TetherError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Cache(err.to_string())
        }
    }
}

impl From<sqlx::Error> for TetherError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => Self::Connection(err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout(err.to_string()),
            sqlx::Error::Configuration(_) => Self::Config(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for TetherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Http {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Result type alias using TetherError.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Require a non-empty string argument.
pub(crate) fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TetherError::InvalidInput(format!("{name} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_input() {
        let err = TetherError::InvalidInput("bucket is required".to_string());
        assert_eq!(format!("{}", err), "Invalid input: bucket is required");
    }

    #[test]
    fn test_error_display_http_with_status() {
        let err = TetherError::Http {
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        assert_eq!(format!("{}", err), "HTTP error (502): bad gateway");
    }

    #[test]
    fn test_error_display_http_without_status() {
        let err = TetherError::Http {
            status: None,
            message: "reset".to_string(),
        };
        assert_eq!(format!("{}", err), "HTTP error: reset");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: TetherError = json_err.into();
        assert!(matches!(err, TetherError::Serialization(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(TetherError::Connection("refused".into()).is_transient());
        assert!(TetherError::Timeout("slow".into()).is_transient());
        assert!(TetherError::Http { status: Some(503), message: String::new() }.is_transient());
        assert!(!TetherError::Http { status: Some(404), message: String::new() }.is_transient());
        assert!(!TetherError::InvalidInput("x".into()).is_transient());
        assert!(!TetherError::Handler("boom".into()).is_transient());
    }

    #[test]
    fn test_require() {
        assert!(require("queue", "jobs").is_ok());
        let err = require("queue", "  ").unwrap_err();
        assert_eq!(format!("{}", err), "Invalid input: queue is required");
    }
}
