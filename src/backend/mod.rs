//! Thin wrappers over external services.
//!
//! Every wrapper validates its required arguments, translates "not found"
//! into an absent value, and maps vendor errors onto [`TetherError`].

pub mod jira;
pub mod postgres;
pub mod redis;
pub mod redis_list;
pub mod s3;
pub mod secrets;
pub mod sqs;

pub use self::jira::JiraClient;
pub use self::postgres::Database;
pub use self::redis::{HashAlgorithm, RedisCache};
pub use self::redis_list::RedisListSource;
pub use self::s3::{ObjectAttributes, ObjectSummary, S3Store};
pub use self::secrets::{Secret, SecretStore};
pub use self::sqs::{SqsQueue, SqsSource};

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use chrono::{DateTime, Utc};

use crate::config::AwsConfig;
use crate::error::TetherError;

/// Load the shared AWS SDK configuration for a region.
///
/// Static credentials replace the default provider chain when both halves are set.
pub(crate) async fn load_sdk_config(config: &AwsConfig) -> aws_config::SdkConfig {
    let loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
    let loader = match (&config.access_key_id, &config.secret_access_key) {
        (Some(id), Some(secret)) => {
            loader.credentials_provider(Credentials::new(id.clone(), secret.clone(), None, None, "tether-static"))
        }
        _ => loader,
    };
    loader.load().await
}

/// Map an SDK failure, classifying dispatch I/O and timeouts as transient.
pub(crate) fn map_sdk_error<E>(err: &SdkError<E, HttpResponse>, wrap: fn(String) -> TetherError) -> TetherError
where
    E: std::error::Error + 'static,
{
    match err {
        SdkError::DispatchFailure(dispatch_err) => {
            if dispatch_err.is_timeout() {
                return TetherError::Timeout(err.to_string());
            }
            if dispatch_err.is_io() {
                return TetherError::Connection(err.to_string());
            }
        }
        SdkError::TimeoutError(_) => return TetherError::Timeout(err.to_string()),
        _ => {}
    }
    wrap(format!("{}", aws_sdk_s3::error::DisplayErrorContext(err)))
}

/// HTTP status of a service error response, if one was received.
pub(crate) fn response_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

/// Convert an AWS timestamp.
pub(crate) fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}
