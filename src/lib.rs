//! # tether - service wrappers and a long-running-job worker
//!
//! Async wrappers over the services a data pipeline usually talks to, plus a
//! worker that pulls jobs from a queue or a cache-backed list and reports
//! their results to an HTTP callback.
//!
//! ## Features
//!
//! - **Service wrappers**: S3, SQS, Secrets Manager, Redis, PostgreSQL and Jira
//! - **Refreshing connections**: handles are rebuilt once they expire
//! - **Job worker**: fetch, process, acknowledge, report
//! - **Stale job recovery**: list-backed jobs that were never acknowledged are handed out again
//! - **Job status and result cache**: poll a job's result, skip work already done for the same parameters
//! - **Bounded concurrency**: fan out futures or blocking calls with a limit
//! - **Structured logging**: JSON or pretty `tracing` output
//!
//! ## Quick Start
//!
//! ### Client (Enqueuing Jobs)
//!
//! ```rust,no_run
//! use tether::backend::RedisListSource;
//! use tether::config::RedisConfig;
//! use tether::Client;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let source = RedisListSource::connect(&RedisConfig::default(), "resize").await?;
//!     let client = Client::new(source);
//!
//!     client.enqueue_value(&json!({"id": "1", "val": 21})).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Worker (Processing Jobs)
//!
//! ```rust,no_run
//! use tether::backend::RedisListSource;
//! use tether::config::RedisConfig;
//! use tether::{Job, JobError, JobResult, Outcome, Worker};
//!
//! async fn double(job: Job) -> JobResult {
//!     let val = job
//!         .get("val")
//!         .and_then(|v| v.as_i64())
//!         .ok_or_else(|| JobError::new("val must be an integer"))?;
//!     Ok(Outcome::success(val * 2))
//! }
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let source = RedisListSource::connect(&RedisConfig::default(), "resize").await?;
//!     let worker = Worker::builder()
//!         .source(source)
//!         .handler(double)
//!         .callback_url("http://localhost:9000/results")
//!         .build()?;
//!
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod callback;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod job;
pub mod logging;
pub mod reaper;
pub mod source;
pub mod status;
pub mod worker;

// Re-export main types
pub use callback::{HttpCallback, LogReporter, ResultReporter};
pub use client::Client;
pub use config::{Config, SourceKind, WorkerConfig, WorkerConfigBuilder};
pub use connection::{Connector, Refreshing};
pub use context::Context;
pub use error::{Result, TetherError};
pub use job::{Job, JobBody, JobId, Outcome, WorkResult};
pub use source::{InMemorySource, JobSource, SharedSource};
pub use status::{InMemoryResultStore, JobState, JobStatus, ResultStore};
pub use worker::{JobError, JobResult, PollSummary, Worker, WorkerBuilder};
