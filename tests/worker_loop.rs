//! End-to-end worker behaviour over the in-memory source.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tether::concurrency::run_bounded;
use tether::config::SourceKind;
use tether::job::JobBody;
use tether::{
    Client, InMemoryResultStore, InMemorySource, Job, JobError, JobId, JobResult, JobSource, JobState, Outcome,
    ResultReporter, ResultStore, TetherError, WorkResult, Worker, WorkerConfig,
};

#[derive(Clone, Default)]
struct Recorder {
    results: Arc<Mutex<Vec<WorkResult>>>,
}

impl Recorder {
    fn results(&self) -> Vec<WorkResult> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultReporter for Recorder {
    async fn report(&self, result: &WorkResult) -> tether::Result<()> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Delegates to an in-memory source but can never acknowledge.
#[derive(Clone)]
struct BrokenAck {
    inner: InMemorySource,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl JobSource for BrokenAck {
    fn kind(&self) -> SourceKind {
        SourceKind::Cache
    }

    fn name(&self) -> &str {
        "broken-ack"
    }

    async fn fetch_batch(&self, max: usize) -> tether::Result<Vec<Job>> {
        self.inner.fetch_batch(max).await
    }

    async fn acknowledge(&self, _job: &Job) -> tether::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TetherError::Connection("connection reset".to_string()))
    }

    async fn enqueue(&self, body: &JobBody) -> tether::Result<JobId> {
        self.inner.enqueue(body).await
    }
}

fn quiet_config() -> WorkerConfig {
    WorkerConfig::builder()
        .poll_interval(Duration::from_millis(10))
        .retry_backoff(Duration::from_millis(1))
        .enable_reaper(false)
        .worker_id("test-worker")
        .build()
}

async fn double(job: Job) -> JobResult {
    let val = job
        .get("val")
        .and_then(Value::as_i64)
        .ok_or_else(|| JobError::new("val must be an integer"))?;
    Ok(Outcome::success(val * 2))
}

async fn enqueue_all(source: &InMemorySource, bodies: &[Value]) {
    let client = Client::new(source.clone());
    for body in bodies {
        client.enqueue_value(body).await.unwrap();
    }
}

#[tokio::test]
async fn test_successful_jobs_reported_and_acknowledged_once() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "a", "val": 1}), json!({"id": "b", "val": 2})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(double)
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.succeeded, 2);

    let results = recorder.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], WorkResult::success(JobId::from("a"), json!(2)));
    assert_eq!(results[1], WorkResult::success(JobId::from("b"), json!(4)));
    assert_eq!(source.acknowledged(), 2);
    assert_eq!(source.in_flight_len(), 0);

    // nothing left to hand out
    assert_eq!(worker.poll_once().await.unwrap().fetched, 0);
    assert_eq!(recorder.results().len(), 2);
}

#[tokio::test]
async fn test_raising_jobs_are_not_reported_and_stay_in_flight() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "bad", "val": "x"}), json!({"id": "good", "val": 5})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(double)
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);

    let results = recorder.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id, JobId::from("good"));
    assert_eq!(source.in_flight_len(), 1);

    // the failed job comes back once it is considered stale
    assert_eq!(source.recover(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(source.pending_len(), 1);
}

#[tokio::test]
async fn test_completed_failure_outcome_is_acknowledged_and_reported() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "7"})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(|_job: Job| async { Ok::<_, JobError>(Outcome::failure("no input file")) })
        .reporter(recorder.clone())
        .build()
        .unwrap();

    worker.poll_once().await.unwrap();
    assert_eq!(recorder.results(), vec![WorkResult::error(JobId::from("7"), "no input file")]);
    assert_eq!(source.acknowledged(), 1);
}

#[tokio::test]
async fn test_panicking_job_does_not_stop_the_batch() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "p", "panic": true}), json!({"id": "q", "val": 10})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(|job: Job| async move {
            if job.get("panic").is_some() {
                panic!("handler exploded");
            }
            double(job).await
        })
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(recorder.results().len(), 1);
    assert_eq!(source.in_flight_len(), 1);
}

#[tokio::test]
async fn test_failed_acknowledgment_withholds_result() {
    let inner = InMemorySource::new();
    enqueue_all(&inner, &[json!({"id": "1", "val": 1})]).await;
    let source = BrokenAck {
        inner: inner.clone(),
        attempts: Arc::new(AtomicUsize::new(0)),
    };

    let recorder = Recorder::default();
    let mut config = quiet_config();
    config.ack_attempts = 3;
    let worker = Worker::builder()
        .config(config)
        .source(source.clone())
        .handler(double)
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.unacknowledged, 1);
    assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
    assert!(recorder.results().is_empty());
    assert_eq!(inner.in_flight_len(), 1);
}

#[tokio::test]
async fn test_malformed_entries_are_dropped() {
    let source = InMemorySource::new();
    source.push_raw("not json");
    source.push_raw("[1, 2]");
    enqueue_all(&source, &[json!({"id": "ok", "val": 3})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(double)
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.fetched, 1);
    assert_eq!(recorder.results().len(), 1);
    assert_eq!(source.pending_len(), 0);
    assert_eq!(source.in_flight_len(), 0);
}

#[tokio::test]
async fn test_run_until_processes_then_stops() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "1", "val": 1}), json!({"id": "2", "val": 2}), json!({"id": "3", "val": 3})]).await;

    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .batch_size(2)
        .source(source.clone())
        .handler(double)
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let watched = source.clone();
    let shutdown = async move {
        while watched.acknowledged() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), worker.run_until(shutdown))
        .await
        .expect("worker did not stop")
        .unwrap();

    assert!(!worker.is_running());
    assert_eq!(recorder.results().len(), 3);
}

#[tokio::test]
async fn test_reaper_hands_failed_job_out_again() {
    let source = InMemorySource::new();
    enqueue_all(&source, &[json!({"id": "retry", "val": 4})]).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let recorder = Recorder::default();
    let config = WorkerConfig::builder()
        .poll_interval(Duration::from_millis(5))
        .retry_backoff(Duration::from_millis(1))
        .recover_interval(Duration::from_millis(10))
        .job_timeout(Duration::from_millis(20))
        .enable_reaper(true)
        .build();

    let worker = Worker::builder()
        .config(config)
        .source(source.clone())
        .handler(move |job: Job| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(JobError::new("first attempt fails"));
                }
                double(job).await
            }
        })
        .reporter(recorder.clone())
        .build()
        .unwrap();

    let watched = recorder.clone();
    let shutdown = async move {
        while watched.results().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), worker.run_until(shutdown))
        .await
        .expect("job was never retried")
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.results(), vec![WorkResult::success(JobId::from("retry"), json!(8))]);
}

/// Accept one HTTP request, answer 200, and return the request body.
async fn callback_server() -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/results", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        let body = loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= split + 4 + length {
                    break text[split + 4..].to_string();
                }
            }
            if n == 0 {
                break String::new();
            }
        };
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        body
    });

    (url, handle)
}

#[tokio::test]
async fn test_doubling_job_posts_result_to_callback() {
    let (url, server) = callback_server().await;
    let source = InMemorySource::new();
    source.push_raw(r#"{"id":"1","val":21}"#);

    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(double)
        .callback_url(url)
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let body: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
    assert_eq!(body, json!({"job_id": "1", "status": "success", "result": 42}));
    assert_eq!(source.pending_len(), 0);
    assert_eq!(source.in_flight_len(), 0);
}

#[tokio::test]
async fn test_bounded_results_keep_input_order_despite_failures() {
    let ops = (0..8u64).map(|i| async move {
        tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
        if i % 3 == 0 {
            Err(format!("task {i} failed"))
        } else {
            Ok(i * 10)
        }
    });

    let results = run_bounded(ops, 3).await;
    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        let i = i as u64;
        if i % 3 == 0 {
            assert_eq!(result, &Err(format!("task {i} failed")));
        } else {
            assert_eq!(result, &Ok(i * 10));
        }
    }
}

#[tokio::test]
async fn test_absent_values_on_empty_source() {
    let source = InMemorySource::new();
    assert!(source.fetch_batch(10).await.unwrap().is_empty());

    // acknowledging a job that is no longer in flight is not an error
    let id = source.enqueue(json!({"id": "x"}).as_object().unwrap()).await.unwrap();
    let jobs = source.fetch_batch(1).await.unwrap();
    assert_eq!(jobs[0].id, id);
    source.acknowledge(&jobs[0]).await.unwrap();
    source.acknowledge(&jobs[0]).await.unwrap();
    assert_eq!(source.acknowledged(), 1);
}

fn body(value: Value) -> JobBody {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_cached_params_key_skips_handler() {
    let source = InMemorySource::new();
    let store = InMemoryResultStore::new();
    let client = Client::new(source.clone()).with_store(store.clone());
    client.enqueue_cached(body(json!({"id": "first", "val": 21})), "val=21").await.unwrap();
    client.enqueue_cached(body(json!({"id": "second", "val": 21})), "val=21").await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let recorder = Recorder::default();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(move |job: Job| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                double(job).await
            }
        })
        .reporter(recorder.clone())
        .result_store(store.clone())
        .build()
        .unwrap();

    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.cached_result("val=21").await.unwrap(), Some(json!(42)));

    // both jobs are acknowledged and reported with the same result
    assert_eq!(source.acknowledged(), 2);
    assert_eq!(
        recorder.results(),
        vec![
            WorkResult::success(JobId::from("first"), json!(42)),
            WorkResult::success(JobId::from("second"), json!(42)),
        ]
    );
}

#[tokio::test]
async fn test_precached_result_never_runs_handler() {
    let source = InMemorySource::new();
    let store = InMemoryResultStore::new();
    store.cache_result("report=q3", &json!({"rows": 10})).await.unwrap();
    Client::new(source.clone())
        .enqueue_cached(body(json!({"id": "r"})), "report=q3")
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(move |_job: Job| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(Outcome::success(0))
            }
        })
        .reporter(Recorder::default())
        .result_store(store.clone())
        .build()
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap().succeeded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let status = store.status(&JobId::from("r")).await.unwrap().unwrap();
    assert_eq!(status.result.unwrap().result, Some(json!({"rows": 10})));
}

#[tokio::test]
async fn test_job_status_follows_job_to_done() {
    let source = InMemorySource::new();
    let store = InMemoryResultStore::new();
    let client = Client::new(source.clone()).with_store(store.clone());
    let ok = client.enqueue(body(json!({"val": 5}))).await.unwrap();
    let bad = client.enqueue(body(json!({"val": "five"}))).await.unwrap();

    assert_eq!(client.job_status(&ok).await.unwrap().unwrap().state, JobState::Queued);

    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(double)
        .reporter(Recorder::default())
        .result_store(store.clone())
        .build()
        .unwrap();
    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let status = client.job_status(&ok).await.unwrap().unwrap();
    assert!(status.is_done());
    assert_eq!(status.result, Some(WorkResult::success(ok.clone(), json!(10))));

    // a raising handler leaves the job queued for redelivery
    let status = client.job_status(&bad).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert!(status.result.is_none());
}

#[tokio::test]
async fn test_failure_outcome_is_recorded_but_not_cached() {
    let source = InMemorySource::new();
    let store = InMemoryResultStore::new();
    Client::new(source.clone())
        .with_store(store.clone())
        .enqueue_cached(body(json!({"id": "f"})), "always-fails")
        .await
        .unwrap();

    let worker = Worker::builder()
        .config(quiet_config())
        .source(source.clone())
        .handler(|_job: Job| async move { Ok::<_, JobError>(Outcome::failure("upstream said no")) })
        .reporter(Recorder::default())
        .result_store(store.clone())
        .build()
        .unwrap();
    worker.poll_once().await.unwrap();

    assert_eq!(store.cached_len(), 0);
    let status = store.status(&JobId::from("f")).await.unwrap().unwrap();
    assert!(status.is_done());
    assert_eq!(status.result.unwrap().error.as_deref(), Some("upstream said no"));
}
