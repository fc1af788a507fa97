//! Reaper component for stale job recovery.
//!
//! Cache-list sources keep fetched jobs in a processing area until they are
//! acknowledged. If a worker dies mid-job, nothing would ever hand that job out
//! again; the reaper periodically asks the source to requeue entries that have
//! been in flight longer than the job timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::source::JobSource;

/// Reaper that requeues jobs abandoned in flight.
pub struct Reaper<S: JobSource> {
    source: S,
    interval: Duration,
    stale_after: Duration,
    running: Arc<AtomicBool>,
}

impl<S: JobSource + Clone + 'static> Reaper<S> {
    /// Create a new reaper.
    pub fn new(source: S, interval: Duration, stale_after: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            source,
            interval,
            stale_after,
            running,
        }
    }

    /// Run the reaper loop until `running` is cleared.
    pub async fn run(&self) {
        tracing::debug!(source = self.source.name(), "Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.reap_once().await;
        }

        tracing::debug!(source = self.source.name(), "Reaper stopped");
    }

    /// One recovery pass. Returns how many jobs were requeued; errors are
    /// logged and count as zero.
    pub async fn reap_once(&self) -> usize {
        match self.source.recover(self.stale_after).await {
            Ok(0) => 0,
            Ok(count) => {
                tracing::warn!(
                    source = self.source.name(),
                    count,
                    stale_after_secs = self.stale_after.as_secs(),
                    "Requeued stale in-flight jobs"
                );
                count
            }
            Err(e) => {
                tracing::error!(source = self.source.name(), error = %e, "Failed to recover stale jobs");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_reap_once_requeues_stale() {
        let source = InMemorySource::new();
        source
            .enqueue(json!({"id": "a"}).as_object().unwrap())
            .await
            .unwrap();
        source.fetch_batch(1).await.unwrap();

        let reaper = Reaper::new(
            source.clone(),
            Duration::from_secs(1),
            Duration::from_secs(10),
            Arc::new(AtomicBool::new(true)),
        );

        assert_eq!(reaper.reap_once().await, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reaper.reap_once().await, 1);
        assert_eq!(source.pending_len(), 1);
        assert_eq!(source.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_cleared() {
        let source = InMemorySource::new();
        source
            .enqueue(json!({"id": "b"}).as_object().unwrap())
            .await
            .unwrap();
        source.fetch_batch(1).await.unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let reaper = Reaper::new(
            source.clone(),
            Duration::from_secs(5),
            Duration::from_secs(8),
            running.clone(),
        );
        let task = tokio::spawn(async move { reaper.run().await });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(source.pending_len(), 1);

        running.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        task.await.unwrap();
    }
}
