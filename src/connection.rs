//! Connection providers with replace-on-refresh semantics.
//!
//! A [`Refreshing`] provider owns at most one live handle (a *lease*). A lease
//! is handed out only while it is younger than the configured expiry; once it
//! has expired, the next caller opens a fresh handle and swaps it in wholesale.
//! Operations already holding the previous `Arc` finish on it undisturbed, and
//! no operation acquires a handle past its expiry.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;

/// Opens handles to one external service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The live client/session type.
    type Handle: Send + Sync + 'static;

    /// Service name used in logs.
    fn name(&self) -> &str;

    /// Open a new handle.
    async fn connect(&self) -> Result<Self::Handle>;
}

struct Lease<H> {
    handle: Arc<H>,
    opened_at: Instant,
}

struct Inner<C: Connector> {
    connector: C,
    expiry: Duration,
    lease: RwLock<Option<Lease<C::Handle>>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
}

/// A connection handle that is refreshed on expiry and replaced, never mutated.
pub struct Refreshing<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Refreshing<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> Refreshing<C> {
    /// Create a provider. No connection is opened until the first acquire.
    pub fn new(connector: C, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                expiry,
                lease: RwLock::new(None),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create a provider and open its first handle eagerly.
    pub async fn connect(connector: C, expiry: Duration) -> Result<Self> {
        let provider = Self::new(connector, expiry);
        provider.acquire().await?;
        Ok(provider)
    }

    /// The configured handle lifetime.
    pub fn expiry(&self) -> Duration {
        self.inner.expiry
    }

    /// Number of handles opened so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// The underlying connector.
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Get a handle that has not expired, opening a new one if needed.
    pub async fn acquire(&self) -> Result<Arc<C::Handle>> {
        if let Some(handle) = self.current().await {
            return Ok(handle);
        }

        let _guard = self.inner.connect_lock.lock().await;
        // Another caller may have reconnected while we waited.
        if let Some(handle) = self.current().await {
            return Ok(handle);
        }
        self.open().await
    }

    /// Open a new handle now, regardless of the current lease's age.
    pub async fn refresh(&self) -> Result<Arc<C::Handle>> {
        let _guard = self.inner.connect_lock.lock().await;
        self.open().await
    }

    /// Drop the current lease so the next acquire reconnects.
    pub async fn invalidate(&self) {
        self.inner.lease.write().await.take();
    }

    /// Scoped acquisition: acquire a handle, run `op` with it, and drop the
    /// lease if the operation failed with a transient error.
    pub async fn with_handle<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<C::Handle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire().await?;
        let result = op(handle).await;
        if let Err(e) = &result {
            if e.is_transient() {
                tracing::warn!(
                    service = self.inner.connector.name(),
                    error = %e,
                    "Transient failure, dropping connection"
                );
                self.invalidate().await;
            }
        }
        result
    }

    /// Refresh the handle every `expiry` until `shutdown` resolves.
    pub fn spawn_refresher<F>(&self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let provider = self.clone();
        tokio::spawn(async move {
            // interval() panics on a zero period
            let period = provider.inner.expiry.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = provider.refresh().await {
                    tracing::error!(
                        service = provider.inner.connector.name(),
                        error = %e,
                        "Failed to refresh connection"
                    );
                }
            }
            tracing::debug!(service = provider.inner.connector.name(), "Refresher stopped");
        })
    }

    async fn current(&self) -> Option<Arc<C::Handle>> {
        let lease = self.inner.lease.read().await;
        lease
            .as_ref()
            .filter(|l| l.opened_at.elapsed() < self.inner.expiry)
            .map(|l| l.handle.clone())
    }

    /// Must be called with `connect_lock` held.
    async fn open(&self) -> Result<Arc<C::Handle>> {
        let name = self.inner.connector.name();
        let reestablish = self.generation() > 0;
        tracing::debug!(service = name, reestablish, "Opening connection");

        let handle = Arc::new(self.inner.connector.connect().await?);
        *self.inner.lease.write().await = Some(Lease {
            handle: handle.clone(),
            opened_at: Instant::now(),
        });
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::info!(service = name, generation, "Connection established");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnector {
        opened: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Handle = usize;

        fn name(&self) -> &str {
            "counting"
        }

        async fn connect(&self) -> Result<usize> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn provider(expiry: Duration, delay: Duration) -> (Refreshing<CountingConnector>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            opened: opened.clone(),
            delay,
        };
        (Refreshing::new(connector, expiry), opened)
    }

    #[tokio::test]
    async fn test_lazy_until_first_acquire() {
        let (provider, opened) = provider(Duration::from_secs(60), Duration::ZERO);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(*provider.acquire().await.unwrap(), 1);
        assert_eq!(*provider.acquire().await.unwrap(), 1);
        assert_eq!(provider.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_handle_is_replaced() {
        let (provider, opened) = provider(Duration::from_secs(10), Duration::ZERO);

        let first = provider.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(*provider.acquire().await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = provider.acquire().await.unwrap();
        assert_eq!(*second, 2);
        assert_eq!(opened.load(Ordering::SeqCst), 2);

        // the old handle is still usable by whoever holds it
        assert_eq!(*first, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_hands_out_expired_handle() {
        let expiry = Duration::from_secs(5);
        let (provider, _) = provider(expiry, Duration::ZERO);

        let mut last_generation = 0;
        let mut opened_at = Instant::now();
        for _ in 0..20 {
            provider.acquire().await.unwrap();
            if provider.generation() != last_generation {
                last_generation = provider.generation();
                opened_at = Instant::now();
            }
            assert!(opened_at.elapsed() < expiry);
            tokio::time::advance(Duration::from_millis(1700)).await;
        }
        assert!(provider.generation() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_connects_once() {
        let (provider, opened) = provider(Duration::from_secs(60), Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let p = provider.clone();
            handles.push(tokio::spawn(async move { *p.acquire().await.unwrap() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_forces_new_handle() {
        let (provider, _) = provider(Duration::from_secs(60), Duration::ZERO);
        provider.acquire().await.unwrap();
        assert_eq!(*provider.refresh().await.unwrap(), 2);
        assert_eq!(*provider.acquire().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_with_handle_drops_lease_on_transient_error() {
        let (provider, _) = provider(Duration::from_secs(60), Duration::ZERO);

        let err = provider
            .with_handle(|_| async { Err::<(), _>(TetherError::Connection("reset".into())) })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // next use reconnects
        let value = provider.with_handle(|h| async move { Ok(*h) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_with_handle_keeps_lease_on_other_errors() {
        let (provider, _) = provider(Duration::from_secs(60), Duration::ZERO);

        let _ = provider
            .with_handle(|_| async { Err::<(), _>(TetherError::InvalidInput("key".into())) })
            .await;
        let value = provider.with_handle(|h| async move { Ok(*h) }).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_renews_on_timer() {
        let (provider, opened) = provider(Duration::from_secs(10), Duration::ZERO);
        provider.acquire().await.unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = provider.spawn_refresher(async move {
            let _ = stopped.await;
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(opened.load(Ordering::SeqCst) >= 3);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_stops_without_waiting_for_a_tick() {
        let (provider, opened) = provider(Duration::from_secs(3600), Duration::ZERO);
        provider.acquire().await.unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = provider.spawn_refresher(async move {
            let _ = stopped.await;
        });
        tokio::task::yield_now().await;

        let started = Instant::now();
        stop.send(()).unwrap();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }
}
