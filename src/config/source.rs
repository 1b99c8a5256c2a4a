//! Push-based delivery of ConfigMap changes to registered observers
//!
//! `start` performs the initial fetch and delivery inline, then hands the
//! store's change stream to a single background task. One consumer keeps
//! per-record ordering identical to the store's event order.

use super::record::{ConfigObserver, ConfigRecord};
use super::store::{ConfigStore, StoreError};
use crate::error::AdapterError;
use crate::server::metrics::SharedMetrics;
use crate::server::ShutdownSignal;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bounded retry for transient watch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the watch gives up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

type Observers = BTreeMap<String, Vec<Arc<dyn ConfigObserver>>>;

/// Delivers ConfigRecord changes to the observers registered per name
pub struct DynamicConfigSource {
    store: Arc<dyn ConfigStore>,
    observers: Observers,
    retry: RetryPolicy,
    metrics: Option<SharedMetrics>,
}

impl DynamicConfigSource {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        DynamicConfigSource {
            store,
            observers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `observer` for the record called `name`
    pub fn watch(&mut self, name: &str, observer: Arc<dyn ConfigObserver>) {
        debug!(record = %name, observer = observer.name(), "Registering config observer");
        self.observers
            .entry(name.to_string())
            .or_default()
            .push(observer);
    }

    /// Names of all watched records
    pub fn watched(&self) -> Vec<&str> {
        self.observers.keys().map(String::as_str).collect()
    }

    /// Deliver the current value of every watched record, then spawn the watch task
    ///
    /// Returns once every observer has seen the initial value. The returned
    /// `WatchTask` resolves when `done` fires or when the watch fails for good.
    pub async fn start(self, done: ShutdownSignal) -> Result<WatchTask, AdapterError> {
        let mut delivered = HashMap::new();

        for (name, observers) in &self.observers {
            let record = self
                .store
                .fetch(name)
                .await
                .map_err(AdapterError::WatchStartFailed)?;
            info!(
                record = %name,
                version = ?record.resource_version,
                "Loaded initial configuration"
            );
            deliver(observers, &record, self.metrics.as_ref()).await;
            delivered.insert(name.clone(), record.resource_version);
        }

        let stream = self.store.watch();
        let handle = tokio::spawn(run_watch(
            stream,
            self.observers,
            delivered,
            self.retry,
            self.metrics,
            done,
        ));
        info!("Configuration watch started");

        Ok(WatchTask { handle })
    }
}

/// Handle to the background watch task
///
/// Resolves to the task's result. Dropping it aborts the task.
pub struct WatchTask {
    handle: JoinHandle<Result<(), StoreError>>,
}

impl Future for WatchTask {
    type Output = anyhow::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::anyhow!("config watch task aborted: {}", e)),
        })
    }
}

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_watch(
    mut stream: BoxStream<'static, Result<ConfigRecord, StoreError>>,
    observers: Observers,
    mut delivered: HashMap<String, Option<String>>,
    retry: RetryPolicy,
    metrics: Option<SharedMetrics>,
    mut done: ShutdownSignal,
) -> Result<(), StoreError> {
    let mut failures: u32 = 0;

    loop {
        let next = tokio::select! {
            _ = done.wait() => {
                info!("Configuration watch stopping");
                return Ok(());
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(record)) => {
                failures = 0;
                let Some(registered) = observers.get(&record.name) else {
                    continue;
                };
                if record.resource_version.is_some()
                    && delivered.get(&record.name) == Some(&record.resource_version)
                {
                    debug!(record = %record.name, "Config unchanged, skipping delivery");
                    continue;
                }
                delivered.insert(record.name.clone(), record.resource_version.clone());
                info!(
                    record = %record.name,
                    version = ?record.resource_version,
                    "Configuration changed"
                );
                deliver(registered, &record, metrics.as_ref()).await;
            }
            Some(Err(e)) => {
                failures += 1;
                if failures >= retry.max_attempts {
                    error!(attempts = failures, error = %e, "Configuration watch retries exhausted");
                    return Err(StoreError::RetriesExhausted {
                        attempts: failures,
                        last: e.to_string(),
                    });
                }
                let delay = retry.backoff(failures);
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Configuration watch error, retrying"
                );
                tokio::select! {
                    _ = done.wait() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                if done.is_shutdown() {
                    return Ok(());
                }
                error!("Configuration watch stream ended unexpectedly");
                return Err(StoreError::StreamClosed);
            }
        }
    }
}

/// Invoke every observer; failures and panics are isolated per observer
async fn deliver(
    observers: &[Arc<dyn ConfigObserver>],
    record: &ConfigRecord,
    metrics: Option<&SharedMetrics>,
) {
    if let Some(metrics) = metrics {
        metrics.record_config_update(&record.name);
    }

    for observer in observers {
        match AssertUnwindSafe(observer.apply(record)).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(record = %record.name, observer = observer.name(), "Config applied");
            }
            Ok(Err(e)) => {
                warn!(
                    record = %record.name,
                    observer = observer.name(),
                    error = %e,
                    "Config rejected, previous settings kept"
                );
                if let Some(metrics) = metrics {
                    metrics.record_config_apply_failure(&record.name);
                }
            }
            Err(_) => {
                error!(
                    record = %record.name,
                    observer = observer.name(),
                    "Config observer panicked"
                );
                if let Some(metrics) = metrics {
                    metrics.record_config_apply_failure(&record.name);
                }
            }
        }
    }
}
