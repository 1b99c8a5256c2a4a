//! Tests for DynamicConfigSource delivery, dedup and retry

use super::source::*;
use super::store::{ConfigStore, MemoryConfigStore, StoreError};
use super::{ConfigObserver, ConfigRecord};
use crate::error::AdapterError;
use crate::server::metrics::create_metrics;
use crate::server::shutdown_channel;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Accept,
    Reject,
    Panic,
}

struct RecordingObserver {
    label: &'static str,
    behavior: Behavior,
    seen: watch::Sender<Vec<ConfigRecord>>,
}

impl RecordingObserver {
    fn new(label: &'static str) -> Arc<Self> {
        Self::with_behavior(label, Behavior::Accept)
    }

    fn with_behavior(label: &'static str, behavior: Behavior) -> Arc<Self> {
        let (seen, _) = watch::channel(Vec::new());
        Arc::new(RecordingObserver {
            label,
            behavior,
            seen,
        })
    }

    fn seen(&self) -> Vec<ConfigRecord> {
        self.seen.borrow().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<ConfigRecord> {
        let mut rx = self.seen.subscribe();
        let seen = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|v| v.len() >= count))
            .await
            .expect("observer was not called in time")
            .expect("observer channel closed");
        seen.clone()
    }
}

#[async_trait]
impl ConfigObserver for RecordingObserver {
    fn name(&self) -> &str {
        self.label
    }

    async fn apply(&self, record: &ConfigRecord) -> Result<(), AdapterError> {
        self.seen.send_modify(|seen| seen.push(record.clone()));
        match self.behavior {
            Behavior::Accept => Ok(()),
            Behavior::Reject => Err(AdapterError::invalid_format(&record.name, "rejected")),
            Behavior::Panic => panic!("observer {} blew up", self.label),
        }
    }
}

fn record(name: &str, version: &str, value: &str) -> ConfigRecord {
    ConfigRecord::new(name, "ns")
        .with_version(version)
        .with_entry("value", value)
}

fn values(records: &[ConfigRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.get("value").unwrap_or_default().to_string())
        .collect()
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
    }
}

#[test]
fn test_backoff_doubles_up_to_cap() {
    let policy = fast_retry(10);
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(4), Duration::from_millis(800));
    assert_eq!(policy.backoff(5), Duration::from_secs(1));
    assert_eq!(policy.backoff(40), Duration::from_secs(1));
}

#[test]
fn test_watched_lists_registered_names() {
    let store = Arc::new(MemoryConfigStore::new());
    let mut source = DynamicConfigSource::new(store);
    source.watch("config-logging", RecordingObserver::new("a"));
    source.watch("config-observability", RecordingObserver::new("b"));
    source.watch("config-logging", RecordingObserver::new("c"));

    assert_eq!(
        source.watched(),
        vec!["config-logging", "config-observability"]
    );
}

#[tokio::test]
async fn test_initial_value_delivered_before_start_returns() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("config-logging", "1", "debug"));
    store.insert(record("config-observability", "7", "on"));

    let logging = RecordingObserver::new("logging");
    let observability = RecordingObserver::new("observability");
    let mut source = DynamicConfigSource::new(store.clone());
    source.watch("config-logging", logging.clone());
    source.watch("config-observability", observability.clone());

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    assert_eq!(values(&logging.seen()), vec!["debug"]);
    assert_eq!(values(&observability.seen()), vec!["on"]);
    assert_eq!(store.fetch_count(), 2);

    controller.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_missing_record_fails_start() {
    let store = Arc::new(MemoryConfigStore::new());
    let observer = RecordingObserver::new("logging");
    let mut source = DynamicConfigSource::new(store);
    source.watch("config-logging", observer.clone());

    let (_controller, signal) = shutdown_channel();
    let err = source.start(signal).await.err().unwrap();

    assert!(matches!(
        err,
        AdapterError::WatchStartFailed(StoreError::NotFound(_))
    ));
    assert!(observer.seen().is_empty());
}

#[tokio::test]
async fn test_changes_delivered_once_in_order() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let observer = RecordingObserver::new("obs");
    let mut source = DynamicConfigSource::new(store.clone());
    source.watch("cfg", observer.clone());

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    store.update(record("cfg", "2", "b"));
    store.update(record("cfg", "3", "c"));
    store.update(record("cfg", "4", "d"));

    let seen = observer.wait_for(4).await;
    assert_eq!(values(&seen), vec!["a", "b", "c", "d"]);

    controller.shutdown();
    task.await.unwrap();
    assert_eq!(observer.seen().len(), 4);
}

/// The watch replays the current state on (re)connect; it must not re-apply it
#[tokio::test]
async fn test_unchanged_and_unwatched_records_skipped() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let observer = RecordingObserver::new("obs");
    let mut source = DynamicConfigSource::new(store.clone());
    source.watch("cfg", observer.clone());

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    store.update(record("cfg", "1", "a"));
    store.update(record("other", "9", "ignored"));
    store.update(record("cfg", "2", "b"));
    store.update(record("cfg", "2", "b"));
    store.update(record("cfg", "3", "marker"));

    let seen = observer.wait_for(3).await;
    assert_eq!(values(&seen), vec!["a", "b", "marker"]);

    controller.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_failing_observers_isolated() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let rejecting = RecordingObserver::with_behavior("rejecting", Behavior::Reject);
    let panicking = RecordingObserver::with_behavior("panicking", Behavior::Panic);
    let healthy = RecordingObserver::new("healthy");
    let metrics = create_metrics().unwrap();

    let mut source = DynamicConfigSource::new(store.clone()).with_metrics(metrics.clone());
    source.watch("cfg", rejecting.clone());
    source.watch("cfg", panicking.clone());
    source.watch("cfg", healthy.clone());

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();
    assert_eq!(values(&healthy.seen()), vec!["a"]);

    store.update(record("cfg", "2", "b"));
    let seen = healthy.wait_for(2).await;
    assert_eq!(values(&seen), vec!["a", "b"]);
    assert_eq!(rejecting.seen().len(), 2);
    assert_eq!(panicking.seen().len(), 2);

    assert_eq!(metrics.config_updates("cfg"), 2);
    assert_eq!(metrics.config_apply_failures("cfg"), 4);

    controller.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_watch_cleanly() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let observer = RecordingObserver::new("obs");
    let mut source = DynamicConfigSource::new(store.clone());
    source.watch("cfg", observer.clone());

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("watch did not stop")
        .unwrap();

    store.update(record("cfg", "2", "b"));
    tokio::task::yield_now().await;
    assert_eq!(observer.seen().len(), 1);
}

#[tokio::test]
async fn test_stream_end_is_an_error() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    // Consume the only live stream so the source gets an empty one
    drop(store.watch());

    let mut source = DynamicConfigSource::new(store.clone());
    source.watch("cfg", RecordingObserver::new("obs"));

    let (_controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();
    let err = task.await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::StreamClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_after_consecutive_errors() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let mut source = DynamicConfigSource::new(store.clone()).with_retry(fast_retry(3));
    source.watch("cfg", RecordingObserver::new("obs"));

    let (_controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    let start = tokio::time::Instant::now();
    for _ in 0..3 {
        store.push_error(StoreError::NotFound("cfg".to_string()));
    }
    let err = task.await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::RetriesExhausted { attempts: 3, .. })
    ));
    // Backoff after the first two failures only
    assert_eq!(start.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_successful_event_resets_failure_count() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let observer = RecordingObserver::new("obs");
    let mut source = DynamicConfigSource::new(store.clone()).with_retry(fast_retry(3));
    source.watch("cfg", observer.clone());

    let (controller, signal) = shutdown_channel();
    let mut task = source.start(signal).await.unwrap();

    store.push_error(StoreError::NotFound("cfg".to_string()));
    store.push_error(StoreError::NotFound("cfg".to_string()));
    store.update(record("cfg", "2", "b"));
    store.push_error(StoreError::NotFound("cfg".to_string()));
    store.push_error(StoreError::NotFound("cfg".to_string()));
    store.update(record("cfg", "3", "c"));

    let seen = observer.wait_for(3).await;
    assert_eq!(values(&seen), vec!["a", "b", "c"]);

    // Still alive after four errors in total
    assert!(
        tokio::time::timeout(Duration::from_millis(10), &mut task)
            .await
            .is_err()
    );

    controller.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(record("cfg", "1", "a"));
    let retry = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(60),
    };
    let mut source = DynamicConfigSource::new(store.clone()).with_retry(retry);
    source.watch("cfg", RecordingObserver::new("obs"));

    let (controller, signal) = shutdown_channel();
    let task = source.start(signal).await.unwrap();

    store.push_error(StoreError::NotFound("cfg".to_string()));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let start = tokio::time::Instant::now();
    controller.shutdown();
    task.await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(59));
}
