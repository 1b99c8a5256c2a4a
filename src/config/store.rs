//! Configuration store contract and its Kubernetes implementation
//!
//! The rest of the crate depends only on "fetch a record by name" and
//! "stream every changed record". `KubeConfigStore` maps both onto
//! ConfigMaps in a single namespace.

use super::record::ConfigRecord;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("ConfigMap watch error: {0}")]
    Watch(#[from] watcher::Error),

    #[error("ConfigMap {0} not found")]
    NotFound(String),

    #[error("Watch gave up after {attempts} consecutive failures: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Watch stream closed")]
    StreamClosed,
}

/// Named key/value records that can be fetched and watched
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<ConfigRecord, StoreError>;

    /// Stream of records as they are created or updated
    ///
    /// Errors are transient: the stream keeps producing items after an
    /// error until it is dropped or returns `None`.
    fn watch(&self) -> BoxStream<'static, Result<ConfigRecord, StoreError>>;
}

/// ConfigMaps in one namespace, read through the Kubernetes API
#[derive(Clone)]
pub struct KubeConfigStore {
    api: Api<ConfigMap>,
    namespace: String,
}

impl KubeConfigStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeConfigStore {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn fetch(&self, name: &str) -> Result<ConfigRecord, StoreError> {
        match self.api.get(name).await {
            Ok(cm) => Ok(ConfigRecord::from(cm)),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(StoreError::NotFound(format!("{}/{}", self.namespace, name)))
            }
            Err(e) => Err(StoreError::Kube(e)),
        }
    }

    fn watch(&self) -> BoxStream<'static, Result<ConfigRecord, StoreError>> {
        watcher(self.api.clone(), watcher::Config::default())
            .applied_objects()
            .map(|res| res.map(ConfigRecord::from).map_err(StoreError::from))
            .boxed()
    }
}

/// In-memory store for tests
///
/// `update` stores a record and pushes it to the watch stream;
/// `push_error` injects a transient stream error.
#[cfg(test)]
pub struct MemoryConfigStore {
    records: std::sync::Mutex<std::collections::HashMap<String, ConfigRecord>>,
    events: tokio::sync::mpsc::UnboundedSender<Result<ConfigRecord, StoreError>>,
    receiver: std::sync::Mutex<
        Option<tokio::sync::mpsc::UnboundedReceiver<Result<ConfigRecord, StoreError>>>,
    >,
    fetches: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MemoryConfigStore {
    pub fn new() -> Self {
        let (events, receiver) = tokio::sync::mpsc::unbounded_channel();
        MemoryConfigStore {
            records: std::sync::Mutex::new(std::collections::HashMap::new()),
            events,
            receiver: std::sync::Mutex::new(Some(receiver)),
            fetches: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Store a record without emitting a watch event
    pub fn insert(&self, record: ConfigRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
    }

    /// Store a record and emit it on the watch stream
    pub fn update(&self, record: ConfigRecord) {
        self.insert(record.clone());
        let _ = self.events.send(Ok(record));
    }

    pub fn push_error(&self, error: StoreError) {
        let _ = self.events.send(Err(error));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn fetch(&self, name: &str) -> Result<ConfigRecord, StoreError> {
        self.fetches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn watch(&self) -> BoxStream<'static, Result<ConfigRecord, StoreError>> {
        match self.receiver.lock().unwrap().take() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}
