//! ConfigMap snapshots and the observers that react to them

use crate::error::AdapterError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// A named, versioned key/value document read from the configuration store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigRecord {
    pub name: String,
    pub namespace: String,
    /// Store-assigned version; `None` when the store does not track one
    pub resource_version: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl ConfigRecord {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        ConfigRecord {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Look up a value, ignoring surrounding whitespace
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.trim())
    }
}

impl From<ConfigMap> for ConfigRecord {
    fn from(cm: ConfigMap) -> Self {
        ConfigRecord {
            name: cm.name_any(),
            namespace: cm.namespace().unwrap_or_default(),
            resource_version: cm.resource_version(),
            data: cm.data.unwrap_or_default(),
        }
    }
}

/// Applies the effect of a ConfigRecord
///
/// Observers are invoked once with the initial value and again on every
/// change, possibly more than once for the same content, so `apply` must
/// be idempotent.
#[async_trait]
pub trait ConfigObserver: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn apply(&self, record: &ConfigRecord) -> Result<(), AdapterError>;
}
