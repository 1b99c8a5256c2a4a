//! Process configuration and dynamic ConfigMap delivery
//!
//! - `BootConfig` - immutable environment snapshot read once at startup
//! - `ConfigRecord` / `ConfigObserver` - a ConfigMap and the handlers reacting to it
//! - `ConfigStore` - fetch + watch contract, backed by the Kubernetes API
//! - `DynamicConfigSource` - initial delivery plus the background watch task

pub mod boot;
pub mod record;
pub mod source;
pub mod store;

pub use boot::{
    BootConfig, DEFAULT_DIAGNOSTICS_PORT, DEFAULT_LOGGING_CONFIG_MAP,
    DEFAULT_OBSERVABILITY_CONFIG_MAP, DEFAULT_SHUTDOWN_GRACE, DEFAULT_VERSION_POLL_INTERVAL,
    DEFAULT_VERSION_TIMEOUT,
};
pub use record::{ConfigObserver, ConfigRecord};
pub use source::{DynamicConfigSource, RetryPolicy, WatchTask};
pub use store::{ConfigStore, KubeConfigStore, StoreError};

#[cfg(test)]
pub use store::MemoryConfigStore;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "boot_test.rs"]
mod boot_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "source_test.rs"]
mod source_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "store_test.rs"]
mod store_tests;
