//! Listeners and process-wide coordination
//!
//! - `diagnostics` - introspection listener toggled by the observability ConfigMap
//! - `metrics` - Prometheus registry served by the diagnostics listener
//! - `shutdown` - latched shutdown broadcast and SIGTERM/SIGINT handling

pub mod diagnostics;
pub mod metrics;
pub mod shutdown;

pub use diagnostics::{DiagnosticsServer, DiagnosticsSettings, ListenerState};
pub use metrics::{create_metrics, AdapterMetrics, SharedMetrics};
pub use shutdown::{
    forward_os_signals, shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal,
};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "diagnostics_test.rs"]
mod diagnostics_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
