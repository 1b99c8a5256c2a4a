//! Prometheus metrics for the adapter lifecycle
//!
//! Registered on a private registry and served by the diagnostics
//! listener on `/metrics`.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub type SharedMetrics = Arc<AdapterMetrics>;

pub struct AdapterMetrics {
    registry: Registry,
    config_updates: IntCounterVec,
    config_apply_failures: IntCounterVec,
    diagnostics_enabled: IntGauge,
    task_exits: IntCounterVec,
}

impl AdapterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let config_updates = IntCounterVec::new(
            Opts::new(
                "kadapter_config_updates_total",
                "Configuration records delivered to observers",
            ),
            &["record"],
        )?;
        let config_apply_failures = IntCounterVec::new(
            Opts::new(
                "kadapter_config_apply_failures_total",
                "Observer failures while applying a configuration record",
            ),
            &["record"],
        )?;
        let diagnostics_enabled = IntGauge::new(
            "kadapter_diagnostics_enabled",
            "1 while the diagnostics listener is serving",
        )?;
        let task_exits = IntCounterVec::new(
            Opts::new(
                "kadapter_task_exits_total",
                "Supervised task exits by outcome",
            ),
            &["task", "outcome"],
        )?;

        registry.register(Box::new(config_updates.clone()))?;
        registry.register(Box::new(config_apply_failures.clone()))?;
        registry.register(Box::new(diagnostics_enabled.clone()))?;
        registry.register(Box::new(task_exits.clone()))?;

        Ok(AdapterMetrics {
            registry,
            config_updates,
            config_apply_failures,
            diagnostics_enabled,
            task_exits,
        })
    }

    pub fn record_config_update(&self, record: &str) {
        self.config_updates.with_label_values(&[record]).inc();
    }

    pub fn record_config_apply_failure(&self, record: &str) {
        self.config_apply_failures.with_label_values(&[record]).inc();
    }

    pub fn set_diagnostics_enabled(&self, enabled: bool) {
        self.diagnostics_enabled.set(i64::from(enabled));
    }

    /// `outcome` is one of "stopped", "failed", "panicked", "aborted"
    pub fn record_task_exit(&self, task: &str, outcome: &str) {
        self.task_exits.with_label_values(&[task, outcome]).inc();
    }

    pub fn config_updates(&self, record: &str) -> u64 {
        self.config_updates.with_label_values(&[record]).get()
    }

    pub fn config_apply_failures(&self, record: &str) -> u64 {
        self.config_apply_failures.with_label_values(&[record]).get()
    }

    pub fn task_exits(&self, task: &str, outcome: &str) -> u64 {
        self.task_exits.with_label_values(&[task, outcome]).get()
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(AdapterMetrics::new()?))
}
