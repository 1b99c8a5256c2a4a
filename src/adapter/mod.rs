//! Adapter lifecycle: version gate, dynamic configuration, supervision
//!
//! `Bootstrap::run` is the single entry point:
//! 1. Waits for the API server to satisfy the minimum Kubernetes version
//! 2. Registers the log level and diagnostics observers
//! 3. Starts the ConfigMap watch (initial values are applied before it returns)
//! 4. Builds the pluggable `Service` and supervises it together with the
//!    diagnostics listener and the watch task until shutdown

pub mod supervisor;
pub mod version;

pub use supervisor::{ServiceSupervisor, SupervisorState, DIAGNOSTICS_TASK, SERVICE_TASK};
pub use version::{
    await_minimum_version, check_minimum_version, KubeVersion, VersionError, VersionSource,
};

use crate::config::{BootConfig, ConfigStore, DynamicConfigSource, KubeConfigStore, RetryPolicy};
use crate::error::AdapterError;
use crate::logging::{adapter_span, LogLevelController, LogLevelState};
use crate::server::metrics::{create_metrics, SharedMetrics};
use crate::server::{forward_os_signals, shutdown_channel, DiagnosticsServer, ShutdownController};
use crate::server::ShutdownSignal;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Task name of the ConfigMap watch
pub const CONFIG_WATCH_TASK: &str = "config-watch";

/// The pluggable business component
///
/// `start` serves until `stop` fires, then shuts its listeners down and
/// returns. Returning before `stop` fires is treated as a failure.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn start(&self, stop: ShutdownSignal) -> anyhow::Result<()>;
}

/// What a service constructor gets to work with
#[derive(Clone)]
pub struct ServiceContext {
    pub component: String,
    pub boot: BootConfig,
    pub log_level: LogLevelState,
}

/// Composes the version gate, config source and supervisor
pub struct Bootstrap {
    component: String,
    boot: BootConfig,
    log_level: LogLevelState,
    metrics: Option<SharedMetrics>,
    retry: RetryPolicy,
}

impl Bootstrap {
    pub fn new(component: &str, boot: BootConfig) -> Self {
        Bootstrap {
            component: component.to_string(),
            boot,
            log_level: LogLevelState::default(),
            metrics: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Threshold shared with the installed subscriber
    pub fn with_log_level(mut self, level: LogLevelState) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bring the adapter up and run it until shutdown
    ///
    /// Fatal errors are logged once with the failing stage before being returned.
    pub async fn run<V, S, F>(
        self,
        versions: &V,
        store: Arc<dyn ConfigStore>,
        ctor: F,
        shutdown: ShutdownController,
    ) -> Result<(), AdapterError>
    where
        V: VersionSource + ?Sized,
        S: Service,
        F: FnOnce(ServiceContext) -> Result<S, AdapterError>,
    {
        let span = adapter_span(&self.component, &self.boot.pod_name);
        let result = self
            .run_inner(versions, store, ctor, shutdown)
            .instrument(span.clone())
            .await;

        if let Err(e) = &result {
            span.in_scope(|| error!(stage = e.stage(), error = %e, "Adapter failed"));
        }
        result
    }

    async fn run_inner<V, S, F>(
        self,
        versions: &V,
        store: Arc<dyn ConfigStore>,
        ctor: F,
        shutdown: ShutdownController,
    ) -> Result<(), AdapterError>
    where
        V: VersionSource + ?Sized,
        S: Service,
        F: FnOnce(ServiceContext) -> Result<S, AdapterError>,
    {
        let boot = &self.boot;
        info!(
            namespace = %boot.namespace,
            minimum_version = %boot.kubernetes_min_version,
            logging_config = %boot.logging_config_map,
            observability_config = %boot.observability_config_map,
            "Starting adapter"
        );

        // We sometimes start faster than we can reach the API server
        await_minimum_version(
            versions,
            &boot.kubernetes_min_version,
            boot.version_poll_interval,
            boot.version_timeout,
        )
        .await?;

        let mut diagnostics = DiagnosticsServer::new(
            &self.component,
            &boot.pod_name,
            boot.diagnostics_port,
        )
        .with_log_level(self.log_level.clone());
        let mut source = DynamicConfigSource::new(store).with_retry(self.retry);
        if let Some(metrics) = &self.metrics {
            diagnostics = diagnostics.with_metrics(metrics.clone());
            source = source.with_metrics(metrics.clone());
        }

        source.watch(
            &boot.logging_config_map,
            Arc::new(LogLevelController::new(
                &self.component,
                self.log_level.clone(),
            )),
        );
        source.watch(&boot.observability_config_map, Arc::new(diagnostics.clone()));

        let watch_task = source.start(shutdown.signal()).await?;

        let service = ctor(ServiceContext {
            component: self.component.clone(),
            boot: boot.clone(),
            log_level: self.log_level.clone(),
        })?;
        info!("Starting service");

        let mut supervisor =
            ServiceSupervisor::new(boot.shutdown_grace).with_task(CONFIG_WATCH_TASK, watch_task);
        if let Some(metrics) = &self.metrics {
            supervisor = supervisor.with_metrics(metrics.clone());
        }

        supervisor
            .run(Arc::new(service), diagnostics, shutdown)
            .await?;
        info!("Adapter shut down gracefully");
        Ok(())
    }
}

/// Run `ctor`'s service against the cluster `client` talks to
///
/// Reads `BootConfig` from the environment, watches ConfigMaps in
/// `SYSTEM_NAMESPACE` and shuts down on SIGTERM/SIGINT.
pub async fn main_with_client<S, F>(
    component: &str,
    client: kube::Client,
    log_level: LogLevelState,
    ctor: F,
) -> Result<(), AdapterError>
where
    S: Service,
    F: FnOnce(ServiceContext) -> Result<S, AdapterError>,
{
    let boot = match BootConfig::from_env() {
        Ok(boot) => boot,
        Err(e) => {
            error!(stage = e.stage(), error = %e, "Adapter failed");
            return Err(e);
        }
    };

    let store = Arc::new(KubeConfigStore::new(client.clone(), &boot.namespace));
    info!(namespace = store.namespace(), "Watching ConfigMaps");
    let (controller, _signal) = shutdown_channel();
    let signals = forward_os_signals(controller.clone());

    let mut bootstrap = Bootstrap::new(component, boot).with_log_level(log_level);
    match create_metrics() {
        Ok(metrics) => bootstrap = bootstrap.with_metrics(metrics),
        Err(e) => warn!(error = %e, "Metrics registry unavailable, continuing without metrics"),
    }

    let result = bootstrap.run(&client, store, ctor, controller).await;
    signals.abort();
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "version_test.rs"]
mod version_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "supervisor_test.rs"]
mod supervisor_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "bootstrap_test.rs"]
mod bootstrap_tests;
