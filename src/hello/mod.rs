//! Hello-world service run by the `kadapter` binary
//!
//! Serves `GET /hello` on port 8080 behind the probe and kubelet healthz
//! middleware, and drains within `DRAIN_TIMEOUT` once stopped.

pub mod middleware;

pub use middleware::{
    always_healthy, is_kubelet_probe, kubelet_healthz_middleware, probe_middleware, HealthCheck,
    ProbeConfig, KUBELET_PROBE_PREFIX, PROBE_HEADER,
};

use crate::adapter::{Service, ServiceContext};
use crate::error::AdapterError;
use crate::server::ShutdownSignal;
use anyhow::Context;
use async_trait::async_trait;
use axum::{
    http::{HeaderName, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Body of `GET /hello`
pub const HELLO_MESSAGE: &str = "Hello World!";

pub const DEFAULT_HELLO_PORT: u16 = 8080;

/// Time allowed for in-flight requests after stop
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_NAME: &str = "NAME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloConfig {
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

impl HelloConfig {
    /// `NAME` is required, the namespace comes from the boot configuration
    pub fn from_lookup<F>(lookup: F, namespace: &str) -> Result<Self, AdapterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup(ENV_NAME)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                AdapterError::InvalidConfiguration(format!(
                    "required environment variable {} is not set",
                    ENV_NAME
                ))
            })?;
        Ok(HelloConfig {
            name,
            namespace: namespace.to_string(),
            port: DEFAULT_HELLO_PORT,
        })
    }
}

pub struct HelloService {
    config: HelloConfig,
    probe: Arc<ProbeConfig>,
    health: HealthCheck,
}

impl HelloService {
    pub fn new(config: HelloConfig) -> Self {
        HelloService {
            config,
            probe: Arc::new(ProbeConfig::new(
                HeaderName::from_static(PROBE_HEADER),
                "hello",
            )),
            health: always_healthy(),
        }
    }

    /// Constructor handed to `Bootstrap`
    pub fn from_context(ctx: ServiceContext) -> Result<Self, AdapterError> {
        let config = HelloConfig::from_lookup(|key| std::env::var(key).ok(), &ctx.boot.namespace)?;
        Ok(Self::new(config))
    }

    pub fn with_health_check(mut self, health: HealthCheck) -> Self {
        self.health = health;
        self
    }

    pub fn router(&self) -> Router {
        hello_router(self.probe.clone(), self.health.clone())
    }
}

pub fn hello_router(probe: Arc<ProbeConfig>, health: HealthCheck) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .fallback(not_found)
        .layer(from_fn_with_state(probe, probe_middleware))
        .layer(from_fn_with_state(health, kubelet_healthz_middleware))
}

async fn hello() -> &'static str {
    HELLO_MESSAGE
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[async_trait]
impl Service for HelloService {
    async fn start(&self, stop: ShutdownSignal) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("{} server failed to bind {}", self.config.name, addr))?;

        info!(
            name = %self.config.name,
            namespace = %self.config.namespace,
            addr = %addr,
            "Starting hello server"
        );

        let mut graceful = stop.clone();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { graceful.wait().await })
            .into_future();
        tokio::pin!(server);

        let mut stop = stop;
        let finished = tokio::select! {
            result = &mut server => Some(result),
            _ = stop.wait() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                info!("Stop requested, draining hello server");
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                    Ok(result) => result,
                    Err(_) => anyhow::bail!(
                        "{} server did not drain within {:?}",
                        self.config.name,
                        DRAIN_TIMEOUT
                    ),
                }
            }
        };
        result.with_context(|| format!("{} server failed", self.config.name))?;

        info!("Hello server shut down");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "hello_test.rs"]
mod hello_tests;
