//! Introspection HTTP listener driven by the observability ConfigMap
//!
//! - `/debug/pprof/` - Index of the diagnostics routes
//! - `/debug/pprof/heap` - Process memory figures from `/proc/self/status`
//! - `/debug/pprof/profile` - CPU time consumed over `?seconds=N` (default 1, max 30)
//! - `/debug/pprof/tasks` - Tokio runtime worker and task counts
//! - `/debug/vars` - Identity, uptime and current log level as JSON
//! - `/metrics` - Prometheus metrics in text format
//!
//! `apply` only records the desired settings. The task returned by `run`
//! is the single owner of the listener and binds, stops or restarts it
//! whenever the desired settings change.

use crate::config::{ConfigObserver, ConfigRecord};
use crate::error::AdapterError;
use crate::logging::LogLevelState;
use crate::server::metrics::SharedMetrics;
use crate::server::ShutdownSignal;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observability key toggling the listener
pub const PROFILING_ENABLE_KEY: &str = "profiling.enable";

/// Observability key overriding the listener port
pub const PROFILING_PORT_KEY: &str = "profiling.port";

/// How long a disabled listener may take to drain before it is aborted
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a CPU profile sampling window
const MAX_PROFILE_SECONDS: u64 = 30;

/// `USER_HZ`, the unit of the CPU times in `/proc/<pid>/stat`
const CLOCK_TICKS_PER_SECOND: u64 = 100;

/// Desired listener configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSettings {
    pub enabled: bool,
    pub port: u16,
}

/// Actual listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Running(SocketAddr),
}

impl ListenerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ListenerState::Running(_))
    }
}

#[derive(Clone)]
struct DiagnosticsContext {
    component: String,
    pod: String,
    started_at: DateTime<Utc>,
    started: Instant,
    log_level: Option<LogLevelState>,
    metrics: Option<SharedMetrics>,
}

/// Best-effort diagnostics listener
#[derive(Clone)]
pub struct DiagnosticsServer {
    default_port: u16,
    desired: Arc<watch::Sender<DiagnosticsSettings>>,
    state: Arc<watch::Sender<ListenerState>>,
    context: DiagnosticsContext,
}

impl DiagnosticsServer {
    /// Create a disabled server that will listen on `default_port` once enabled
    pub fn new(component: &str, pod: &str, default_port: u16) -> Self {
        let (desired, _) = watch::channel(DiagnosticsSettings {
            enabled: false,
            port: default_port,
        });
        let (state, _) = watch::channel(ListenerState::Stopped);
        DiagnosticsServer {
            default_port,
            desired: Arc::new(desired),
            state: Arc::new(state),
            context: DiagnosticsContext {
                component: component.to_string(),
                pod: pod.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
                log_level: None,
                metrics: None,
            },
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.context.metrics = Some(metrics);
        self
    }

    pub fn with_log_level(mut self, level: LogLevelState) -> Self {
        self.context.log_level = Some(level);
        self
    }

    /// Last settings accepted from configuration
    pub fn desired(&self) -> DiagnosticsSettings {
        *self.desired.borrow()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn parse_settings(&self, record: &ConfigRecord) -> Result<DiagnosticsSettings, AdapterError> {
        let enabled = match record.get(PROFILING_ENABLE_KEY).filter(|v| !v.is_empty()) {
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                AdapterError::invalid_format(
                    &record.name,
                    format!("{} must be a boolean, got {:?}", PROFILING_ENABLE_KEY, raw),
                )
            })?,
            None => false,
        };
        let port = match record.get(PROFILING_PORT_KEY).filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse::<u16>().map_err(|e| {
                AdapterError::invalid_format(
                    &record.name,
                    format!("{} must be a port number, got {:?}: {}", PROFILING_PORT_KEY, raw, e),
                )
            })?,
            None => self.default_port,
        };
        Ok(DiagnosticsSettings { enabled, port })
    }

    /// Own the listener until `signal` fires
    ///
    /// Starts in whatever state the last applied configuration asked for.
    pub async fn run(self, mut signal: ShutdownSignal) -> anyhow::Result<()> {
        let mut desired = self.desired.subscribe();
        let mut listener: Option<RunningListener> = None;

        loop {
            let want = *desired.borrow_and_update();
            listener = self.reconcile(listener, want).await;

            tokio::select! {
                _ = signal.wait() => break,
                changed = desired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(running) = listener {
            running.stop().await;
        }
        self.publish(ListenerState::Stopped);
        info!("Diagnostics server shut down");
        Ok(())
    }

    async fn reconcile(
        &self,
        current: Option<RunningListener>,
        want: DiagnosticsSettings,
    ) -> Option<RunningListener> {
        match current {
            Some(running) if want.enabled && running.port == want.port => Some(running),
            Some(running) => {
                running.stop().await;
                self.publish(ListenerState::Stopped);
                if want.enabled {
                    info!(port = want.port, "Restarting diagnostics server on new port");
                    self.start(want.port).await
                } else {
                    info!("Diagnostics server disabled");
                    None
                }
            }
            None if want.enabled => self.start(want.port).await,
            None => None,
        }
    }

    async fn start(&self, port: u16) -> Option<RunningListener> {
        let listener = match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
            Ok(l) => l,
            Err(e) => {
                warn!(port = port, error = %e, "Failed to bind diagnostics server");
                return None;
            }
        };
        let addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!(port = port, error = %e, "Failed to read diagnostics server address");
                return None;
            }
        };

        let (stop, stopped) = oneshot::channel::<()>();
        let app = build_router(self.context.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });

        info!(addr = %addr, "Diagnostics server listening");
        self.publish(ListenerState::Running(addr));
        Some(RunningListener { port, stop, handle })
    }

    fn publish(&self, state: ListenerState) {
        if let Some(metrics) = &self.context.metrics {
            metrics.set_diagnostics_enabled(state.is_running());
        }
        self.state.send_replace(state);
    }
}

#[async_trait]
impl ConfigObserver for DiagnosticsServer {
    fn name(&self) -> &str {
        "diagnostics"
    }

    async fn apply(&self, record: &ConfigRecord) -> Result<(), AdapterError> {
        let settings = self.parse_settings(record)?;
        let changed = self.desired.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        if changed {
            info!(
                enabled = settings.enabled,
                port = settings.port,
                "Diagnostics settings updated"
            );
        } else {
            debug!(enabled = settings.enabled, "Diagnostics settings unchanged");
        }
        Ok(())
    }
}

struct RunningListener {
    port: u16,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl RunningListener {
    async fn stop(self) {
        let _ = self.stop.send(());
        let mut handle = self.handle;
        match tokio::time::timeout(LISTENER_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(Ok(()))) => debug!("Diagnostics listener drained"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Diagnostics listener failed"),
            Ok(Err(e)) => warn!(error = %e, "Diagnostics listener task aborted"),
            Err(_) => {
                warn!("Diagnostics listener did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

/// Parse a boolean the way the observability ConfigMap spells it
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn build_router(context: DiagnosticsContext) -> Router {
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/heap", get(heap))
        .route("/debug/pprof/profile", get(profile))
        .route("/debug/pprof/tasks", get(tasks))
        .route("/debug/vars", get(vars))
        .route("/metrics", get(metrics))
        .with_state(context)
}

async fn index() -> &'static str {
    "/debug/pprof/heap\n/debug/pprof/profile\n/debug/pprof/tasks\n/debug/vars\n/metrics\n"
}

/// Memory figures of the current process
async fn heap() -> impl IntoResponse {
    match tokio::fs::read_to_string("/proc/self/status").await {
        Ok(status) => {
            let body: String = status
                .lines()
                .filter(|line| line.starts_with("Vm") || line.starts_with("Rss"))
                .map(|line| format!("{}\n", line))
                .collect();
            (StatusCode::OK, body).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Memory statistics unavailable: {}", e),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
}

/// User and system CPU time of the process, in clock ticks
///
/// Fields are counted after the parenthesized command name, which may
/// itself contain spaces.
pub(crate) fn cpu_ticks(stat: &str) -> Option<(u64, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime = fields.next()?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

async fn read_cpu_ticks() -> Result<(u64, u64), String> {
    let stat = tokio::fs::read_to_string("/proc/self/stat")
        .await
        .map_err(|e| e.to_string())?;
    cpu_ticks(&stat).ok_or_else(|| "malformed /proc/self/stat".to_string())
}

/// CPU time consumed by the process over a sampling window
async fn profile(Query(params): Query<ProfileParams>) -> impl IntoResponse {
    let seconds = params.seconds.unwrap_or(1).min(MAX_PROFILE_SECONDS);
    let sample = async {
        let (user_before, system_before) = read_cpu_ticks().await?;
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        let (user_after, system_after) = read_cpu_ticks().await?;
        Ok::<_, String>((
            user_after.saturating_sub(user_before),
            system_after.saturating_sub(system_before),
        ))
    };
    match sample.await {
        Ok((user, system)) => (
            StatusCode::OK,
            format!(
                "seconds: {}\nuser_ticks: {}\nsystem_ticks: {}\nticks_per_second: {}\n",
                seconds, user, system, CLOCK_TICKS_PER_SECOND
            ),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("CPU statistics unavailable: {}", e),
        )
            .into_response(),
    }
}

async fn tasks() -> String {
    let metrics = tokio::runtime::Handle::current().metrics();
    format!(
        "workers: {}\nalive_tasks: {}\n",
        metrics.num_workers(),
        metrics.num_alive_tasks()
    )
}

#[derive(Debug, Serialize)]
struct Vars {
    component: String,
    pod: String,
    started_at: DateTime<Utc>,
    uptime_seconds: u64,
    log_level: Option<String>,
}

async fn vars(State(context): State<DiagnosticsContext>) -> Json<Vars> {
    Json(Vars {
        component: context.component.clone(),
        pod: context.pod.clone(),
        started_at: context.started_at,
        uptime_seconds: context.started.elapsed().as_secs(),
        log_level: context.log_level.as_ref().map(|l| l.get().to_string()),
    })
}

/// Prometheus metrics handler
async fn metrics(State(context): State<DiagnosticsContext>) -> impl IntoResponse {
    let Some(metrics) = context.metrics else {
        return (StatusCode::NOT_FOUND, "Metrics not configured".to_string()).into_response();
    };
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}
