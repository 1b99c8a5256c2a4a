//! Supervision of the service, diagnostics and config-watch tasks
//!
//! All tasks share one shutdown latch. The supervisor wakes on the latch or
//! on the first task to finish, raises the latch if it was a failure, then
//! gives every remaining task `grace_period` to stop before aborting it.
//!
//! ```text
//! Idle ──run──▶ Running ──signal / failure──▶ Draining ──▶ Stopped
//!                  └──────── failure, nothing left to drain ──────▶ Stopped
//! ```

use super::Service;
use crate::error::AdapterError;
use crate::server::metrics::SharedMetrics;
use crate::server::{DiagnosticsServer, ShutdownController};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

/// Task name of the pluggable service
pub const SERVICE_TASK: &str = "service";

/// Task name of the diagnostics listener owner
pub const DIAGNOSTICS_TASK: &str = "diagnostics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

enum TaskExit {
    Finished(anyhow::Result<()>),
    Panicked(String),
}

type TaskOutput = (String, TaskExit);

pub struct ServiceSupervisor {
    grace_period: Duration,
    extra: Vec<(String, BoxFuture<'static, anyhow::Result<()>>)>,
    metrics: Option<SharedMetrics>,
    state: watch::Sender<SupervisorState>,
}

impl ServiceSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        ServiceSupervisor {
            grace_period,
            extra: Vec::new(),
            metrics: None,
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Supervise an additional task alongside the service and diagnostics
    ///
    /// The future must return once the shutdown latch it observes is raised.
    pub fn with_task<F>(mut self, name: &str, task: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.extra.push((name.to_string(), task.boxed()));
        self
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run every task until shutdown, then drain within the grace period
    ///
    /// Returns `Ok(())` for a signal-initiated shutdown in which every task
    /// stopped in time. The returned future is `Send` and can be spawned.
    pub async fn run(
        self,
        service: Arc<dyn Service>,
        diagnostics: DiagnosticsServer,
        shutdown: ShutdownController,
    ) -> Result<(), AdapterError> {
        // Owned parts only: nothing borrowed from `self` lives across an await
        let ServiceSupervisor {
            grace_period,
            extra,
            metrics,
            state,
        } = self;
        let metrics = metrics.as_ref();

        let mut signal = shutdown.signal();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut running: BTreeSet<String> = BTreeSet::new();

        let service_signal = signal.clone();
        spawn_named(&mut tasks, &mut running, SERVICE_TASK, async move {
            service.start(service_signal).await
        });
        let diagnostics_signal = signal.clone();
        spawn_named(
            &mut tasks,
            &mut running,
            DIAGNOSTICS_TASK,
            diagnostics.run(diagnostics_signal),
        );
        for (name, task) in extra {
            spawn_named(&mut tasks, &mut running, &name, task);
        }

        state.send_replace(SupervisorState::Running);
        info!(tasks = ?running, "Supervised tasks started");

        let mut failure: Option<AdapterError> = None;
        tokio::select! {
            _ = signal.wait() => {
                info!("Shutdown requested, stopping supervised tasks");
            }
            Some(joined) = tasks.join_next() => {
                let (name, outcome) = settle(joined, &mut running, metrics);
                if shutdown.is_shutdown() {
                    info!(task = %name, "Task stopped after shutdown was requested");
                } else {
                    let reason = match outcome {
                        Ok(()) => "exited unexpectedly".to_string(),
                        Err(reason) => reason,
                    };
                    error!(task = %name, reason = %reason, "Supervised task failed, shutting down");
                    failure = Some(AdapterError::TaskFailure { task: name, reason });
                }
            }
        }

        shutdown.shutdown();

        if running.is_empty() {
            state.send_replace(SupervisorState::Stopped);
            return failure.map_or(Ok(()), Err);
        }

        state.send_replace(SupervisorState::Draining);
        let drained = tokio::time::timeout(grace_period, async {
            while let Some(joined) = tasks.join_next().await {
                let (name, outcome) = settle(joined, &mut running, metrics);
                match outcome {
                    Ok(()) => info!(task = %name, "Task stopped"),
                    Err(reason) => warn!(task = %name, reason = %reason, "Task stopped with error"),
                }
            }
        })
        .await;

        let result = match drained {
            Ok(()) => failure.map_or(Ok(()), Err),
            Err(_) => {
                let pending: Vec<String> = running.iter().cloned().collect();
                error!(
                    grace_ms = grace_period.as_millis() as u64,
                    pending = ?pending,
                    "Tasks did not stop within the grace period, aborting"
                );
                tasks.abort_all();
                if let Some(metrics) = metrics {
                    for name in &pending {
                        metrics.record_task_exit(name, "aborted");
                    }
                }
                Err(AdapterError::ShutdownTimeout {
                    grace: grace_period,
                    pending,
                })
            }
        };

        state.send_replace(SupervisorState::Stopped);
        if result.is_ok() {
            info!("All supervised tasks stopped");
        }
        result
    }
}

/// Record a joined task and flatten its outcome to a failure reason
fn settle(
    joined: Result<TaskOutput, JoinError>,
    running: &mut BTreeSet<String>,
    metrics: Option<&SharedMetrics>,
) -> (String, Result<(), String>) {
    let (name, outcome, label) = match joined {
        Ok((name, TaskExit::Finished(Ok(())))) => (name, Ok(()), "stopped"),
        Ok((name, TaskExit::Finished(Err(e)))) => (name, Err(format!("{:#}", e)), "failed"),
        Ok((name, TaskExit::Panicked(message))) => {
            (name, Err(format!("panicked: {}", message)), "panicked")
        }
        // Tasks are only cancelled through abort_all, after which nothing is joined
        Err(e) => (String::from("unknown"), Err(e.to_string()), "aborted"),
    };
    running.remove(&name);
    if let Some(metrics) = metrics {
        metrics.record_task_exit(&name, label);
    }
    (name, outcome)
}

fn spawn_named<F>(
    tasks: &mut JoinSet<TaskOutput>,
    running: &mut BTreeSet<String>,
    name: &str,
    task: F,
) where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let owned = name.to_string();
    running.insert(owned.clone());
    tasks.spawn(async move {
        let exit = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(result) => TaskExit::Finished(result),
            Err(payload) => TaskExit::Panicked(panic_message(payload.as_ref())),
        };
        (owned, exit)
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
