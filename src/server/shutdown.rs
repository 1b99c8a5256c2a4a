//! Latched shutdown broadcast
//!
//! A single `ShutdownController` feeds every `ShutdownSignal`. It is raised
//! either by an OS termination signal or by the supervisor on the first task
//! failure. Once raised it stays raised; raising it again is a no-op.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Receiving side of the shutdown latch
///
/// Cheap to clone; every clone observes the same latch.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown signal
    pub async fn wait(&mut self) {
        // Wait until the value becomes true
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Check if shutdown was signaled (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Raising side of the shutdown latch
#[derive(Clone)]
pub struct ShutdownController {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    /// Raise the latch
    ///
    /// Returns `true` only for the call that actually raised it, so
    /// concurrent callers can tell which one owns the shutdown sequence.
    pub fn shutdown(&self) -> bool {
        let raised = self.sender.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });
        if raised {
            info!("Shutdown signal sent");
        }
        raised
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// New receiver observing this latch
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Create a new shutdown latch
///
/// Returns (controller, signal) where:
/// - controller: Used to trigger shutdown
/// - signal: Cloned and passed to components that need to listen
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        ShutdownController {
            sender: Arc::new(sender),
        },
        ShutdownSignal { receiver },
    )
}

/// Wait for SIGTERM or SIGINT signal
///
/// Returns the signal name that was received, or an error if the
/// handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C signal (Windows)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}

/// Raise `controller` when a termination signal arrives
///
/// Registration failures are logged and leave the latch untouched.
pub fn forward_os_signals(controller: ShutdownController) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                info!(signal = name, "Initiating graceful shutdown");
                controller.shutdown();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to register signal handlers");
            }
        }
    })
}
