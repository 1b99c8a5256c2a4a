use kadapter::hello::HelloService;
use kadapter::logging::{init_logging, LogLevelState};
use kadapter::{main_with_client, AdapterError};
use kube::Client;
use std::process::ExitCode;
use tracing::{error, info};

/// Component name used for log fields and the `loglevel.<component>` key
const COMPONENT: &str = "hello-world";

/// Map the adapter result to the process exit status
///
/// Failures were already logged with their stage, so nothing is printed here.
fn exit_code(result: Result<(), AdapterError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // The kube client's rustls stack needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let level = LogLevelState::default();
    init_logging(&level)?;

    info!(component = COMPONENT, "Starting adapter process");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(stage = "configuration", error = %e, "Failed to create Kubernetes client");
            return Ok(ExitCode::FAILURE);
        }
    };

    Ok(exit_code(
        main_with_client(COMPONENT, client, level, HelloService::from_context).await,
    ))
}

#[cfg(test)]
#[path = "main_test.rs"]
mod main_tests;
