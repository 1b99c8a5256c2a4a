//! Tests for the diagnostics listener
//!
//! Servers are created with port 0 and addressed through the bound
//! address published in `ListenerState`.

use super::diagnostics::*;
use super::metrics::create_metrics;
use super::shutdown::shutdown_channel;
use crate::config::{ConfigObserver, ConfigRecord};
use crate::error::AdapterError;
use crate::logging::LogLevelState;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;

fn observability(enable: &str) -> ConfigRecord {
    ConfigRecord::new("config-observability", "ns").with_entry("profiling.enable", enable)
}

async fn wait_running(rx: &mut watch::Receiver<ListenerState>) -> SocketAddr {
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_running()))
        .await
        .expect("listener did not start in time")
        .expect("state channel closed");
    match *state {
        ListenerState::Running(addr) => addr,
        ListenerState::Stopped => unreachable!(),
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<ListenerState>) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.is_running()))
        .await
        .expect("listener did not stop in time")
        .expect("state channel closed");
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", addr.port(), path)
}

async fn get(addr: SocketAddr, path: &str) -> reqwest::Result<reqwest::Response> {
    reqwest::Client::new()
        .get(url(addr, path))
        .timeout(Duration::from_secs(2))
        .send()
        .await
}

#[tokio::test]
async fn test_apply_parses_enable_flag() {
    let server = DiagnosticsServer::new("c", "p", 8008);
    assert!(!server.desired().enabled);

    server.apply(&observability("true")).await.unwrap();
    assert_eq!(
        server.desired(),
        DiagnosticsSettings {
            enabled: true,
            port: 8008
        }
    );

    server.apply(&observability("0")).await.unwrap();
    assert!(!server.desired().enabled);
}

#[tokio::test]
async fn test_apply_missing_flag_disables() {
    let server = DiagnosticsServer::new("c", "p", 8008);
    server.apply(&observability("true")).await.unwrap();

    server
        .apply(&ConfigRecord::new("config-observability", "ns"))
        .await
        .unwrap();

    assert!(!server.desired().enabled);
}

#[tokio::test]
async fn test_apply_rejects_bad_values_and_keeps_previous() {
    let server = DiagnosticsServer::new("c", "p", 8008);
    server.apply(&observability("true")).await.unwrap();

    let err = server.apply(&observability("maybe")).await.unwrap_err();
    assert!(matches!(err, AdapterError::InvalidConfigFormat { .. }));

    let bad_port = observability("true").with_entry("profiling.port", "99999");
    assert!(server.apply(&bad_port).await.is_err());

    assert_eq!(
        server.desired(),
        DiagnosticsSettings {
            enabled: true,
            port: 8008
        }
    );
}

#[tokio::test]
async fn test_port_override_is_read() {
    let server = DiagnosticsServer::new("c", "p", 8008);

    server
        .apply(&observability("true").with_entry("profiling.port", "18018"))
        .await
        .unwrap();

    assert_eq!(server.desired().port, 18018);
}

/// enable -> reachable, disable -> refused, enable -> reachable again
#[tokio::test]
async fn test_listener_follows_enable_disable_enable() {
    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", 0);
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    server.apply(&observability("true")).await.unwrap();
    let addr = wait_running(&mut state).await;
    let response = get(addr, "/debug/pprof/").await.unwrap();
    assert_eq!(response.status(), 200);

    server.apply(&observability("false")).await.unwrap();
    wait_stopped(&mut state).await;
    assert!(
        get(addr, "/debug/pprof/").await.is_err(),
        "disabled listener must refuse connections"
    );

    server.apply(&observability("true")).await.unwrap();
    let addr = wait_running(&mut state).await;
    let response = get(addr, "/debug/pprof/").await.unwrap();
    assert_eq!(response.status(), 200);

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.state(), ListenerState::Stopped);
    assert!(get(addr, "/debug/pprof/").await.is_err());
}

/// Settings applied before the task starts are honoured at startup
#[tokio::test]
async fn test_run_starts_with_last_known_settings() {
    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", 0);
    server.apply(&observability("true")).await.unwrap();

    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    let addr = wait_running(&mut state).await;
    assert_eq!(get(addr, "/debug/pprof/").await.unwrap().status(), 200);

    controller.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", 0);
    server.apply(&observability("true")).await.unwrap();
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    let addr = wait_running(&mut state).await;
    let response = get(addr, "/debug/nothing-here").await.unwrap();
    assert_eq!(response.status(), 404);

    controller.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_vars_and_metrics_routes() {
    let (controller, signal) = shutdown_channel();
    let metrics = create_metrics().unwrap();
    metrics.record_config_update("config-observability");
    let server = DiagnosticsServer::new("mycomponent", "pod-1", 0)
        .with_metrics(metrics.clone())
        .with_log_level(LogLevelState::default());
    server.apply(&observability("true")).await.unwrap();
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    let addr = wait_running(&mut state).await;

    let vars: serde_json::Value = get(addr, "/debug/vars").await.unwrap().json().await.unwrap();
    assert_eq!(vars["component"], "mycomponent");
    assert_eq!(vars["pod"], "pod-1");
    assert_eq!(vars["log_level"], "INFO");

    let body = get(addr, "/metrics").await.unwrap().text().await.unwrap();
    assert!(body.contains("kadapter_config_updates_total"));
    assert!(body.contains("kadapter_diagnostics_enabled 1"));

    let tasks = get(addr, "/debug/pprof/tasks").await.unwrap().text().await.unwrap();
    assert!(tasks.contains("workers:"));

    controller.shutdown();
    task.await.unwrap().unwrap();
    assert!(metrics
        .encode()
        .unwrap()
        .contains("kadapter_diagnostics_enabled 0"));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_heap_route_reports_process_memory() {
    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", 0);
    server.apply(&observability("true")).await.unwrap();
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    let addr = wait_running(&mut state).await;
    let response = get(addr, "/debug/pprof/heap").await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("VmRSS"));

    controller.shutdown();
    task.await.unwrap().unwrap();
}

#[test]
fn test_cpu_ticks_skip_command_name() {
    let stat = "4242 (hello world) S 1 4242 4242 0 -1 4194560 1500 0 0 0 37 12 0 0 20 0 9 0";

    assert_eq!(cpu_ticks(stat), Some((37, 12)));
    assert_eq!(cpu_ticks("4242 (truncated) S 1"), None);
    assert_eq!(cpu_ticks("no command name"), None);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_profile_route_reports_cpu_ticks() {
    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", 0);
    server.apply(&observability("true")).await.unwrap();
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    let addr = wait_running(&mut state).await;
    let response = get(addr, "/debug/pprof/profile?seconds=0").await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("seconds: 0\n"));
    assert!(body.contains("user_ticks: "));
    assert!(body.contains("system_ticks: "));

    let index = get(addr, "/debug/pprof/").await.unwrap().text().await.unwrap();
    assert!(index.contains("/debug/pprof/profile"));

    controller.shutdown();
    task.await.unwrap().unwrap();
}

/// A port that cannot be bound leaves the listener stopped without failing the task
#[tokio::test]
async fn test_bind_failure_is_not_fatal() {
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let (controller, signal) = shutdown_channel();
    let server = DiagnosticsServer::new("c", "p", taken);
    let mut state = server.subscribe_state();
    let task = tokio::spawn(server.clone().run(signal));

    server.apply(&observability("true")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state(), ListenerState::Stopped);
    assert!(!task.is_finished());

    // Moving to a free port recovers
    server
        .apply(&observability("true").with_entry("profiling.port", "0"))
        .await
        .unwrap();
    wait_running(&mut state).await;

    controller.shutdown();
    task.await.unwrap().unwrap();
    drop(blocker);
}
