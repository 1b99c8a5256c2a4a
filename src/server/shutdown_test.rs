//! Tests for the shutdown latch

use super::shutdown::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Test that shutdown channel works correctly
#[tokio::test]
async fn test_shutdown_channel_initially_not_shutdown() {
    let (controller, signal) = shutdown_channel();

    assert!(!signal.is_shutdown());
    assert!(!controller.is_shutdown());
}

/// Test that shutdown can be triggered
#[tokio::test]
async fn test_shutdown_channel_triggers_shutdown() {
    let (controller, signal) = shutdown_channel();

    assert!(!signal.is_shutdown());

    assert!(controller.shutdown());

    assert!(signal.is_shutdown());
    assert!(controller.is_shutdown());
}

/// Test that wait completes when shutdown is triggered
#[tokio::test]
async fn test_shutdown_wait_completes_on_signal() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;

    assert!(
        result.is_ok(),
        "wait() should complete when shutdown triggered"
    );
    assert!(signal.is_shutdown());
}

/// Test that wait returns immediately once the latch is already raised
#[tokio::test]
async fn test_wait_after_shutdown_returns_immediately() {
    let (controller, _signal) = shutdown_channel();
    controller.shutdown();

    let mut late = controller.signal();
    let result = tokio::time::timeout(Duration::from_millis(100), late.wait()).await;

    assert!(result.is_ok(), "late subscribers must observe the latch");
}

/// Test that cloned signals all receive shutdown
#[tokio::test]
async fn test_shutdown_signal_clones_share_state() {
    let (controller, signal) = shutdown_channel();
    let signal2 = signal.clone();
    let signal3 = controller.signal();

    assert!(!signal.is_shutdown());
    assert!(!signal2.is_shutdown());
    assert!(!signal3.is_shutdown());

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(signal2.is_shutdown());
    assert!(signal3.is_shutdown());
}

/// Raising the latch twice concurrently yields exactly one owner
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_shutdown_latches_once() {
    let (controller, _signal) = shutdown_channel();
    let owners = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let controller = controller.clone();
        let owners = owners.clone();
        handles.push(tokio::spawn(async move {
            if controller.shutdown() {
                owners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(owners.load(Ordering::SeqCst), 1);
    assert!(!controller.shutdown(), "re-raising must be a no-op");
}
