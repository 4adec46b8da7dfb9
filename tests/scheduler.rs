mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, harness, key, wait_until, PanicOnceUploader, ScriptedUploader};
use tag_uplink::{AppLifecycle, SyncConfig, SyncScheduler};

const PATIENCE: Duration = Duration::from_secs(5);

fn quick_timer(ms: u64) -> SyncConfig {
    SyncConfig {
        flush_interval_ms: ms,
        ..config()
    }
}

#[tokio::test]
async fn flushes_when_connectivity_returns() {
    let uploader = ScriptedUploader::new();
    let h = harness(config(), uploader.clone(), false);
    for t in 1..=3u64 {
        h.enqueue(t, key("org", Some("s1"))).await;
    }

    let scheduler = SyncScheduler::spawn(h.engine.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(uploader.call_count(), 0);

    h.connectivity.set_reachable(true);
    assert!(h.wait_for_depth(0, PATIENCE).await);
    assert_eq!(uploader.call_count(), 1);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn timer_flushes_while_online_and_foreground() {
    let uploader = ScriptedUploader::new();
    let h = harness(quick_timer(40), uploader.clone(), true);
    let scheduler = SyncScheduler::spawn(h.engine.clone());

    // Let the startup flush see an empty queue first.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.enqueue(1, key("org", None)).await;

    assert!(wait_until(PATIENCE, || uploader.call_count() == 1).await);
    assert!(h.wait_for_depth(0, PATIENCE).await);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn background_pauses_timer_and_foreground_flushes_backlog() {
    let uploader = ScriptedUploader::new();
    let h = harness(quick_timer(30), uploader.clone(), true);
    let scheduler = SyncScheduler::spawn(h.engine.clone());

    scheduler.set_lifecycle(AppLifecycle::Background).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.enqueue(1, key("org", None)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(uploader.call_count(), 0, "timer must not fire in background");

    scheduler.set_lifecycle(AppLifecycle::Foreground).await.unwrap();
    assert!(h.wait_for_depth(0, PATIENCE).await);
    assert_eq!(uploader.call_count(), 1);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_request_flushes_immediately() {
    let uploader = ScriptedUploader::new();
    let h = harness(quick_timer(3_600_000), uploader.clone(), true);
    let scheduler = SyncScheduler::spawn(h.engine.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.enqueue(1, key("org", None)).await;
    h.enqueue(2, key("org", None)).await;
    scheduler.request_flush().await.unwrap();

    assert!(h.wait_for_depth(0, PATIENCE).await);
    assert_eq!(uploader.calls()[0].events.len(), 2);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn requests_while_offline_do_nothing() {
    let uploader = ScriptedUploader::new();
    let h = harness(config(), uploader.clone(), false);
    h.enqueue(1, key("org", None)).await;
    let scheduler = SyncScheduler::spawn(h.engine.clone());

    scheduler.request_flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(uploader.call_count(), 0);
    assert_eq!(h.depth().await, 1);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn keeps_scheduling_after_a_flush_task_panics() {
    let uploader = Arc::new(PanicOnceUploader::default());
    let h = harness(quick_timer(3_600_000), uploader.clone(), false);
    h.enqueue(1, key("org", None)).await;
    h.enqueue(2, key("org", None)).await;
    let scheduler = SyncScheduler::spawn(h.engine.clone());

    h.connectivity.set_reachable(true);
    assert!(wait_until(PATIENCE, || uploader.call_count() == 1).await);
    assert_eq!(h.depth().await, 2);

    // The panicked flush released the single-flight slot, so a later
    // request delivers the backlog.
    let mut delivered = false;
    for _ in 0..50 {
        scheduler.request_flush().await.unwrap();
        if h.wait_for_depth(0, Duration::from_millis(100)).await {
            delivered = true;
            break;
        }
    }
    assert!(delivered);
    assert!(!h.engine.is_flushing());

    scheduler.shutdown().await.unwrap();
}
