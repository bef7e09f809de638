use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::Notify;

use crate::scanner::{AutoScanTimer, MAX_SCAN_INTERVAL_MS, MIN_SCAN_INTERVAL_MS};

#[test]
fn interval_is_clamped_to_the_allowed_range() {
    assert_eq!(AutoScanTimer::clamp_interval(10), MIN_SCAN_INTERVAL_MS);
    assert_eq!(AutoScanTimer::clamp_interval(3_000), 3_000);
    assert_eq!(AutoScanTimer::clamp_interval(60_000), MAX_SCAN_INTERVAL_MS);
}

#[tokio::test(start_paused = true)]
async fn ticks_invoke_the_scan_callback() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let timer = AutoScanTimer::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    timer.start(1_000);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    timer.stop();

    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn an_in_flight_scan_suppresses_the_next_tick() {
    let count = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let counter = Arc::clone(&count);
    let gate = Arc::clone(&release);
    let timer = AutoScanTimer::new(move || {
        let counter = Arc::clone(&counter);
        let gate = Arc::clone(&gate);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
        }
    });

    timer.start(1_000);
    // Three intervals pass while the first scan is still blocked.
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    timer.stop();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn restart_replaces_the_running_timer() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let timer = AutoScanTimer::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    timer.start(1_000);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Restarting with a slower interval starts a fresh schedule.
    timer.start(10_000);
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    timer.stop();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_halts_future_ticks() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let timer = AutoScanTimer::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    timer.start(1_000);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    timer.stop();
    assert!(!timer.is_running());

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
