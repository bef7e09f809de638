//! Periodic device re-scan for the deploy stage.

use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

pub const MIN_SCAN_INTERVAL_MS: u64 = 500;
pub const MAX_SCAN_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 3_000;

type ScanFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Fires a scan callback at a fixed interval while the deploy stage is
/// active. A tick that lands while the previous scan is still running is
/// skipped instead of queueing; restarting with a new interval atomically
/// replaces the running timer.
pub struct AutoScanTimer {
    scan: ScanFn,
    in_flight: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoScanTimer {
    pub fn new<F, Fut>(scan: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            scan: Arc::new(move || Box::pin(scan()) as Pin<Box<dyn Future<Output = ()> + Send>>),
            in_flight: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn clamp_interval(interval_ms: u64) -> u64 {
        interval_ms.clamp(MIN_SCAN_INTERVAL_MS, MAX_SCAN_INTERVAL_MS)
    }

    /// Start or restart the timer with the given interval.
    pub fn start(&self, interval_ms: u64) {
        let interval_ms = Self::clamp_interval(interval_ms);
        let scan = Arc::clone(&self.scan);
        let in_flight = Arc::clone(&self.in_flight);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick so a restart does not scan
            // right away on top of a scan the old timer just ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if in_flight.swap(true, Ordering::AcqRel) {
                    debug!("scan tick skipped: previous scan still in flight");
                    continue;
                }
                let pending = scan();
                let flag = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    pending.await;
                    flag.store(false, Ordering::Release);
                });
            }
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        let previous = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = previous {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for AutoScanTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
