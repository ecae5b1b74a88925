//! Consumer watchdog for detecting stalled stages
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each receiver stores the start time of its current blocking wait in an
//! atomic, and the watchdog periodically scans these timestamps. A wait that
//! outlives the threshold usually means the upstream stage has died.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Default time a wait may block before it is reported
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single listener's wait tracking
struct WaitState {
    /// Timestamp (ms since epoch) when the current wait started, or 0 if idle
    wait_start: AtomicU64,
    /// Track if we've already warned about this wait
    has_warned: AtomicBool,
    stage: String,
    listener: u64,
}

/// Handle to a listener's watchdog state (held by receivers)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<WaitState>,
}

impl WatchdogHandle {
    /// Mark the start of a blocking wait
    #[inline(always)]
    pub fn start_wait(&self) {
        self.state.wait_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of a blocking wait
    #[inline(always)]
    pub fn finish_wait(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!(
                "UNBLOCKED: listener {} on stage '{}'",
                self.state.listener, self.state.stage
            );
        }
        self.state.wait_start.store(0, Ordering::Relaxed);
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    waits: Arc<Mutex<Vec<Weak<WaitState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_STALL_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            waits: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    /// Register a listener for monitoring
    pub fn register_listener(&self, stage: &str, listener: u64) -> WatchdogHandle {
        let state = Arc::new(WaitState {
            wait_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            stage: stage.to_string(),
            listener,
        });

        self.waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Scan for waits blocked past the threshold, returning how many are stalled
    pub fn check_for_stalls(&self) -> usize {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;
        let mut stalled = 0;

        let mut waits = self.waits.lock().unwrap_or_else(PoisonError::into_inner);

        // Remove dead weak references and check live ones
        waits.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.wait_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms {
                    stalled += 1;
                    // Only warn once per blocked wait
                    if !state.has_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            "STALLED: listener {} on stage '{}' waiting for {:.1}s",
                            state.listener,
                            state.stage,
                            duration_ms as f64 / 1000.0
                        );
                    }
                }
            }
            true
        });

        stalled
    }

    /// Number of live monitored listeners
    pub fn monitored(&self) -> usize {
        self.waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Start the watchdog monitoring thread
    pub fn start_monitoring_thread(&self) -> std::io::Result<JoinHandle<()>> {
        let watchdog = self.clone();
        std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                while watchdog.enabled.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    watchdog.check_for_stalls();
                }
            })
    }

    /// Stop the watchdog monitoring thread
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking a wait - just two atomic stores
pub struct WaitGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> WaitGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_wait();
        Self { handle }
    }
}

impl Drop for WaitGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_wait();
    }
}
