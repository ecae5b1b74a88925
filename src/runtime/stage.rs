//! Thread-per-stage execution
//!
//! A [`Stage`] wraps a [`StageNode`] in a background loop:
//!
//! 1. `produce()` the next value (blocking as long as the node needs)
//! 2. store it as the current value and signal every listener
//! 3. stop if nobody has asked for data within the idle timeout
//!
//! ## Lifecycle
//!
//! `Inert` → `start()` → `Running` → one of
//! - `Idle`: stopped for lack of listeners; `start()` or a [`Receiver`] pulling
//!   from it spawns a fresh loop
//! - `Closed`: the node ended its stream with `WorkError::Shutdown`
//! - `Faulted`: the node returned a fatal error or panicked; the channel is
//!   closed so blocked consumers get `Shutdown`, and the fault is kept for the
//!   owner to inspect
//!
//! There is no external stop signal. Stages end on their own.

use super::broadcast::{BroadcastChannel, DEFAULT_EVICTION_WINDOW, Latest};
use super::clock::{SharedClock, system_clock};
use super::errors::WorkError;
use super::node::StageNode;
use super::receiver::Receiver;
use super::watchdog::Watchdog;
use crate::StreamError;
use crossbeam_channel::Sender as CrossbeamSender;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Time without any listener asking for data before a stage stops itself
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a stage's background loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Inert,
    Running,
    Idle,
    Closed,
    Faulted,
}

/// Why a stage loop exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Shutdown,
    Fault(String),
}

/// Lifecycle notification sent to the stage's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Started {
        stage: String,
    },
    Stopped {
        stage: String,
        reason: StopReason,
        produced: u64,
    },
}

/// Construction options for a stage
#[derive(Clone)]
pub struct StageSettings {
    pub idle_timeout: Duration,
    pub eviction_window: Duration,
    pub clock: SharedClock,
    pub events: Option<CrossbeamSender<StageEvent>>,
    pub watchdog: Option<Watchdog>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            eviction_window: DEFAULT_EVICTION_WINDOW,
            clock: system_clock(),
            events: None,
            watchdog: None,
        }
    }
}

impl StageSettings {
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_eviction_window(mut self, eviction_window: Duration) -> Self {
        self.eviction_window = eviction_window;
        self
    }

    pub fn with_events(mut self, events: CrossbeamSender<StageEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}

type BoxedNode<T> = Box<dyn StageNode<Output = T>>;

pub(crate) struct StageShared<T: Send + Sync + 'static> {
    name: String,
    pub(crate) channel: BroadcastChannel<T>,
    node: Mutex<BoxedNode<T>>,
    state: Mutex<StageState>,
    fault: Mutex<Option<String>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    idle_timeout: Duration,
    events: Option<CrossbeamSender<StageEvent>>,
    pub(crate) watchdog: Option<Watchdog>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T: Send + Sync + 'static> StageShared<T> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, event: StageEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Spawn the loop if it is not running (or, with `only_if_idle`, only if it
    /// stopped for inactivity). Returns whether a loop was spawned.
    fn launch(self: &Arc<Self>, only_if_idle: bool) -> Result<bool, StreamError> {
        let mut state = lock(&self.state);
        match *state {
            StageState::Running => return Ok(false),
            StageState::Idle => {}
            _ if only_if_idle => return Ok(false),
            _ => {}
        }

        // The previous loop set a non-running state as one of its last acts
        if let Some(previous) = lock(&self.thread).take() {
            let _ = previous.join();
        }

        self.channel.reopen();
        self.channel.touch();
        *lock(&self.fault) = None;

        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || shared.run())
            .map_err(|e| StreamError::Spawn(format!("stage '{}': {}", self.name, e)))?;

        *state = StageState::Running;
        *lock(&self.thread) = Some(handle);
        drop(state);

        info!("[{}] Stage started", self.name);
        self.emit(StageEvent::Started {
            stage: self.name.clone(),
        });
        Ok(true)
    }

    /// Restart a stage that stopped for inactivity
    pub(crate) fn resume(self: &Arc<Self>) -> Result<bool, StreamError> {
        self.launch(true)
    }

    /// Idle decision is taken under the state lock so that a receiver which
    /// touched the channel afterwards is guaranteed to see `Idle` and restart us.
    fn stop_if_idle(&self) -> bool {
        let mut state = lock(&self.state);
        let idle = self.channel.idle();
        if idle > self.idle_timeout {
            info!(
                "[{}] Stopping due to inactivity ({:.1}s without listeners)",
                self.name,
                idle.as_secs_f64()
            );
            *state = StageState::Idle;
            true
        } else {
            false
        }
    }

    fn run(self: Arc<Self>) {
        let mut produced = 0u64;

        let reason = {
            let mut node = lock(&self.node);
            loop {
                match panic::catch_unwind(AssertUnwindSafe(|| node.produce())) {
                    Ok(Ok(value)) => {
                        let seq = self.channel.publish(value);
                        produced += 1;
                        debug!("[{}] Published #{}", self.name, seq);
                    }
                    Ok(Err(WorkError::Shutdown)) => {
                        info!("[{}] End of stream", self.name);
                        break StopReason::Shutdown;
                    }
                    Ok(Err(e)) => {
                        error!("[{}] Work error: {}", self.name, e);
                        break StopReason::Fault(e.to_string());
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("[{}] Node panicked: {}", self.name, message);
                        break StopReason::Fault(format!("node panicked: {}", message));
                    }
                }

                if !node.keeps_alive() && self.stop_if_idle() {
                    break StopReason::Idle;
                }
            }
        };

        info!("[{}] Shutdown. Produced {} items.", self.name, produced);

        match &reason {
            StopReason::Idle => {}
            StopReason::Shutdown => {
                self.channel.close();
                *lock(&self.state) = StageState::Closed;
            }
            StopReason::Fault(message) => {
                *lock(&self.fault) = Some(message.clone());
                self.channel.close();
                *lock(&self.state) = StageState::Faulted;
            }
        }

        self.emit(StageEvent::Stopped {
            stage: self.name.clone(),
            reason,
            produced,
        });
    }
}

/// A background loop plus the broadcast channel it publishes on
///
/// Cheap to clone; clones refer to the same stage.
pub struct Stage<T: Send + Sync + 'static> {
    shared: Arc<StageShared<T>>,
}

impl<T: Send + Sync + 'static> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> Stage<T> {
    /// Create an inert stage with default settings
    pub fn new<N>(node: N) -> Self
    where
        N: StageNode<Output = T> + 'static,
    {
        Self::with_settings(node, StageSettings::default())
    }

    /// Create an inert stage
    pub fn with_settings<N>(node: N, settings: StageSettings) -> Self
    where
        N: StageNode<Output = T> + 'static,
    {
        let name = node.name().to_string();
        let channel = BroadcastChannel::with_clock(
            name.clone(),
            Arc::clone(&settings.clock),
            settings.eviction_window,
        );
        Self {
            shared: Arc::new(StageShared {
                name,
                channel,
                node: Mutex::new(Box::new(node)),
                state: Mutex::new(StageState::Inert),
                fault: Mutex::new(None),
                thread: Mutex::new(None),
                idle_timeout: settings.idle_timeout,
                events: settings.events,
                watchdog: settings.watchdog,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Spawn the background loop unless it is already running
    ///
    /// Idempotent: returns `Ok(false)` if a loop was already running. A stage
    /// that stopped (idle, closed or faulted) gets a fresh loop.
    pub fn start(&self) -> Result<bool, StreamError> {
        self.shared.launch(false)
    }

    pub fn state(&self) -> StageState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == StageState::Running
    }

    /// Message of the fatal error that stopped the stage, if any
    pub fn fault(&self) -> Option<String> {
        lock(&self.shared.fault).clone()
    }

    /// Register a new pull-side consumer
    pub fn subscribe(&self) -> Receiver<T> {
        Receiver::new(Arc::clone(&self.shared))
    }

    /// The stage's broadcast channel
    pub fn channel(&self) -> &BroadcastChannel<T> {
        &self.shared.channel
    }

    /// Most recently published value, without waiting
    pub fn latest(&self) -> Option<Latest<T>> {
        self.shared.channel.latest()
    }

    /// Block until the current loop (if any) has exited
    pub fn join(&self) {
        let handle = lock(&self.shared.thread).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("[{}] Stage thread panicked", self.shared.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;
    use crate::runtime::errors::WorkResult;
    use std::time::Instant;

    struct CountingSource {
        count: u32,
        max: u32,
    }

    impl StageNode for CountingSource {
        type Output = u32;

        fn name(&self) -> &str {
            "counting_source"
        }

        fn produce(&mut self) -> WorkResult<u32> {
            if self.count >= self.max {
                return Err(WorkError::Shutdown);
            }
            thread::sleep(Duration::from_millis(1));
            self.count += 1;
            Ok(self.count)
        }
    }

    struct FailingSource {
        remaining: u32,
    }

    impl StageNode for FailingSource {
        type Output = u32;

        fn name(&self) -> &str {
            "failing_source"
        }

        fn produce(&mut self) -> WorkResult<u32> {
            thread::sleep(Duration::from_millis(1));
            if self.remaining == 0 {
                return Err(WorkError::Capture("device disappeared".to_string()));
            }
            self.remaining -= 1;
            Ok(self.remaining)
        }
    }

    struct PanickingSource {
        calls: u32,
    }

    impl StageNode for PanickingSource {
        type Output = u32;

        fn name(&self) -> &str {
            "panicking_source"
        }

        fn produce(&mut self) -> WorkResult<u32> {
            thread::sleep(Duration::from_millis(1));
            self.calls += 1;
            if self.calls == 3 {
                panic!("frame buffer too short");
            }
            Ok(self.calls)
        }
    }

    struct PushingSink {
        produced: u32,
        max: u32,
    }

    impl StageNode for PushingSink {
        type Output = u32;

        fn name(&self) -> &str {
            "pushing_sink"
        }

        fn produce(&mut self) -> WorkResult<u32> {
            if self.produced >= self.max {
                return Err(WorkError::Shutdown);
            }
            thread::sleep(Duration::from_millis(1));
            self.produced += 1;
            Ok(self.produced)
        }

        fn keeps_alive(&self) -> bool {
            true
        }
    }

    fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < timeout, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn manual_settings(clock: &ManualClock) -> StageSettings {
        StageSettings::default().with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn test_receiver_sees_increasing_values() {
        let clock = ManualClock::new();
        let stage = Stage::with_settings(
            CountingSource { count: 0, max: 100_000 },
            manual_settings(&clock),
        );
        assert_eq!(stage.state(), StageState::Inert);

        let mut rx = stage.subscribe();
        stage.start().unwrap();

        let mut last = 0;
        for _ in 0..5 {
            let item = rx.recv().unwrap();
            assert!(*item > last);
            last = *item;
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let clock = ManualClock::new();
        let stage = Stage::with_settings(
            CountingSource { count: 0, max: 100_000 },
            manual_settings(&clock),
        );
        assert!(stage.start().unwrap());
        assert!(!stage.start().unwrap());
        assert!(stage.is_running());
    }

    #[test]
    fn test_stage_stops_itself_when_nobody_listens() {
        let clock = ManualClock::new();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stage = Stage::with_settings(
            CountingSource { count: 0, max: u32::MAX },
            manual_settings(&clock).with_events(events_tx),
        );
        stage.start().unwrap();
        assert!(matches!(
            events_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            StageEvent::Started { .. }
        ));

        thread::sleep(Duration::from_millis(20));
        assert!(stage.is_running());

        clock.advance(Duration::from_secs(11));
        wait_until("idle stop", Duration::from_secs(2), || {
            stage.state() == StageState::Idle
        });

        match events_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            StageEvent::Stopped { reason, produced, .. } => {
                assert_eq!(reason, StopReason::Idle);
                assert!(produced > 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(stage.fault().is_none());
    }

    #[test]
    fn test_receiver_resumes_idle_stage() {
        let clock = ManualClock::new();
        let stage = Stage::with_settings(
            CountingSource { count: 0, max: u32::MAX },
            manual_settings(&clock),
        );
        stage.start().unwrap();
        clock.advance(Duration::from_secs(11));
        wait_until("idle stop", Duration::from_secs(2), || {
            stage.state() == StageState::Idle
        });

        let mut rx = stage.subscribe();
        let item = rx.recv().unwrap();
        assert!(*item > 0);
        assert!(stage.is_running());
    }

    #[test]
    fn test_fault_closes_channel_and_is_reported() {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stage = Stage::with_settings(
            FailingSource { remaining: 3 },
            StageSettings::default().with_events(events_tx),
        );
        let mut rx = stage.subscribe();
        stage.start().unwrap();

        let mut result = rx.recv();
        while result.is_ok() {
            result = rx.recv();
        }
        assert!(matches!(result, Err(WorkError::Shutdown)));

        stage.join();
        assert_eq!(stage.state(), StageState::Faulted);
        assert!(stage.fault().unwrap().contains("device disappeared"));

        let stopped = events_rx
            .iter()
            .find(|event| matches!(event, StageEvent::Stopped { .. }))
            .unwrap();
        assert!(matches!(
            stopped,
            StageEvent::Stopped { reason: StopReason::Fault(_), .. }
        ));
    }

    #[test]
    fn test_panicking_node_faults_stage() {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stage = Stage::with_settings(
            PanickingSource { calls: 0 },
            StageSettings::default().with_events(events_tx),
        );
        let mut rx = stage.subscribe();
        stage.start().unwrap();

        let consumer = thread::spawn(move || {
            let mut result = rx.recv();
            while result.is_ok() {
                result = rx.recv();
            }
            result
        });
        wait_until("consumer to see shutdown", Duration::from_secs(2), || {
            consumer.is_finished()
        });
        assert!(matches!(consumer.join().unwrap(), Err(WorkError::Shutdown)));

        stage.join();
        assert_eq!(stage.state(), StageState::Faulted);
        assert!(stage.fault().unwrap().contains("frame buffer too short"));
        assert!(events_rx.try_iter().any(|event| matches!(
            event,
            StageEvent::Stopped { reason: StopReason::Fault(_), .. }
        )));

        // The node lock survived the panic, so the stage restarts
        assert!(stage.start().unwrap());
        wait_until("restarted loop to publish", Duration::from_secs(2), || {
            stage.latest().is_some_and(|item| *item >= 4)
        });
    }

    #[test]
    fn test_keeps_alive_node_ignores_idle_timeout() {
        let clock = ManualClock::new();
        let stage = Stage::with_settings(PushingSink { produced: 0, max: 200 }, manual_settings(&clock));
        stage.start().unwrap();

        clock.advance(Duration::from_secs(30));
        thread::sleep(Duration::from_millis(20));
        assert!(stage.is_running());

        stage.join();
        assert_eq!(stage.state(), StageState::Closed);
        assert!(stage.channel().is_closed());
    }

    #[test]
    fn test_closed_stage_can_be_restarted() {
        let stage = Stage::new(CountingSource { count: 0, max: 3 });
        stage.start().unwrap();
        stage.join();
        assert_eq!(stage.state(), StageState::Closed);

        // Node is exhausted, so the restarted loop closes again straight away
        assert!(stage.start().unwrap());
        stage.join();
        assert_eq!(stage.state(), StageState::Closed);
        assert_eq!(stage.latest().map(|item| *item), Some(3));
    }
}
