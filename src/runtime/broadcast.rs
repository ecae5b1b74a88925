//! Latest-value broadcast channel
//!
//! Single producer, any number of consumers. Each consumer holds a
//! [`ListenerHandle`] obtained from [`BroadcastChannel::register`] and passes it
//! back into `wait`/`clear`/`recv`. The channel never queues: every publish
//! replaces the stored value and signals every registered listener once, so a
//! slow consumer simply skips values instead of building backlog.
//!
//! Bookkeeping per listener is a binary signal plus the time it was last
//! signalled. A registration is created lazily on the first `wait`. A listener
//! whose signal stays set-but-unread for longer than the eviction window is
//! treated as gone and dropped on the next publish.
//!
//! The channel also tracks when any listener last asked for data. The owning
//! stage reads [`BroadcastChannel::idle`] to decide whether to stop producing.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::{SharedClock, system_clock};
use super::errors::{WorkError, WorkResult};

/// Signalled-but-unread time after which a listener is evicted
pub const DEFAULT_EVICTION_WINDOW: Duration = Duration::from_secs(5);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Explicit per-consumer registration token
///
/// Not `Clone`: one handle is one listener. Pass it back into the channel it
/// was issued by.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    channel_id: u64,
}

impl ListenerHandle {
    /// Listener id, unique within its channel
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A published value together with its producer-assigned sequence number
#[derive(Debug)]
pub struct Latest<T> {
    /// Strictly increasing per channel, starting at 1
    pub seq: u64,
    /// Shared read-only snapshot; copy it if you need to mutate
    pub value: Arc<T>,
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Deref for Latest<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

struct Registration {
    signaled: bool,
    last_signaled: Instant,
}

struct ChannelState<T> {
    listeners: HashMap<u64, Registration>,
    latest: Option<Latest<T>>,
    next_seq: u64,
    /// Last time any listener called `wait`
    last_access: Instant,
    closed: bool,
}

/// Single-producer / multi-consumer "newest value" notification primitive
pub struct BroadcastChannel<T> {
    id: u64,
    name: String,
    state: Mutex<ChannelState<T>>,
    signal: Condvar,
    clock: SharedClock,
    eviction_window: Duration,
    next_listener: AtomicU64,
}

impl<T> BroadcastChannel<T> {
    /// Create a channel on the system clock with the default eviction window
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, system_clock(), DEFAULT_EVICTION_WINDOW)
    }

    /// Create a channel with an explicit clock and eviction window
    pub fn with_clock(name: impl Into<String>, clock: SharedClock, eviction_window: Duration) -> Self {
        let now = clock.now();
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(ChannelState {
                listeners: HashMap::new(),
                latest: None,
                next_seq: 0,
                last_access: now,
                closed: false,
            }),
            signal: Condvar::new(),
            clock,
            eviction_window,
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_handle(&self, handle: &ListenerHandle) -> WorkResult<()> {
        if handle.channel_id != self.id {
            return Err(WorkError::NodeError(format!(
                "listener {} was not issued by channel '{}'",
                handle.id, self.name
            )));
        }
        Ok(())
    }

    /// Issue a new listener handle
    ///
    /// The registration itself is created on the first `wait`, so a listener
    /// only starts receiving signals once it actually asks for data.
    pub fn register(&self) -> ListenerHandle {
        ListenerHandle {
            id: self.next_listener.fetch_add(1, Ordering::Relaxed),
            channel_id: self.id,
        }
    }

    /// Drop a listener's registration explicitly
    pub fn unregister(&self, handle: &ListenerHandle) {
        if handle.channel_id == self.id {
            self.lock().listeners.remove(&handle.id);
        }
    }

    /// Block until this listener is signalled, returning with the lock held
    fn wait_locked(&self, handle: &ListenerHandle) -> WorkResult<MutexGuard<'_, ChannelState<T>>> {
        self.check_handle(handle)?;
        let mut state = self.lock();
        state.last_access = self.clock.now();

        loop {
            if state.closed {
                return Err(WorkError::Shutdown);
            }

            let now = self.clock.now();
            let signaled = state
                .listeners
                .entry(handle.id)
                .or_insert_with(|| {
                    debug!("[{}] New listener {}", self.name, handle.id);
                    Registration {
                        signaled: false,
                        last_signaled: now,
                    }
                })
                .signaled;
            if signaled {
                return Ok(state);
            }

            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the next publish after this listener was registered or last cleared
    ///
    /// Returns `Err(WorkError::Shutdown)` once the channel has been closed.
    pub fn wait(&self, handle: &ListenerHandle) -> WorkResult<()> {
        self.wait_locked(handle).map(drop)
    }

    /// Re-arm this listener for the next publish
    pub fn clear(&self, handle: &ListenerHandle) {
        if handle.channel_id != self.id {
            return;
        }
        if let Some(registration) = self.lock().listeners.get_mut(&handle.id) {
            registration.signaled = false;
        }
    }

    /// Wait, clear and read the newest value as one atomic step
    ///
    /// Because publish stores the value and raises the signals under the same
    /// lock, a listener never reads a value whose signal it has not consumed,
    /// and never observes the same sequence number twice.
    pub fn recv(&self, handle: &ListenerHandle) -> WorkResult<Latest<T>> {
        let mut state = self.wait_locked(handle)?;
        if let Some(registration) = state.listeners.get_mut(&handle.id) {
            registration.signaled = false;
        }
        state
            .latest
            .clone()
            .ok_or_else(|| WorkError::NodeError(format!("[{}] signalled without a value", self.name)))
    }

    /// Store a new value and signal every registered listener once
    ///
    /// Listeners whose previous signal is still unread keep it; if it has been
    /// unread for longer than the eviction window they are removed. Never blocks
    /// beyond the internal lock.
    pub fn publish(&self, value: T) -> u64 {
        let now = self.clock.now();
        let eviction_window = self.eviction_window;
        let mut state = self.lock();

        state.next_seq += 1;
        let seq = state.next_seq;
        state.latest = Some(Latest {
            seq,
            value: Arc::new(value),
        });

        let name = &self.name;
        state.listeners.retain(|id, registration| {
            if !registration.signaled {
                registration.signaled = true;
                registration.last_signaled = now;
                true
            } else if now.saturating_duration_since(registration.last_signaled) > eviction_window {
                debug!(
                    "[{}] Evicting listener {} (signal unread for {:.1}s)",
                    name,
                    id,
                    now.saturating_duration_since(registration.last_signaled).as_secs_f64()
                );
                false
            } else {
                true
            }
        });
        trace!("[{}] Published #{} to {} listeners", name, seq, state.listeners.len());
        drop(state);

        self.signal.notify_all();
        seq
    }

    /// Newest value without waiting or touching any registration
    pub fn latest(&self) -> Option<Latest<T>> {
        self.lock().latest.clone()
    }

    /// Time since any listener last called `wait`
    pub fn idle(&self) -> Duration {
        let last_access = self.lock().last_access;
        self.clock.now().saturating_duration_since(last_access)
    }

    /// `idle()` in fractional seconds
    pub fn idle_seconds(&self) -> f64 {
        self.idle().as_secs_f64()
    }

    /// Reset the idle timer as if a listener had just asked for data
    pub fn touch(&self) {
        self.lock().last_access = self.clock.now();
    }

    /// Close the channel, releasing every blocked waiter with `Shutdown`
    pub fn close(&self) {
        self.lock().closed = true;
        self.signal.notify_all();
    }

    /// Re-open a closed channel (used when its stage is restarted)
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live registrations
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl<T> fmt::Debug for BroadcastChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BroadcastChannel[{}]", self.name)
    }
}
