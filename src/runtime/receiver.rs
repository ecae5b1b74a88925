//! Pull-side consumer of a stage
//!
//! A [`Receiver`] owns one listener registration on a stage's broadcast channel.
//! Every `recv()` counts as demand: it resets the stage's idle timer and, if
//! the stage had stopped for inactivity, starts it again before waiting.

use std::sync::Arc;
use tracing::{error, trace};

use super::broadcast::{Latest, ListenerHandle};
use super::errors::{WorkError, WorkResult};
use super::stage::StageShared;
use super::watchdog::{WaitGuard, WatchdogHandle};

/// Handle for pulling the newest values out of a stage
///
/// Each receiver is a distinct listener: two receivers on the same stage each
/// see every publish they wait for. Dropping the receiver unregisters it.
pub struct Receiver<T: Send + Sync + 'static> {
    stage: Arc<StageShared<T>>,
    handle: ListenerHandle,
    watchdog: Option<WatchdogHandle>,
}

impl<T: Send + Sync + 'static> Receiver<T> {
    pub(crate) fn new(stage: Arc<StageShared<T>>) -> Self {
        let handle = stage.channel.register();
        let watchdog = stage
            .watchdog
            .as_ref()
            .map(|watchdog| watchdog.register_listener(stage.name(), handle.id()));
        Self {
            stage,
            handle,
            watchdog,
        }
    }

    /// Block until the stage publishes a value this receiver has not seen yet
    ///
    /// Returns `Err(WorkError::Shutdown)` once the stage has closed (end of
    /// stream or fault).
    pub fn recv(&mut self) -> WorkResult<Latest<T>> {
        // Touch first, then resume: the stage takes its idle decision under the
        // state lock, so either it sees this access or we see it `Idle`.
        self.stage.channel.touch();
        if let Err(e) = self.stage.resume() {
            error!("[{}] Failed to resume stage: {}", self.stage.name(), e);
            return Err(WorkError::NodeError(e.to_string()));
        }

        let _guard = self.watchdog.as_ref().map(WaitGuard::new);
        let item = self.stage.channel.recv(&self.handle)?;
        trace!(
            "[{}] Listener {} received #{}",
            self.stage.name(),
            self.handle.id(),
            item.seq
        );
        Ok(item)
    }

    /// Newest value without waiting
    pub fn try_latest(&self) -> Option<Latest<T>> {
        self.stage.channel.latest()
    }

    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }

    pub fn listener_id(&self) -> u64 {
        self.handle.id()
    }
}

impl<T: Send + Sync + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.stage.channel.unregister(&self.handle);
    }
}
