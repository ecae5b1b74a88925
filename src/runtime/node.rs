//! Node trait for stage work
//!
//! Defines the StageNode trait that every source, engine and postprocessor
//! implements. The owning [`Stage`](super::Stage) calls `produce()` in a loop on
//! its background thread and publishes each result.

// Re-export error types for convenience
pub use super::errors::{WorkError, WorkResult};

/// A unit of work that yields one value per call
/// - Sources pull from a capture device
/// - Engines pull from an upstream stage and run inference
/// - Postprocessors pull from the engine stage and format the result
pub trait StageNode: Send {
    type Output: Send + Sync + 'static;

    /// Get a debug name for this node
    fn name(&self) -> &str;

    /// Produce the next value, blocking as long as needed
    ///
    /// `Err(WorkError::Shutdown)` ends the stage cleanly; any other error is
    /// a fatal fault that stops the stage and closes its channel.
    fn produce(&mut self) -> WorkResult<Self::Output>;

    /// Returns true if this node pushes its output somewhere on its own and so
    /// must keep running without pull-side listeners.
    /// If false (default), the stage stops once nobody has asked for data
    /// within the idle timeout.
    fn keeps_alive(&self) -> bool {
        false
    }
}

impl<N: StageNode + ?Sized> StageNode for Box<N> {
    type Output = N::Output;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn produce(&mut self) -> WorkResult<Self::Output> {
        (**self).produce()
    }

    fn keeps_alive(&self) -> bool {
        (**self).keeps_alive()
    }
}
