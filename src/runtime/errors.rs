//! Error types for the runtime system

/// Error type for stage work functions
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Capture device error: {0}")]
    Capture(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Node-specific error: {0}")]
    NodeError(String),

    #[error("Shutdown signal received")]
    Shutdown,
}

impl WorkError {
    /// Whether this error ends the stream cleanly rather than as a fault
    pub fn is_shutdown(&self) -> bool {
        matches!(self, WorkError::Shutdown)
    }
}

/// Result type for work functions
pub type WorkResult<T = ()> = Result<T, WorkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_classification() {
        assert!(WorkError::Shutdown.is_shutdown());
        assert!(!WorkError::Capture("gone".into()).is_shutdown());
        assert_eq!(
            WorkError::Inference("bad tensor".into()).to_string(),
            "Inference error: bad tensor"
        );
    }
}
