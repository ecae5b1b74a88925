//! Real-time streaming core for edge inference pipelines
//!
//! This library chains capture → inference → postprocessing → transport through
//! independently running background stages, and ships fixed-size result frames to
//! a remote microcontroller over a half-duplex serial link.
//!
//! # Architecture
//!
//! - **BroadcastChannel**: Latest-value notification primitive. Every registered
//!   listener is signalled on each publish; slow listeners skip values instead of
//!   building backlog.
//! - **Stage**: One background thread per stage, publishing through its own
//!   BroadcastChannel and stopping itself once nobody has asked for data for a while.
//! - **Pipeline**: Source → Engine → Postprocessor plus any number of Transports,
//!   started in that fixed order.
//! - **SerialLinkSession**: Handshake / heartbeat / framed-transfer state machine over
//!   a byte-oriented link with one auxiliary ready line.
//!
//! # Example
//!
//! ```no_run
//! use edgestream::config::PipelineConfig;
//! use edgestream::nodes::{DetectionFlattener, LabeledDetector, TestPatternCamera};
//! use edgestream::runtime::PipelineBuilder;
//! # use edgestream::nodes::{Detection, Detector};
//! # use edgestream::runtime::{Frame, WorkResult};
//! # struct Model;
//! # impl Detector for Model {
//! #     fn detect(&mut self, _frame: &Frame) -> WorkResult<Vec<Detection>> { Ok(Vec::new()) }
//! # }
//!
//! let config = PipelineConfig::default();
//! let mut pipeline = PipelineBuilder::new(config.clone())
//!     .source(TestPatternCamera::new(320, 240))
//!     .engine(LabeledDetector::from_config(Model, &config.engine)?)
//!     .postprocessor(DetectionFlattener::new(config.engine.top_k))
//!     .build()?;
//! pipeline.start()?;
//!
//! let mut reader = pipeline.reader();
//! let bytes = reader.get_output_bytes()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use thiserror::Error;

pub mod config;
pub mod link;
pub mod nodes;
pub mod runtime;

// Re-export link types
pub use link::{
    LinkError, LinkPort, LinkSettings, LinkState, LinkStatus, PayloadFormat, SerialLinkSession,
    SignalLine, SimulatedPeripheral,
};

// Re-export data types from runtime
pub use runtime::{Frame, Inference, Latest, PixelFormat};

// Re-export streaming runtime components
pub use runtime::{
    BroadcastChannel, Clock, ListenerHandle, ManualClock, Pipeline, PipelineBuilder,
    PipelineReader, Receiver, Stage, StageEvent, StageNode, StageState, SystemClock, Transport,
    WorkError, WorkResult,
};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Stage error: {0}")]
    Work(#[from] WorkError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
