//! Runtime support for latest-value streaming stages

pub mod broadcast;
pub mod clock;
pub mod errors;
pub mod frame;
pub mod node;
pub mod pipeline;
pub mod receiver;
pub mod stage;
pub mod watchdog;

pub use broadcast::{BroadcastChannel, Latest, ListenerHandle};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use errors::{WorkError, WorkResult};
pub use frame::{Frame, Inference, PixelFormat};
pub use node::StageNode;
pub use pipeline::{PayloadSink, Pipeline, PipelineBuilder, PipelineReader, Transport};
pub use receiver::Receiver;
pub use stage::{Stage, StageEvent, StageSettings, StageState, StopReason};
pub use watchdog::Watchdog;
