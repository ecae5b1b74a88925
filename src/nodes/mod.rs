//! Concrete stage nodes
//!
//! - **Source**: pulls frames from a capture device
//! - **Engine**: runs inference on the newest frame
//! - **Postprocess**: formats `(prediction, frame)` pairs into bytes
//!
//! Capture drivers, models and image codecs are plugged in through the
//! [`CaptureDevice`], [`Detector`] / [`InferenceEngine`] and [`FrameEncoder`]
//! traits.

pub mod engine;
pub mod postprocess;
pub mod source;

pub use engine::{
    BoundingBox, Detection, Detector, EngineNode, InferenceEngine, LabelMap, LabeledDetector,
};
pub use postprocess::{
    DetectionFlattener, DetectionOverlay, ELEMENTS_PER_DETECTION, FrameEncoder, Postprocess,
    PostprocessNode, PpmEncoder,
};
pub use source::{CaptureDevice, SourceNode, TestPatternCamera};
