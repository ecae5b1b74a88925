//! Inference stage
//!
//! [`EngineNode`] pulls the newest frame from the source stage, runs it through
//! an [`InferenceEngine`] and publishes the prediction together with the frame
//! it was computed from. The engine itself (model loading, accelerator calls)
//! is opaque to the pipeline.
//!
//! The detection types below cover the common SSD-style object detector:
//! a [`Detector`] returns raw candidates and [`LabeledDetector`] applies the
//! configured score threshold, label filter and `top_k` limit.

use crate::config::EngineConfig;
use crate::runtime::frame::{Frame, Inference};
use crate::runtime::node::{StageNode, WorkError, WorkResult};
use crate::runtime::receiver::Receiver;
use crate::{Result, StreamError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Synchronous "frame in, prediction out" call
pub trait InferenceEngine: Send {
    type Prediction: Send + Sync + 'static;

    fn infer(&mut self, frame: &Frame) -> WorkResult<Self::Prediction>;

    /// Upper bound on the number of result entries per prediction, if fixed
    fn max_results(&self) -> Option<usize> {
        None
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    type Prediction = E::Prediction;

    fn infer(&mut self, frame: &Frame) -> WorkResult<Self::Prediction> {
        (**self).infer(frame)
    }

    fn max_results(&self) -> Option<usize> {
        (**self).max_results()
    }
}

/// Stage node running inference on the newest upstream frame
pub struct EngineNode<E> {
    name: String,
    upstream: Receiver<Frame>,
    engine: E,
    inferences: u64,
}

impl<E: InferenceEngine> EngineNode<E> {
    pub fn new(upstream: Receiver<Frame>, engine: E) -> Self {
        Self {
            name: "engine".to_string(),
            upstream,
            engine,
            inferences: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<E: InferenceEngine> StageNode for EngineNode<E> {
    type Output = Inference<E::Prediction>;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&mut self) -> WorkResult<Self::Output> {
        let frame = self.upstream.recv()?;
        let prediction = self.engine.infer(&frame)?;
        self.inferences += 1;
        debug!(
            "[{}] Inference #{} on frame #{}",
            self.name, self.inferences, frame.seq
        );
        Ok(Inference::new(prediction, Arc::clone(&frame.value), frame.seq))
    }
}

/// Axis-aligned box in relative (0..1) image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Same box with every coordinate clamped to `0..=1` (NaN becomes 0)
    pub fn clamped(&self) -> Self {
        fn unit(v: f32) -> f32 {
            if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
        }
        Self::new(unit(self.xmin), unit(self.ymin), unit(self.xmax), unit(self.ymax))
    }

    /// Scale to pixel coordinates `(x0, y0, x1, y1)` for the given resolution
    ///
    /// Coordinates are clamped to the image, so the result always lies in
    /// `0..width` and `0..height`.
    pub fn scaled(&self, width: u32, height: u32) -> (i64, i64, i64, i64) {
        let b = self.clamped();
        let w = width as f32;
        let h = height as f32;
        let max_x = width.saturating_sub(1) as i64;
        let max_y = height.saturating_sub(1) as i64;
        (
            ((b.xmin * w) as i64).min(max_x),
            ((b.ymin * h) as i64).min(max_y),
            ((b.xmax * w) as i64).min(max_x),
            ((b.ymax * h) as i64).min(max_y),
        )
    }
}

/// One object detection candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub label_id: u32,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "label={} score={:.2} box=({:.3}, {:.3})-({:.3}, {:.3})",
            self.label_id, self.score, self.bbox.xmin, self.bbox.ymin, self.bbox.xmax, self.bbox.ymax
        )
    }
}

/// Raw object detector (model invocation)
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> WorkResult<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> WorkResult<Vec<Detection>> {
        (**self).detect(frame)
    }
}

/// Mapping from label id to display text
///
/// Label files contain one `<id> <label text>` entry per line:
///
/// ```text
/// 0  person
/// 1  bicycle
/// 2  traffic light
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    labels: BTreeMap<u32, String>,
}

impl LabelMap {
    pub fn parse(text: &str) -> Result<Self> {
        let mut labels = BTreeMap::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (id, label) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let id = id.parse::<u32>().map_err(|_| {
                StreamError::InvalidConfig(format!(
                    "label file line {}: '{}' is not a label id",
                    line_no + 1,
                    id
                ))
            })?;
            labels.insert(id, label.trim().to_string());
        }
        Ok(Self { labels })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let map = Self::parse(&text)?;
        info!(
            "Loaded {} labels from {}",
            map.len(),
            path.as_ref().display()
        );
        Ok(map)
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.labels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Detector wrapper applying threshold, label filter and `top_k`
///
/// When a label map is present only candidates whose id appears in it are
/// kept, which lets a model trained on many classes report a subset.
pub struct LabeledDetector<D> {
    detector: D,
    labels: Option<Arc<LabelMap>>,
    threshold: f32,
    top_k: usize,
}

impl<D: Detector> LabeledDetector<D> {
    pub fn new(detector: D, top_k: usize, threshold: f32) -> Self {
        Self {
            detector,
            labels: None,
            threshold,
            top_k,
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = Some(Arc::new(labels));
        self
    }

    /// Build from the `engine` section of the pipeline configuration
    ///
    /// A configured label file that does not exist is ignored (no filtering),
    /// a label file that exists but does not parse is an error.
    pub fn from_config(detector: D, config: &EngineConfig) -> Result<Self> {
        if config.top_k == 0 {
            return Err(StreamError::InvalidConfig("engine.top_k must be at least 1".into()));
        }
        let mut labeled = Self::new(detector, config.top_k, config.threshold);
        if let Some(path) = config.label_path.as_deref().filter(|p| !p.is_empty()) {
            if Path::new(path).exists() {
                labeled = labeled.with_labels(LabelMap::load(path)?);
            } else {
                info!("Label file {} not found, reporting raw label ids", path);
            }
        }
        Ok(labeled)
    }

    pub fn labels(&self) -> Option<Arc<LabelMap>> {
        self.labels.clone()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

impl<D: Detector> InferenceEngine for LabeledDetector<D> {
    type Prediction = Vec<Detection>;

    fn infer(&mut self, frame: &Frame) -> WorkResult<Vec<Detection>> {
        let mut detections = self.detector.detect(frame)?;

        for detection in &detections {
            if !detection.score.is_finite() {
                return Err(WorkError::Inference(format!(
                    "detector returned non-finite score for label {}",
                    detection.label_id
                )));
            }
        }

        for detection in &mut detections {
            detection.bbox = detection.bbox.clamped();
        }
        detections.retain(|d| d.score >= self.threshold);
        if let Some(labels) = &self.labels {
            detections.retain(|d| labels.contains(d.label_id));
        }
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        detections.truncate(self.top_k);
        Ok(detections)
    }

    fn max_results(&self) -> Option<usize> {
        Some(self.top_k)
    }
}
