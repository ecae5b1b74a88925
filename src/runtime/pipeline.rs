//! Linear capture → inference → postprocess pipeline
//!
//! [`PipelineBuilder`] wires a capture device, an inference engine and a
//! postprocessor into three [`Stage`]s plus any number of [`Transport`]s.
//! [`Pipeline::start`] starts them in that fixed order so no stage consumes
//! before its upstream can publish.
//!
//! ```text
//!   source ──Frame──▶ engine ──Inference<P>──▶ postprocessor ──bytes──▶ transports
//! ```
//!
//! Consumers pull the newest value from any stage through a
//! [`PipelineReader`]. Transports with a fixed payload (the serial link) are
//! fed by the postprocessor thread through a [`PayloadSink`].

use super::broadcast::Latest;
use super::clock::{SharedClock, system_clock};
use super::errors::WorkResult;
use super::frame::{Frame, Inference};
use super::receiver::Receiver;
use super::stage::{Stage, StageEvent, StageSettings};
use super::watchdog::Watchdog;
use crate::config::PipelineConfig;
use crate::nodes::engine::{EngineNode, InferenceEngine};
use crate::nodes::postprocess::{Postprocess, PostprocessNode};
use crate::nodes::source::{CaptureDevice, SourceNode};
use crate::{Result, StreamError};
use crossbeam_channel::Receiver as CrossbeamReceiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// Destination for the postprocessor's rendered bytes, fed on its thread
pub trait PayloadSink: Send + Sync {
    fn deliver(&self, payload: &[u8]) -> WorkResult<()>;
}

/// Something that ships postprocessed output out of the process
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Start the transport's own worker. Must be idempotent.
    fn start(&self) -> Result<()>;

    /// Sink to be fed by the postprocessor, for push-style transports
    fn payload_sink(&self) -> Option<Arc<dyn PayloadSink>> {
        None
    }

    /// Required length of every payload, for fixed-framing transports
    fn expected_payload_len(&self) -> Option<usize> {
        None
    }
}

/// Assembles a [`Pipeline`] from its parts
pub struct PipelineBuilder<P: Send + Sync + 'static> {
    config: PipelineConfig,
    clock: SharedClock,
    source: Option<Box<dyn CaptureDevice>>,
    engine: Option<Box<dyn InferenceEngine<Prediction = P>>>,
    postprocessor: Option<Box<dyn Postprocess<P>>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl<P: Send + Sync + 'static> PipelineBuilder<P> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            source: None,
            engine: None,
            postprocessor: None,
            transports: Vec::new(),
        }
    }

    /// Clock used for idle and eviction timing
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(mut self, device: impl CaptureDevice + 'static) -> Self {
        self.source = Some(Box::new(device));
        self
    }

    pub fn engine(mut self, engine: impl InferenceEngine<Prediction = P> + 'static) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    pub fn postprocessor(mut self, postprocessor: impl Postprocess<P> + 'static) -> Self {
        self.postprocessor = Some(Box::new(postprocessor));
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Validate the wiring and create the (not yet started) stages
    pub fn build(self) -> Result<Pipeline<P>> {
        let device = self
            .source
            .ok_or_else(|| StreamError::InvalidConfig("pipeline has no source".into()))?;
        let engine = self
            .engine
            .ok_or_else(|| StreamError::InvalidConfig("pipeline has no engine".into()))?;
        let postprocessor = self
            .postprocessor
            .ok_or_else(|| StreamError::InvalidConfig("pipeline has no postprocessor".into()))?;

        let output_len = postprocessor.output_len();
        for transport in &self.transports {
            if let Some(expected) = transport.expected_payload_len()
                && output_len != Some(expected)
            {
                return Err(StreamError::InvalidConfig(format!(
                    "transport '{}' expects {}-byte payloads but the postprocessor produces {}",
                    transport.name(),
                    expected,
                    output_len.map_or_else(|| "variable-length output".to_string(), |n| format!("{} bytes", n))
                )));
            }
        }

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let watchdog = Watchdog::with_threshold(self.config.watchdog_threshold());
        let settings = StageSettings::default()
            .with_clock(self.clock)
            .with_idle_timeout(self.config.idle_timeout())
            .with_eviction_window(self.config.eviction_window())
            .with_events(events_tx)
            .with_watchdog(watchdog.clone());

        let source = Stage::with_settings(SourceNode::new(device), settings.clone());
        let engine = Stage::with_settings(
            EngineNode::new(source.subscribe(), engine),
            settings.clone(),
        );

        let mut node = PostprocessNode::new(engine.subscribe(), postprocessor);
        for transport in &self.transports {
            if let Some(sink) = transport.payload_sink() {
                info!("Postprocessor feeds transport '{}'", transport.name());
                node = node.with_sink(sink);
            }
        }
        let postprocessor = Stage::with_settings(node, settings);

        Ok(Pipeline {
            source,
            engine,
            postprocessor,
            transports: self.transports,
            events: events_rx,
            watchdog,
            watchdog_thread: None,
        })
    }
}

/// Running (or startable) source → engine → postprocessor chain
pub struct Pipeline<P: Send + Sync + 'static> {
    source: Stage<Frame>,
    engine: Stage<Inference<P>>,
    postprocessor: Stage<Vec<u8>>,
    transports: Vec<Arc<dyn Transport>>,
    events: CrossbeamReceiver<StageEvent>,
    watchdog: Watchdog,
    watchdog_thread: Option<JoinHandle<()>>,
}

impl<P: Send + Sync + 'static> Pipeline<P> {
    /// Start source, engine, postprocessor and transports, in that order
    ///
    /// Idempotent. Stages that have stopped since the last call are started again.
    pub fn start(&mut self) -> Result<()> {
        if self.watchdog_thread.is_none() {
            self.watchdog_thread = Some(self.watchdog.start_monitoring_thread()?);
        }

        self.source.start()?;
        self.engine.start()?;
        self.postprocessor.start()?;
        for transport in &self.transports {
            transport.start()?;
            info!("Transport '{}' started", transport.name());
        }
        Ok(())
    }

    /// New set of pull-side consumers, one per stage
    pub fn reader(&self) -> PipelineReader<P> {
        PipelineReader {
            source: self.source.subscribe(),
            engine: self.engine.subscribe(),
            postprocessor: self.postprocessor.subscribe(),
        }
    }

    /// Stage lifecycle notifications (start, idle stop, end of stream, fault)
    pub fn events(&self) -> &CrossbeamReceiver<StageEvent> {
        &self.events
    }

    pub fn source(&self) -> &Stage<Frame> {
        &self.source
    }

    pub fn engine(&self) -> &Stage<Inference<P>> {
        &self.engine
    }

    pub fn postprocessor(&self) -> &Stage<Vec<u8>> {
        &self.postprocessor
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Faults of all stages, by stage name
    pub fn faults(&self) -> Vec<(String, String)> {
        [
            (self.source.name(), self.source.fault()),
            (self.engine.name(), self.engine.fault()),
            (self.postprocessor.name(), self.postprocessor.fault()),
        ]
        .into_iter()
        .filter_map(|(name, fault)| fault.map(|f| (name.to_string(), f)))
        .collect()
    }
}

impl<P: Send + Sync + 'static> Drop for Pipeline<P> {
    fn drop(&mut self) {
        self.watchdog.stop();
        if let Some(thread) = self.watchdog_thread.take()
            && thread.join().is_err()
        {
            error!("Watchdog thread panicked");
        }
    }
}

/// Pull accessors over every stage of a pipeline
///
/// Each call blocks until the stage publishes a value this reader has not seen.
pub struct PipelineReader<P: Send + Sync + 'static> {
    source: Receiver<Frame>,
    engine: Receiver<Inference<P>>,
    postprocessor: Receiver<Vec<u8>>,
}

impl<P: Send + Sync + 'static> PipelineReader<P> {
    pub fn get_source_frame(&mut self) -> WorkResult<Latest<Frame>> {
        self.source.recv()
    }

    /// Newest prediction together with the frame it was computed from
    pub fn get_prediction(&mut self) -> WorkResult<Latest<Inference<P>>> {
        self.engine.recv()
    }

    pub fn get_output_bytes(&mut self) -> WorkResult<Latest<Vec<u8>>> {
        self.postprocessor.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::engine::{BoundingBox, Detection, Detector, LabeledDetector};
    use crate::nodes::postprocess::{DetectionFlattener, DetectionOverlay, PpmEncoder};
    use crate::nodes::source::TestPatternCamera;
    use crate::runtime::errors::WorkError;
    use crate::runtime::stage::{StageState, StopReason};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Reports one box whose label is the first pixel value of the frame
    struct PixelDetector;

    impl Detector for PixelDetector {
        fn detect(&mut self, frame: &Frame) -> WorkResult<Vec<Detection>> {
            Ok(vec![Detection {
                label_id: frame.data()[0] as u32,
                score: 0.9,
                bbox: BoundingBox::new(0.25, 0.25, 0.75, 0.75),
            }])
        }
    }

    struct RecordingTransport {
        expected: Option<usize>,
        sink: Arc<RecordingSink>,
        starts: Mutex<u32>,
    }

    struct RecordingSink {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl PayloadSink for RecordingSink {
        fn deliver(&self, payload: &[u8]) -> WorkResult<()> {
            self.payloads.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    impl RecordingTransport {
        fn new(expected: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                expected,
                sink: Arc::new(RecordingSink {
                    payloads: Mutex::new(Vec::new()),
                }),
                starts: Mutex::new(0),
            })
        }
    }

    impl Transport for Arc<RecordingTransport> {
        fn name(&self) -> &str {
            "recorder"
        }

        fn start(&self) -> Result<()> {
            *self.starts.lock().unwrap() += 1;
            Ok(())
        }

        fn payload_sink(&self) -> Option<Arc<dyn PayloadSink>> {
            Some(Arc::clone(&self.sink) as Arc<dyn PayloadSink>)
        }

        fn expected_payload_len(&self) -> Option<usize> {
            self.expected
        }
    }

    fn camera() -> TestPatternCamera {
        TestPatternCamera::new(16, 12).with_frame_interval(Duration::from_millis(2))
    }

    #[test]
    fn test_output_bytes_have_fixed_length() {
        let mut pipeline = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 4, 0.5))
            .postprocessor(DetectionFlattener::new(4))
            .build()
            .unwrap();
        pipeline.start().unwrap();

        let mut reader = pipeline.reader();
        let mut last_seq = 0;
        for _ in 0..3 {
            let bytes = reader.get_output_bytes().unwrap();
            assert_eq!(bytes.len(), 4 * 5 * 4);
            assert!(bytes.seq > last_seq);
            last_seq = bytes.seq;
        }
    }

    #[test]
    fn test_prediction_matches_its_frame() {
        let mut pipeline = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 1, 0.5))
            .postprocessor(DetectionOverlay::new(32, 24, PpmEncoder))
            .build()
            .unwrap();
        pipeline.start().unwrap();

        let mut reader = pipeline.reader();
        for _ in 0..5 {
            let inference = reader.get_prediction().unwrap();
            assert_eq!(inference.prediction[0].label_id, inference.frame.data()[0] as u32);
        }
        let frame = reader.get_source_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (16, 12));
    }

    #[test]
    fn test_stages_start_in_order() {
        let mut pipeline = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 1, 0.5))
            .postprocessor(DetectionFlattener::new(1))
            .build()
            .unwrap();
        pipeline.start().unwrap();

        let started: Vec<String> = pipeline
            .events()
            .iter()
            .take(3)
            .map(|event| match event {
                StageEvent::Started { stage } => stage,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(started, vec!["source", "engine", "postprocessor"]);

        // second start is a no-op for running stages
        pipeline.start().unwrap();
        assert!(pipeline.events().try_recv().is_err());
    }

    #[test]
    fn test_transport_payload_length_validated() {
        let result = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 2, 0.5))
            .postprocessor(DetectionFlattener::new(2))
            .transport(RecordingTransport::new(Some(12)))
            .build();
        match result {
            Err(StreamError::InvalidConfig(msg)) => assert!(msg.contains("recorder")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("mismatched payload length accepted"),
        }

        let result = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 2, 0.5))
            .postprocessor(DetectionOverlay::new(8, 8, PpmEncoder))
            .transport(RecordingTransport::new(Some(40)))
            .build();
        assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
    }

    #[test]
    fn test_push_transport_is_fed_without_readers() {
        let transport = RecordingTransport::new(Some(2 * 5 * 4));
        let mut pipeline = PipelineBuilder::new(PipelineConfig::default())
            .source(camera())
            .engine(LabeledDetector::new(PixelDetector, 2, 0.5))
            .postprocessor(DetectionFlattener::new(2))
            .transport(Arc::clone(&transport))
            .build()
            .unwrap();
        pipeline.start().unwrap();
        assert_eq!(*transport.starts.lock().unwrap(), 1);

        let start = std::time::Instant::now();
        while transport.sink.payloads.lock().unwrap().len() < 3 {
            assert!(start.elapsed() < Duration::from_secs(5), "transport never fed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(
            transport
                .sink
                .payloads
                .lock()
                .unwrap()
                .iter()
                .all(|p| p.len() == 40)
        );
    }

    #[test]
    fn test_capture_fault_reaches_readers() {
        struct DyingCamera(u32);
        impl CaptureDevice for DyingCamera {
            fn next_frame(&mut self) -> WorkResult<Frame> {
                std::thread::sleep(Duration::from_millis(2));
                if self.0 == 0 {
                    return Err(WorkError::Capture("camera unplugged".into()));
                }
                self.0 -= 1;
                Ok(Frame::blank(2, 2, crate::runtime::frame::PixelFormat::Gray8))
            }
        }

        let mut pipeline = PipelineBuilder::new(PipelineConfig::default())
            .source(DyingCamera(5))
            .engine(LabeledDetector::new(PixelDetector, 1, 0.5))
            .postprocessor(DetectionFlattener::new(1))
            .build()
            .unwrap();
        let mut reader = pipeline.reader();
        pipeline.start().unwrap();

        let mut result = reader.get_source_frame();
        while result.is_ok() {
            result = reader.get_source_frame();
        }
        assert!(matches!(result, Err(WorkError::Shutdown)));

        pipeline.source().join();
        assert_eq!(pipeline.source().state(), StageState::Faulted);
        let faults = pipeline.faults();
        assert_eq!(faults[0].0, "source");
        assert!(faults[0].1.contains("camera unplugged"));

        let fault_event = pipeline.events().iter().find(|event| {
            matches!(event, StageEvent::Stopped { stage, reason: StopReason::Fault(_), .. } if stage == "source")
        });
        assert!(fault_event.is_some());
    }
}
