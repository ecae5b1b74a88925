//! Example: Stream detection results to a (simulated) microcontroller
//!
//! Runs the full capture → inference → flatten pipeline on a test-pattern
//! camera with a toy detector, ships the flattened results over the serial
//! link protocol to an emulated firmware, and prints what the firmware receives.
//!
//! Usage:
//!   cargo run --example serial_stream -- --top-k 3 -n 20
//!
//! With an app_params config file:
//!   cargo run --example serial_stream -- --config app_params.json

use clap::Parser;
use edgestream::config::PipelineConfig;
use edgestream::link::{PayloadFormat, SerialLinkSession, SimulatedPeripheral};
use edgestream::nodes::{
    BoundingBox, Detection, DetectionFlattener, Detector, ELEMENTS_PER_DETECTION,
    LabeledDetector, TestPatternCamera,
};
use edgestream::runtime::{Frame, PipelineBuilder, StageEvent, WorkResult};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an app_params JSON config
    #[arg(short, long)]
    config: Option<String>,

    /// Maximum detections per frame (overrides the config)
    #[arg(long)]
    top_k: Option<usize>,

    /// Number of payloads to wait for on the device
    #[arg(short, long, default_value_t = 10)]
    n: usize,

    /// Camera frame interval in milliseconds
    #[arg(long, default_value_t = 33)]
    frame_ms: u64,

    /// Use fast link timings instead of the hardware defaults
    #[arg(long)]
    fast_link: bool,
}

/// Finds the brightest column band of the frame and reports it as one box
struct BrightBandDetector;

impl Detector for BrightBandDetector {
    fn detect(&mut self, frame: &Frame) -> WorkResult<Vec<Detection>> {
        let width = frame.width() as usize;
        let channels = frame.format().channels();
        let row = &frame.data()[..width * channels];
        let (brightest, value) = row
            .chunks_exact(channels)
            .map(|px| px[0])
            .enumerate()
            .max_by_key(|(_, v)| *v)
            .unwrap_or((0, 0));

        let x = brightest as f32 / width.max(1) as f32;
        Ok(vec![Detection {
            label_id: 1,
            score: value as f32 / 255.0,
            bbox: BoundingBox::new((x - 0.05).max(0.0), 0.0, (x + 0.05).min(1.0), 1.0),
        }])
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(top_k) = args.top_k {
        config.engine.top_k = top_k;
    }
    if args.fast_link {
        config.link.handshake_window_ms = 5;
        config.link.ready_poll_ms = 5;
        config.link.format_settle_ms = 10;
    }
    config.validate()?;

    info!("=== Serial Stream Example ===");
    info!("top_k: {}", config.engine.top_k);
    info!("Resolution: {}x{}", config.source.width, config.source.height);

    let flattener = DetectionFlattener::new(config.engine.top_k);
    let format = PayloadFormat::float32(flattener.flatten_len())?;

    let device = SimulatedPeripheral::new();
    let session = SerialLinkSession::new(device.port(), device.signal(), format, config.link.clone());

    let camera = TestPatternCamera::new(config.source.width, config.source.height)
        .with_frame_interval(Duration::from_millis(args.frame_ms));
    let detector = LabeledDetector::from_config(BrightBandDetector, &config.engine)?;

    let mut pipeline = PipelineBuilder::new(config.clone())
        .source(camera)
        .engine(detector)
        .postprocessor(flattener)
        .transport(session.clone())
        .build()?;
    pipeline.start()?;

    let start = Instant::now();
    let mut seen = 0;
    while seen < args.n {
        for event in pipeline.events().try_iter() {
            match event {
                StageEvent::Stopped { stage, reason, produced } => {
                    warn!("Stage '{}' stopped after {} items: {:?}", stage, produced, reason)
                }
                StageEvent::Started { stage } => info!("Stage '{}' running", stage),
            }
        }

        let received = device.received_count();
        if received > seen {
            if let Some(values) = device.last_received() {
                for (i, det) in values.chunks_exact(ELEMENTS_PER_DETECTION).enumerate() {
                    if det.iter().any(|v| *v != 0.0) {
                        info!(
                            "payload {:>3} det {}: label={} box=({:.2}, {:.2})-({:.2}, {:.2})",
                            received, i, det[0], det[1], det[2], det[3], det[4]
                        );
                    }
                }
            }
            seen = received;
        }

        if start.elapsed() > Duration::from_secs(30) {
            warn!("Timed out waiting for payloads");
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let status = session.status();
    info!("=== Summary ===");
    info!("Link state: {:?}", status.state);
    info!("Handshakes: {}", status.handshakes);
    info!("Payloads sent: {}", status.payloads_sent);
    info!("Heartbeat errors: {}", status.heartbeat_errors);
    info!("Payloads received by device: {}", device.received_count());
    for (stage, fault) in pipeline.faults() {
        warn!("Stage '{}' faulted: {}", stage, fault);
    }

    Ok(())
}
