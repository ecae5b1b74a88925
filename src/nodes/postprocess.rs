//! Postprocessing stage
//!
//! Turns `(prediction, frame)` pairs into bytes for a transport:
//! - [`DetectionFlattener`]: fixed-length little-endian `f32` buffer for the serial link
//! - [`DetectionOverlay`]: resized frame with bounding boxes, encoded as an image
//!
//! [`PostprocessNode`] also pushes every rendered buffer into its payload sinks
//! (e.g. a serial session's outgoing buffer) from the stage thread.

use super::engine::Detection;
use crate::runtime::frame::{Frame, Inference, PixelFormat};
use crate::runtime::node::{StageNode, WorkError, WorkResult};
use crate::runtime::pipeline::PayloadSink;
use crate::runtime::receiver::Receiver;
use std::sync::Arc;
use tracing::{debug, trace};

/// Formats one inference result into output bytes
pub trait Postprocess<P>: Send {
    fn render(&mut self, inference: &Inference<P>) -> WorkResult<Vec<u8>>;

    /// Length of every rendered buffer, if fixed
    ///
    /// Transports with a negotiated payload size (the serial link) require this.
    fn output_len(&self) -> Option<usize> {
        None
    }
}

impl<P, R: Postprocess<P> + ?Sized> Postprocess<P> for Box<R> {
    fn render(&mut self, inference: &Inference<P>) -> WorkResult<Vec<u8>> {
        (**self).render(inference)
    }

    fn output_len(&self) -> Option<usize> {
        (**self).output_len()
    }
}

/// Stage node formatting the newest inference result
pub struct PostprocessNode<P: Send + Sync + 'static, R> {
    name: String,
    upstream: Receiver<Inference<P>>,
    renderer: R,
    sinks: Vec<Arc<dyn PayloadSink>>,
}

impl<P: Send + Sync + 'static, R: Postprocess<P>> PostprocessNode<P, R> {
    pub fn new(upstream: Receiver<Inference<P>>, renderer: R) -> Self {
        Self {
            name: "postprocessor".to_string(),
            upstream,
            renderer,
            sinks: Vec::new(),
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Also deliver every rendered buffer to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn PayloadSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl<P: Send + Sync + 'static, R: Postprocess<P>> StageNode for PostprocessNode<P, R> {
    type Output = Vec<u8>;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&mut self) -> WorkResult<Vec<u8>> {
        let inference = self.upstream.recv()?;
        let bytes = self.renderer.render(&inference)?;
        trace!(
            "[{}] Rendered {} bytes for frame #{}",
            self.name,
            bytes.len(),
            inference.frame_seq
        );

        for sink in &self.sinks {
            sink.deliver(&bytes)?;
        }
        Ok(bytes)
    }

    /// Sinks are fed from this thread, so it has to run without pull-side listeners
    fn keeps_alive(&self) -> bool {
        !self.sinks.is_empty()
    }
}

/// Number of `f32` elements per flattened detection: label, xmin, ymin, xmax, ymax
pub const ELEMENTS_PER_DETECTION: usize = 5;

/// Flattens detections into a fixed-length `f32` buffer
///
/// Room is reserved for `max_detections` entries; unused entries are zero.
/// The buffer length never changes, which is what the serial link needs.
#[derive(Debug, Clone)]
pub struct DetectionFlattener {
    max_detections: usize,
}

impl DetectionFlattener {
    pub fn new(max_detections: usize) -> Self {
        Self { max_detections }
    }

    /// Number of `f32` elements in every output buffer
    pub fn flatten_len(&self) -> usize {
        self.max_detections * ELEMENTS_PER_DETECTION
    }

    pub fn flatten(&self, detections: &[Detection]) -> Vec<f32> {
        let mut values = vec![0.0f32; self.flatten_len()];
        for (slot, detection) in values
            .chunks_exact_mut(ELEMENTS_PER_DETECTION)
            .zip(detections.iter())
        {
            slot[0] = detection.label_id as f32;
            slot[1] = detection.bbox.xmin;
            slot[2] = detection.bbox.ymin;
            slot[3] = detection.bbox.xmax;
            slot[4] = detection.bbox.ymax;
        }
        values
    }
}

impl Postprocess<Vec<Detection>> for DetectionFlattener {
    fn render(&mut self, inference: &Inference<Vec<Detection>>) -> WorkResult<Vec<u8>> {
        if inference.prediction.len() > self.max_detections {
            debug!(
                "Dropping {} detections beyond the flattened capacity of {}",
                inference.prediction.len() - self.max_detections,
                self.max_detections
            );
        }
        Ok(self
            .flatten(&inference.prediction)
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect())
    }

    fn output_len(&self) -> Option<usize> {
        Some(self.flatten_len() * std::mem::size_of::<f32>())
    }
}

/// Encodes a frame into an image container
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &Frame) -> WorkResult<Vec<u8>>;

    /// MIME type of the encoded output
    fn content_type(&self) -> &'static str;
}

/// Binary PPM (P6) encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct PpmEncoder;

impl FrameEncoder for PpmEncoder {
    fn encode(&mut self, frame: &Frame) -> WorkResult<Vec<u8>> {
        let header = format!("P6\n{} {}\n255\n", frame.width(), frame.height());
        let pixels = frame.width() as usize * frame.height() as usize;
        let mut out = Vec::with_capacity(header.len() + pixels * 3);
        out.extend_from_slice(header.as_bytes());

        match frame.format() {
            PixelFormat::Rgb8 => out.extend_from_slice(frame.data()),
            PixelFormat::Bgr8 => {
                for px in frame.data().chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            PixelFormat::Gray8 => {
                for &v in frame.data() {
                    out.extend_from_slice(&[v, v, v]);
                }
            }
        }
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "image/x-portable-pixmap"
    }
}

/// 3x5 digit glyphs for box captions, one row per byte, leftmost pixel in bit 2
const DIGIT_GLYPHS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b001, 0b001, 0b001],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

/// Draws detection boxes, captioned with their label id, on the source frame
/// at the output resolution
pub struct DetectionOverlay<E> {
    width: u32,
    height: u32,
    encoder: E,
    color: [u8; 3],
    thickness: u32,
}

impl<E: FrameEncoder> DetectionOverlay<E> {
    pub fn new(width: u32, height: u32, encoder: E) -> Self {
        Self {
            width,
            height,
            encoder,
            color: [0, 255, 0],
            thickness: 2,
        }
    }

    /// Box color as RGB
    pub fn with_color(mut self, color: [u8; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn content_type(&self) -> &'static str {
        self.encoder.content_type()
    }

    /// Nearest-neighbour resize to the output resolution
    fn resize(&self, frame: &Frame) -> Frame {
        if frame.width() == self.width && frame.height() == self.height {
            return frame.to_owned_pixels();
        }
        let channels = frame.format().channels();
        let mut out = Frame::blank(self.width, self.height, frame.format());
        if frame.width() == 0 || frame.height() == 0 {
            return out;
        }
        for y in 0..self.height {
            let sy = (y as u64 * frame.height() as u64 / self.height as u64) as u32;
            for x in 0..self.width {
                let sx = (x as u64 * frame.width() as u64 / self.width as u64) as u32;
                let dst = out.offset(x, y);
                out.data_mut()[dst..dst + channels].copy_from_slice(frame.pixel(sx, sy));
            }
        }
        out
    }

    fn paint(&self, frame: &mut Frame, x: i64, y: i64) {
        if x < 0 || y < 0 || x >= frame.width() as i64 || y >= frame.height() as i64 {
            return;
        }
        let offset = frame.offset(x as u32, y as u32);
        let [r, g, b] = self.color;
        let format = frame.format();
        let data = frame.data_mut();
        match format {
            PixelFormat::Rgb8 => data[offset..offset + 3].copy_from_slice(&[r, g, b]),
            PixelFormat::Bgr8 => data[offset..offset + 3].copy_from_slice(&[b, g, r]),
            PixelFormat::Gray8 => {
                data[offset] = ((r as u16 + g as u16 + b as u16) / 3) as u8;
            }
        }
    }

    fn draw_box(&self, frame: &mut Frame, detection: &Detection) {
        let (x0, y0, x1, y1) = detection.bbox.scaled(frame.width(), frame.height());
        for t in 0..self.thickness as i64 {
            for x in x0..=x1 {
                self.paint(frame, x, y0 + t);
                self.paint(frame, x, y1 - t);
            }
            for y in y0..=y1 {
                self.paint(frame, x0 + t, y);
                self.paint(frame, x1 - t, y);
            }
        }

        let inset = self.thickness as i64 + 1;
        self.draw_caption(frame, x0 + inset, y0 + inset, detection.label_id);
    }

    /// Label id in digit glyphs with its top-left corner at (x, y)
    fn draw_caption(&self, frame: &mut Frame, x: i64, y: i64, label_id: u32) {
        let mut left = x;
        for digit in label_id.to_string().bytes() {
            let glyph = &DIGIT_GLYPHS[(digit - b'0') as usize];
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..3 {
                    if (bits >> (2 - col)) & 1 == 1 {
                        self.paint(frame, left + col, y + row as i64);
                    }
                }
            }
            left += 4;
        }
    }
}

impl<E: FrameEncoder> Postprocess<Vec<Detection>> for DetectionOverlay<E> {
    fn render(&mut self, inference: &Inference<Vec<Detection>>) -> WorkResult<Vec<u8>> {
        if self.width == 0 || self.height == 0 {
            return Err(WorkError::NodeError(format!(
                "invalid output resolution {}x{}",
                self.width, self.height
            )));
        }
        let mut output = self.resize(&inference.frame);
        for detection in &inference.prediction {
            self.draw_box(&mut output, detection);
        }
        self.encoder.encode(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::engine::BoundingBox;
    use std::sync::Mutex;

    fn detection(label_id: u32, bbox: BoundingBox) -> Detection {
        Detection {
            label_id,
            score: 0.9,
            bbox,
        }
    }

    fn inference(detections: Vec<Detection>, frame: Frame) -> Inference<Vec<Detection>> {
        Inference::new(detections, Arc::new(frame), 1)
    }

    fn decode_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_flattened_layout_is_zero_padded() {
        let mut flattener = DetectionFlattener::new(3);
        assert_eq!(flattener.output_len(), Some(3 * 5 * 4));

        let detections = vec![
            detection(7, BoundingBox::new(0.1, 0.2, 0.3, 0.4)),
            detection(2, BoundingBox::new(0.5, 0.5, 1.0, 1.0)),
        ];
        let bytes = flattener
            .render(&inference(detections, Frame::blank(1, 1, PixelFormat::Gray8)))
            .unwrap();
        assert_eq!(bytes.len(), 60);

        let values = decode_f32(&bytes);
        assert_eq!(&values[..5], &[7.0, 0.1, 0.2, 0.3, 0.4]);
        assert_eq!(&values[5..10], &[2.0, 0.5, 0.5, 1.0, 1.0]);
        assert!(values[10..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_flattener_truncates_extra_detections() {
        let mut flattener = DetectionFlattener::new(1);
        let detections = vec![
            detection(1, BoundingBox::new(0.0, 0.0, 0.1, 0.1)),
            detection(2, BoundingBox::new(0.0, 0.0, 0.2, 0.2)),
        ];
        let bytes = flattener
            .render(&inference(detections, Frame::blank(1, 1, PixelFormat::Gray8)))
            .unwrap();
        assert_eq!(decode_f32(&bytes)[0], 1.0);
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn test_overlay_resizes_and_draws() {
        let mut overlay = DetectionOverlay::new(8, 6, PpmEncoder).with_color([255, 0, 0]);
        let source = Frame::blank(4, 3, PixelFormat::Rgb8);
        let boxes = vec![detection(0, BoundingBox::new(0.0, 0.0, 0.5, 0.5))];

        let image = overlay.render(&inference(boxes, source)).unwrap();
        let header = b"P6\n8 6\n255\n";
        assert_eq!(&image[..header.len()], header);
        assert_eq!(image.len(), header.len() + 8 * 6 * 3);

        let pixels = &image[header.len()..];
        // top-left corner sits on the box edge
        assert_eq!(&pixels[0..3], &[255, 0, 0]);
        // bottom-right corner is outside the box
        let last = (6 * 8 - 1) * 3;
        assert_eq!(&pixels[last..last + 3], &[0, 0, 0]);
    }

    #[test]
    fn test_overlay_clamps_out_of_range_boxes() {
        let mut overlay = DetectionOverlay::new(8, 6, PpmEncoder);
        let source = Frame::blank(8, 6, PixelFormat::Rgb8);
        let boxes = vec![
            detection(3, BoundingBox::new(0.0, 0.0, 1e9, 1e9)),
            detection(4, BoundingBox::new(-1e9, f32::NAN, -2.0, f32::INFINITY)),
        ];

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(overlay.render(&inference(boxes, source)));
        });
        let image = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("overlay render did not finish")
            .unwrap();
        assert_eq!(image.len(), b"P6\n8 6\n255\n".len() + 8 * 6 * 3);
    }

    #[test]
    fn test_overlay_captions_label_id() {
        let mut overlay = DetectionOverlay::new(16, 12, PpmEncoder).with_color([0, 0, 255]);
        let source = Frame::blank(16, 12, PixelFormat::Rgb8);
        let boxes = vec![detection(1, BoundingBox::new(0.0, 0.0, 1.0, 1.0))];

        let image = overlay.render(&inference(boxes, source)).unwrap();
        let pixels = &image[b"P6\n16 12\n255\n".len()..];
        let at = |x: usize, y: usize| &pixels[(y * 16 + x) * 3..(y * 16 + x) * 3 + 3];

        // caption starts just inside the 2px border; the "1" glyph's top row is its middle column
        assert_eq!(at(3, 3), &[0, 0, 0]);
        assert_eq!(at(4, 3), &[0, 0, 255]);
        assert_eq!(at(4, 7), &[0, 0, 255]);
        assert_eq!(at(8, 8), &[0, 0, 0]);
    }

    #[test]
    fn test_ppm_converts_bgr() {
        let frame = Frame::new(1, 1, PixelFormat::Bgr8, vec![1, 2, 3]).unwrap();
        let image = PpmEncoder.encode(&frame).unwrap();
        assert!(image.ends_with(&[3, 2, 1]));
    }

    struct RecordingSink(Mutex<Vec<Vec<u8>>>);

    impl PayloadSink for RecordingSink {
        fn deliver(&self, payload: &[u8]) -> WorkResult<()> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_node_feeds_sinks_and_keeps_alive() {
        use crate::runtime::stage::Stage;
        use crate::runtime::node::StageNode;

        struct OneBox;
        impl StageNode for OneBox {
            type Output = Inference<Vec<Detection>>;
            fn name(&self) -> &str {
                "fake_engine"
            }
            fn produce(&mut self) -> WorkResult<Self::Output> {
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok(inference(
                    vec![detection(4, BoundingBox::new(0.0, 0.0, 1.0, 1.0))],
                    Frame::blank(2, 2, PixelFormat::Gray8),
                ))
            }
        }

        let engine = Stage::new(OneBox);
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut node = PostprocessNode::new(engine.subscribe(), DetectionFlattener::new(2))
            .with_sink(Arc::clone(&sink) as Arc<dyn PayloadSink>);
        assert!(node.keeps_alive());
        engine.start().unwrap();

        let bytes = node.produce().unwrap();
        assert_eq!(bytes.len(), 40);
        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], bytes);
    }
}
