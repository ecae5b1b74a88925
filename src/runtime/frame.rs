//! Core data types flowing between stages

use super::errors::{WorkError, WorkResult};
use std::fmt;
use std::sync::Arc;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit interleaved red, green, blue
    Rgb8,
    /// 8-bit interleaved blue, green, red (typical capture driver order)
    Bgr8,
    /// 8-bit single channel
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel
    #[inline]
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One unit of image or feature data produced by a source stage
///
/// Immutable once published: consumers receive it behind an `Arc` and must
/// copy it (see [`Frame::to_owned_pixels`]) if they need to draw on it. The
/// buffer always holds exactly `width * height * channels` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame, checking the buffer matches the declared shape
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> WorkResult<Self> {
        let expected = Self::expected_len(width, height, format);
        if data.len() != expected {
            return Err(WorkError::Capture(format!(
                "{}x{} {:?} frame needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// All-zero frame of the given shape
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; Self::expected_len(width, height, format)],
        }
    }

    #[inline]
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.channels()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Row-major interleaved pixel data
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel data for in-place drawing; the length is fixed by the shape
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte offset of pixel (x, y)
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.format.channels()
    }

    /// Pixel bytes at (x, y)
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let offset = self.offset(x, y);
        &self.data[offset..offset + self.format.channels()]
    }

    /// Mutable copy of this frame for drawing
    pub fn to_owned_pixels(&self) -> Frame {
        self.clone()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Frame[{}x{} {:?}, bytes={}]",
            self.width,
            self.height,
            self.format,
            self.data.len()
        )
    }
}

/// Inference output paired with the exact frame it was computed from
///
/// Postprocessing needs both: the prediction for the numbers and the
/// original pixels for visualisation.
#[derive(Debug)]
pub struct Inference<P> {
    pub prediction: P,
    pub frame: Arc<Frame>,
    /// Sequence number of `frame` on the source stage
    pub frame_seq: u64,
}

impl<P> Inference<P> {
    pub fn new(prediction: P, frame: Arc<Frame>, frame_seq: u64) -> Self {
        Self {
            prediction,
            frame,
            frame_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape_checked() {
        assert!(Frame::new(2, 2, PixelFormat::Rgb8, vec![0; 12]).is_ok());
        assert!(Frame::new(4, 1, PixelFormat::Gray8, vec![0; 4]).is_ok());
        match Frame::new(2, 2, PixelFormat::Rgb8, vec![0; 11]) {
            Err(WorkError::Capture(message)) => assert!(message.contains("needs 12 bytes, got 11")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_pixel_lookup() {
        let mut data = vec![0u8; 3 * 2 * 3];
        // pixel (2, 1)
        data[15..18].copy_from_slice(&[7, 8, 9]);
        let frame = Frame::new(3, 2, PixelFormat::Rgb8, data).unwrap();
        assert_eq!(frame.pixel(2, 1), &[7, 8, 9]);
        assert_eq!(frame.pixel(0, 0), &[0, 0, 0]);
    }

    #[test]
    fn test_inference_keeps_source_frame() {
        let frame = Arc::new(Frame::blank(1, 1, PixelFormat::Gray8));
        let inference = Inference::new(42u8, Arc::clone(&frame), 9);
        assert!(Arc::ptr_eq(&inference.frame, &frame));
        assert_eq!(inference.frame_seq, 9);
    }
}
