//! Capture source node
//!
//! A [`SourceNode`] pulls raw frames from a [`CaptureDevice`] and is the head
//! stage of every pipeline. Camera drivers live outside this crate; they only
//! need to implement [`CaptureDevice`].

use crate::runtime::frame::{Frame, PixelFormat};
use crate::runtime::node::{StageNode, WorkError, WorkResult};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Blocking frame grabber
pub trait CaptureDevice: Send {
    /// Open the device. Called once, from the stage thread, before the first frame.
    ///
    /// Returning an error is fatal for the source stage.
    fn open(&mut self) -> WorkResult<()> {
        Ok(())
    }

    /// Block until the next frame is available
    fn next_frame(&mut self) -> WorkResult<Frame>;

    /// Release the device. Called when the stage loop ends.
    fn close(&mut self) {}
}

impl<C: CaptureDevice + ?Sized> CaptureDevice for Box<C> {
    fn open(&mut self) -> WorkResult<()> {
        (**self).open()
    }

    fn next_frame(&mut self) -> WorkResult<Frame> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Stage node wrapping a capture device
pub struct SourceNode<C> {
    name: String,
    device: C,
    opened: bool,
    frame_count: u64,
}

impl<C: CaptureDevice> SourceNode<C> {
    pub fn new(device: C) -> Self {
        Self {
            name: "source".to_string(),
            device,
            opened: false,
            frame_count: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl<C: CaptureDevice> StageNode for SourceNode<C> {
    type Output = Frame;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&mut self) -> WorkResult<Frame> {
        if !self.opened {
            self.device.open()?;
            self.opened = true;
            info!("[{}] Capture device opened", self.name);
        }

        match self.device.next_frame() {
            Ok(frame) => {
                self.frame_count += 1;
                debug!("[{}] Captured {} (#{})", self.name, frame, self.frame_count);
                Ok(frame)
            }
            Err(e) => {
                // The next start() reopens the device
                self.device.close();
                self.opened = false;
                Err(e)
            }
        }
    }
}

/// Synthetic camera producing a moving gradient
///
/// Useful for demos and tests where no capture hardware is present.
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_interval: Duration,
    frame_limit: Option<u64>,
    counter: u64,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Bgr8,
            frame_interval: Duration::from_millis(33),
            frame_limit: None,
            counter: 0,
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Delay between frames (simulates the sensor frame rate)
    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    /// End the stream after `limit` frames
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::blank(self.width, self.height, self.format);
        let channels = self.format.channels();
        let shift = self.counter as usize;
        let data = frame.data_mut();
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let offset = (y * self.width as usize + x) * channels;
                let value = ((x + y + shift) % 256) as u8;
                for c in 0..channels {
                    data[offset + c] = value.wrapping_add((c * 85) as u8);
                }
            }
        }
        frame
    }
}

impl CaptureDevice for TestPatternCamera {
    fn open(&mut self) -> WorkResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(WorkError::Capture(format!(
                "invalid test pattern resolution {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    fn next_frame(&mut self) -> WorkResult<Frame> {
        if self.frame_limit.is_some_and(|limit| self.counter >= limit) {
            return Err(WorkError::Shutdown);
        }
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }
        let frame = self.render();
        self.counter += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenCamera;

    impl CaptureDevice for BrokenCamera {
        fn open(&mut self) -> WorkResult<()> {
            Err(WorkError::Capture("/dev/video0: no such device".to_string()))
        }

        fn next_frame(&mut self) -> WorkResult<Frame> {
            unreachable!("never opened")
        }
    }

    #[test]
    fn test_pattern_frames_change() {
        let camera = TestPatternCamera::new(4, 2).with_frame_interval(Duration::ZERO);
        let mut node = SourceNode::new(camera);

        let first = node.produce().unwrap();
        let second = node.produce().unwrap();
        assert_eq!(first.data().len(), 4 * 2 * 3);
        assert_ne!(first.data(), second.data());
        assert_eq!(node.frame_count(), 2);
    }

    #[test]
    fn test_frame_limit_ends_stream() {
        let camera = TestPatternCamera::new(2, 2)
            .with_frame_interval(Duration::ZERO)
            .with_frame_limit(1);
        let mut node = SourceNode::new(camera);

        assert!(node.produce().is_ok());
        assert!(matches!(node.produce(), Err(WorkError::Shutdown)));
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let mut node = SourceNode::new(BrokenCamera).with_name("camera");
        match node.produce() {
            Err(WorkError::Capture(msg)) => assert!(msg.contains("no such device")),
            other => panic!("expected capture error, got {:?}", other.map(|f| f.to_string())),
        }
    }
}
