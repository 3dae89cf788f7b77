//! Object detection results and the detector capability

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::error::DetectorError;

/// Most boxes a single detection may carry
pub const MAX_DETECTIONS: usize = 10;

/// Bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub class_id: u32,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// One inference result
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub boxes: Vec<BoundingBox>,
    pub timestamp: SystemTime,
    /// Frame-channel sequence of the frame this was computed from
    pub frame_sequence: u64,
}

impl Detection {
    pub fn new(boxes: Vec<BoundingBox>, frame_sequence: u64) -> Self {
        Self {
            boxes,
            timestamp: SystemTime::now(),
            frame_sequence,
        }
    }

    /// Absolute distance between this result and `frame`'s capture time.
    pub fn skew_from(&self, frame: &Frame) -> Duration {
        match self.timestamp.duration_since(frame.timestamp) {
            Ok(skew) => skew,
            Err(e) => e.duration(),
        }
    }
}

/// Inference capability. May be slower than the camera cadence; it runs on
/// its own thread and only ever sees the freshest frame.
pub trait Detector: Send + 'static {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Deterministic stand-in detector: reports one box that walks across the
/// frame, cycling through `classes`.
#[derive(Debug, Clone)]
pub struct SyntheticDetector {
    classes: u32,
    latency: Duration,
}

impl SyntheticDetector {
    pub fn new(classes: u32, latency: Duration) -> Self {
        Self {
            classes: classes.max(1),
            latency,
        }
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

impl Detector for SyntheticDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let (width, height) = (frame.meta.width as i32, frame.meta.height as i32);
        if width <= 0 || height <= 0 {
            return Err(DetectorError(format!(
                "frame {} has no pixels",
                frame.meta.sequence
            )));
        }

        let w = (width / 4).max(1);
        let h = (height / 4).max(1);
        let positions = (width - w + 1).max(1) as u64;
        let x = (frame.meta.sequence % positions) as i32;
        Ok(vec![BoundingBox {
            class_id: (frame.meta.sequence % self.classes as u64) as u32,
            confidence: 0.9,
            x,
            y: (height - h) / 2,
            w,
            h,
        }])
    }
}
