use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Physical camera role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Day,
    Night,
}

impl CameraMode {
    pub const ALL: [CameraMode; 2] = [CameraMode::Day, CameraMode::Night];

    /// The camera that is not `self`.
    pub fn other(self) -> Self {
        match self {
            CameraMode::Day => CameraMode::Night,
            CameraMode::Night => CameraMode::Day,
        }
    }

    pub fn index(self) -> usize {
        match self {
            CameraMode::Day => 0,
            CameraMode::Night => 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(CameraMode::Day),
            1 => Some(CameraMode::Night),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CameraMode::Day => "day",
            CameraMode::Night => "night",
        }
    }
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(CameraMode::Day),
            "night" => Ok(CameraMode::Night),
            other => Err(format!("camera must be 'day' or 'night', got '{other}'")),
        }
    }
}

/// Frame as published to the frame channel
#[derive(Clone, Debug)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Wall-clock capture time, comparable across processes
    pub timestamp: SystemTime,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    /// Per-source sequence, never reused for a camera
    pub sequence: u64,
    pub camera: CameraMode,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Image as delivered by a camera handle, before the pipeline stamps it.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            PixelFormat::Gray8 => 0,
            PixelFormat::Rgb24 => 1,
            PixelFormat::Bgr24 => 2,
            PixelFormat::Yuyv4 => 3,
            PixelFormat::Mjpeg => 4,
            PixelFormat::Nv12 => 5,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => PixelFormat::Gray8,
            1 => PixelFormat::Rgb24,
            2 => PixelFormat::Bgr24,
            3 => PixelFormat::Yuyv4,
            4 => PixelFormat::Mjpeg,
            5 => PixelFormat::Nv12,
            _ => return None,
        })
    }
}

impl Frame {
    /// Stamp a raw capture with its source camera and per-source sequence.
    pub fn from_raw(raw: RawFrame, camera: CameraMode, sequence: u64) -> Self {
        Self {
            meta: Arc::new(FrameMetadata {
                sequence,
                camera,
                width: raw.width,
                height: raw.height,
                format: raw.format,
                device_timestamp: raw.device_timestamp,
            }),
            data: raw.data,
            timestamp: SystemTime::now(),
        }
    }

    /// Time since capture; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_mode_parses_case_insensitively() {
        assert_eq!("Night".parse::<CameraMode>(), Ok(CameraMode::Night));
        assert_eq!(" day ".parse::<CameraMode>(), Ok(CameraMode::Day));
        assert!("dusk".parse::<CameraMode>().is_err());
    }

    #[test]
    fn other_flips_between_cameras() {
        assert_eq!(CameraMode::Day.other(), CameraMode::Night);
        assert_eq!(CameraMode::Night.other().other(), CameraMode::Night);
    }
}
