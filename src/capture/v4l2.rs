//! V4L2 camera backend with memory-mapped streaming

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{CameraMode, PixelFormat, RawFrame};
use crate::capture::source::{CameraBackend, CameraHandle};
use crate::error::SourceError;
use crate::utils::{detect_capture_devices, DeviceSpec};
use crate::CaptureConfig;

/// Opens V4L2 devices with the configured geometry and format
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            buffer_count: config.buffer_count,
        }
    }

    /// First two capture devices in index order, as (day, night).
    pub fn discover() -> Option<(DeviceSpec, DeviceSpec)> {
        let mut devices = detect_capture_devices().into_iter();
        Some((devices.next()?, devices.next()?))
    }
}

impl CameraBackend for V4l2Backend {
    #[instrument(skip(self))]
    fn open(
        &self,
        camera: CameraMode,
        device: &DeviceSpec,
    ) -> Result<Box<dyn CameraHandle>, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            device: device.to_string(),
            reason,
        };

        let dev = Device::with_path(device.path()).map_err(|e| open_err(e.to_string()))?;

        // Query capabilities
        let caps = dev.query_caps().map_err(|e| open_err(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        // Set format
        let mut fmt = dev.format().map_err(|e| open_err(e.to_string()))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = match self.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Gray8 => FourCC::new(b"GREY"),
            other => return Err(open_err(format!("unsupported pixel format {:?}", other))),
        };
        let applied = dev.set_format(&fmt).map_err(|e| open_err(e.to_string()))?;

        let stream = MmapStream::with_buffers(&dev, Type::VideoCapture, self.buffer_count)
            .map_err(|e| open_err(e.to_string()))?;
        info!(
            %camera,
            "Capture stream started with {} buffers at {}x{}",
            self.buffer_count, applied.width, applied.height
        );

        Ok(Box::new(V4l2Handle {
            _device: dev,
            stream: Some(stream),
            width: applied.width,
            height: applied.height,
            format: self.format,
        }))
    }
}

/// Opened V4L2 stream
pub struct V4l2Handle {
    _device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl CameraHandle for V4l2Handle {
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::Read("stream closed".into()))?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                SourceError::ReadTimeout(timeout)
            }
            _ => SourceError::Read(e.to_string()),
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        Ok(RawFrame {
            data,
            width: self.width,
            height: self.height,
            format: self.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        })
    }

    fn close(&mut self) {
        // Dropping the stream unmaps the buffers and stops streaming
        self.stream = None;
    }
}
