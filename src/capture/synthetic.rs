//! Synthetic cameras for development without hardware
//!
//! Each camera renders a flat grey image whose level is the configured
//! brightness, with a moving bright bar so consecutive frames differ. Tests
//! and the demo binary steer brightness and inject failures at runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::capture::frame::{CameraMode, PixelFormat, RawFrame};
use crate::capture::source::{CameraBackend, CameraHandle};
use crate::error::SourceError;
use crate::utils::DeviceSpec;

/// Runtime controls of one synthetic camera
#[derive(Debug)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    brightness: AtomicU64, // f64 bits
    fail_open: AtomicBool,
    fail_reads: AtomicBool,
    read_delay_ms: AtomicU64,
    opens: AtomicUsize,
    open_handles: AtomicUsize,
}

impl SyntheticCamera {
    fn new(width: u32, height: u32, brightness: f64) -> Self {
        Self {
            width,
            height,
            brightness: AtomicU64::new(brightness.to_bits()),
            fail_open: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            opens: AtomicUsize::new(0),
            open_handles: AtomicUsize::new(0),
        }
    }

    pub fn set_brightness(&self, value: f64) {
        self.brightness
            .store(value.clamp(0.0, 255.0).to_bits(), Ordering::Relaxed);
    }

    pub fn brightness(&self) -> f64 {
        f64::from_bits(self.brightness.load(Ordering::Relaxed))
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Simulated sensor latency per read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Relaxed)
    }

    fn render(&self, tick: u64) -> Bytes {
        let level = self.brightness().round() as u8;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![level; w * h];
        if w > 0 {
            // One-pixel column sweeping across the image
            let column = (tick as usize) % w;
            let bar = level.saturating_add(32);
            for row in 0..h {
                pixels[row * w + column] = bar;
            }
        }
        Bytes::from(pixels)
    }
}

/// Backend serving a day and a night synthetic camera
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    cameras: [Arc<SyntheticCamera>; 2],
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            cameras: [
                Arc::new(SyntheticCamera::new(width, height, 128.0)),
                Arc::new(SyntheticCamera::new(width, height, 20.0)),
            ],
        }
    }

    pub fn camera(&self, camera: CameraMode) -> &Arc<SyntheticCamera> {
        &self.cameras[camera.index()]
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

impl CameraBackend for SyntheticBackend {
    fn open(
        &self,
        camera: CameraMode,
        device: &DeviceSpec,
    ) -> Result<Box<dyn CameraHandle>, SourceError> {
        let source = Arc::clone(self.camera(camera));
        if source.fail_open.load(Ordering::Relaxed) {
            return Err(SourceError::Open {
                device: device.to_string(),
                reason: "synthetic open failure".into(),
            });
        }
        source.opens.fetch_add(1, Ordering::Relaxed);
        source.open_handles.fetch_add(1, Ordering::Relaxed);
        debug!(%camera, %device, "synthetic camera opened");
        Ok(Box::new(SyntheticHandle {
            source,
            tick: 0,
            closed: false,
        }))
    }
}

struct SyntheticHandle {
    source: Arc<SyntheticCamera>,
    tick: u64,
    closed: bool,
}

impl CameraHandle for SyntheticHandle {
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        if self.closed {
            return Err(SourceError::Read("handle closed".into()));
        }
        let delay = Duration::from_millis(self.source.read_delay_ms.load(Ordering::Relaxed));
        if delay > timeout {
            std::thread::sleep(timeout);
            return Err(SourceError::ReadTimeout(timeout));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.source.fail_reads.load(Ordering::Relaxed) {
            return Err(SourceError::Read("synthetic read failure".into()));
        }

        self.tick += 1;
        Ok(RawFrame {
            data: self.source.render(self.tick),
            width: self.source.width,
            height: self.source.height,
            format: PixelFormat::Gray8,
            device_timestamp: None,
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.open_handles.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decoder::frame_luma;

    #[test]
    fn frames_track_configured_brightness() {
        let backend = SyntheticBackend::new(100, 10);
        backend.camera(CameraMode::Day).set_brightness(60.0);
        let mut handle = backend
            .open(CameraMode::Day, &DeviceSpec::Index(0))
            .unwrap();
        let frame = handle.read_frame(Duration::from_millis(10)).unwrap();
        // 99 columns at 60 plus the sweeping bar at 92
        let luma = frame_luma(&frame).unwrap();
        assert!((luma - 60.32).abs() < 1e-9, "luma was {luma}");
    }

    #[test]
    fn injected_failures_surface_as_source_errors() {
        let backend = SyntheticBackend::default();
        let night = backend.camera(CameraMode::Night);

        night.set_fail_open(true);
        assert!(matches!(
            backend.open(CameraMode::Night, &DeviceSpec::Index(1)),
            Err(SourceError::Open { .. })
        ));

        night.set_fail_open(false);
        let mut handle = backend
            .open(CameraMode::Night, &DeviceSpec::Index(1))
            .unwrap();
        night.set_fail_reads(true);
        assert!(matches!(
            handle.brightness_peek(Duration::from_millis(10)),
            Err(SourceError::Read(_))
        ));
    }

    #[test]
    fn slow_reads_time_out() {
        let backend = SyntheticBackend::default();
        let day = backend.camera(CameraMode::Day);
        day.set_read_delay(Duration::from_millis(50));
        let mut handle = backend.open(CameraMode::Day, &DeviceSpec::Index(0)).unwrap();
        assert!(matches!(
            handle.read_frame(Duration::from_millis(5)),
            Err(SourceError::ReadTimeout(_))
        ));
    }

    #[test]
    fn dropping_a_handle_releases_it() {
        let backend = SyntheticBackend::default();
        let handle = backend.open(CameraMode::Day, &DeviceSpec::Index(0)).unwrap();
        assert_eq!(backend.camera(CameraMode::Day).open_handles(), 1);
        drop(handle);
        assert_eq!(backend.camera(CameraMode::Day).open_handles(), 0);
    }
}
