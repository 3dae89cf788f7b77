//! Brightness probing of the inactive camera
//!
//! A probe opens the camera briefly, takes one brightness reading and closes
//! it again. It never touches a device that is currently claimed (by the
//! active capture thread, or by a switch in progress), so the active feed is
//! never disturbed. Failures cost that tick's sample and nothing else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::capture::source::open_with_timeout;
use crate::capture::{CameraBackend, CameraMode, DeviceClaims};
use crate::error::SourceError;
use crate::pipeline::switcher::BrightnessSample;
use crate::telemetry::{self, LogContext};
use crate::utils::DeviceSpec;

pub struct BrightnessProbe {
    backend: Arc<dyn CameraBackend>,
    devices: [DeviceSpec; 2],
    claims: Arc<DeviceClaims>,
    open_timeout: Duration,
    read_timeout: Duration,
    log: LogContext,
}

impl BrightnessProbe {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        devices: [DeviceSpec; 2],
        claims: Arc<DeviceClaims>,
        open_timeout: Duration,
        read_timeout: Duration,
        log: LogContext,
    ) -> Self {
        Self {
            backend,
            devices,
            claims,
            open_timeout,
            read_timeout,
            log,
        }
    }

    /// One brightness reading from `camera`, or `None` if the device is busy
    /// or did not answer in time.
    pub fn sample(&self, camera: CameraMode) -> Option<BrightnessSample> {
        let _entered = self.log.span().enter();

        let Some(claim) = self.claims.try_claim(camera) else {
            debug!(%camera, "device busy, skipping probe");
            return None;
        };

        let result = self.peek(camera);
        drop(claim);

        match result {
            Ok(value) => {
                debug!(%camera, brightness = value, "probe sample");
                metrics::gauge!(telemetry::BRIGHTNESS, "camera" => camera.as_str()).set(value);
                Some(BrightnessSample {
                    camera,
                    value,
                    at: Instant::now(),
                })
            }
            Err(e) => {
                warn!(%camera, "brightness probe failed: {}", e);
                metrics::counter!(telemetry::PROBE_FAILURES, "camera" => camera.as_str())
                    .increment(1);
                None
            }
        }
    }

    fn peek(&self, camera: CameraMode) -> Result<f64, SourceError> {
        let device = &self.devices[camera.index()];
        let mut handle = open_with_timeout(&self.backend, camera, device, self.open_timeout)?;
        let value = handle.brightness_peek(self.read_timeout);
        handle.close();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;

    fn probe(backend: &Arc<SyntheticBackend>, claims: &Arc<DeviceClaims>) -> BrightnessProbe {
        let backend: Arc<dyn CameraBackend> = backend.clone();
        BrightnessProbe::new(
            backend,
            [DeviceSpec::Index(0), DeviceSpec::Index(1)],
            Arc::clone(claims),
            Duration::from_millis(200),
            Duration::from_millis(50),
            LogContext::root("test"),
        )
    }

    #[test]
    fn sample_reads_and_releases_the_device() {
        let backend = Arc::new(SyntheticBackend::new(10, 10));
        let claims = Arc::new(DeviceClaims::new());
        let night = backend.camera(CameraMode::Night);
        night.set_brightness(90.0);

        let sample = probe(&backend, &claims).sample(CameraMode::Night).unwrap();
        assert_eq!(sample.camera, CameraMode::Night);
        // 9 columns at 90 plus the bar at 122
        assert!((sample.value - 93.2).abs() < 1e-9);
        assert_eq!(night.open_handles(), 0);
        assert!(!claims.is_claimed(CameraMode::Night));
    }

    #[test]
    fn failures_yield_no_sample() {
        let backend = Arc::new(SyntheticBackend::default());
        let claims = Arc::new(DeviceClaims::new());
        let probe = probe(&backend, &claims);
        let day = backend.camera(CameraMode::Day);

        day.set_fail_open(true);
        assert!(probe.sample(CameraMode::Day).is_none());

        day.set_fail_open(false);
        day.set_read_delay(Duration::from_millis(500));
        assert!(probe.sample(CameraMode::Day).is_none());
        assert_eq!(day.open_handles(), 0);
    }

    #[test]
    fn claimed_device_is_left_alone() {
        let backend = Arc::new(SyntheticBackend::default());
        let claims = Arc::new(DeviceClaims::new());
        let _held = claims.try_claim(CameraMode::Day).unwrap();
        assert!(probe(&backend, &claims).sample(CameraMode::Day).is_none());
        assert_eq!(backend.camera(CameraMode::Day).opens(), 0);
    }
}
