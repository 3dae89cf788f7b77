//! Camera source capability
//!
//! Hardware drivers implement [`CameraBackend`] to open devices and
//! [`CameraHandle`] to read from an opened device. Every blocking call takes
//! an explicit timeout so no pipeline thread can hang on a camera.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::decoder::frame_luma;
use crate::capture::frame::{CameraMode, RawFrame};
use crate::error::SourceError;
use crate::pipeline::shutdown::call_with_timeout;
use crate::utils::DeviceSpec;

/// Opens camera devices.
pub trait CameraBackend: Send + Sync + 'static {
    /// Open `device` for the `camera` role. Implementations may block; callers
    /// bound the wait with [`open_with_timeout`].
    fn open(
        &self,
        camera: CameraMode,
        device: &DeviceSpec,
    ) -> Result<Box<dyn CameraHandle>, SourceError>;
}

/// An opened camera. Dropping the handle releases the device.
pub trait CameraHandle: Send {
    /// Read the next frame, waiting at most `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError>;

    /// Single brightness reading without disturbing any other stream.
    fn brightness_peek(&mut self, timeout: Duration) -> Result<f64, SourceError> {
        let frame = self.read_frame(timeout)?;
        frame_luma(&frame).map_err(|e| SourceError::Read(e.to_string()))
    }

    /// Release the device explicitly.
    fn close(&mut self) {}
}

/// Open a device on a helper thread so a wedged driver cannot stall the
/// caller for longer than `timeout`. A handle that arrives late is dropped.
pub fn open_with_timeout(
    backend: &Arc<dyn CameraBackend>,
    camera: CameraMode,
    device: &DeviceSpec,
    timeout: Duration,
) -> Result<Box<dyn CameraHandle>, SourceError> {
    let backend = Arc::clone(backend);
    let target = device.clone();
    match call_with_timeout("camera-open", timeout, move || backend.open(camera, &target)) {
        Some(result) => result,
        None => Err(SourceError::Open {
            device: device.to_string(),
            reason: format!("open did not complete within {:?}", timeout),
        }),
    }
}

/// Exclusive-use flags for the two camera devices. Whoever holds a
/// [`DeviceClaim`] may open the device; the claim is released on drop.
#[derive(Debug, Default)]
pub struct DeviceClaims {
    in_use: [Arc<AtomicBool>; 2],
}

impl DeviceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `camera`'s device, or `None` if someone else holds it.
    pub fn try_claim(&self, camera: CameraMode) -> Option<DeviceClaim> {
        let flag = &self.in_use[camera.index()];
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DeviceClaim {
                camera,
                flag: Arc::clone(flag),
            })
    }

    pub fn is_claimed(&self, camera: CameraMode) -> bool {
        self.in_use[camera.index()].load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct DeviceClaim {
    camera: CameraMode,
    flag: Arc<AtomicBool>,
}

impl DeviceClaim {
    pub fn camera(&self) -> CameraMode {
        self.camera
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// An opened device together with the claim that allowed opening it.
pub struct CameraLease {
    pub handle: Box<dyn CameraHandle>,
    pub claim: DeviceClaim,
}

impl CameraLease {
    pub fn camera(&self) -> CameraMode {
        self.claim.camera()
    }

    /// Close the device, then give up the claim.
    pub fn release(mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let claims = DeviceClaims::new();
        let day = claims.try_claim(CameraMode::Day).unwrap();
        assert!(claims.try_claim(CameraMode::Day).is_none());
        assert!(claims.try_claim(CameraMode::Night).is_some());
        assert_eq!(day.camera(), CameraMode::Day);
        drop(day);
        assert!(!claims.is_claimed(CameraMode::Day));
        assert!(claims.try_claim(CameraMode::Day).is_some());
    }
}
