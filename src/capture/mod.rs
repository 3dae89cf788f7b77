pub mod decoder;
pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{CameraMode, Frame, FrameMetadata, PixelFormat, RawFrame};
pub use source::{CameraBackend, CameraHandle, CameraLease, DeviceClaim, DeviceClaims};
pub use synthetic::{SyntheticBackend, SyntheticCamera};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;
