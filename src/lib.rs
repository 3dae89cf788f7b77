pub mod capture;
pub mod detection;
pub mod error;
pub mod pipeline;
pub mod telemetry;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::{CameraMode, PixelFormat};
use serde::{Deserialize, Serialize};

pub use error::{ConfigError, PipelineError, Result};
pub use pipeline::{CameraStatus, ControlMode, Pipeline, PipelineHandle, SwitchCommand};

use crate::detection::MAX_DETECTIONS;
use crate::utils::DeviceSpec;

/// Largest image the frame channel carries by default: 1080p NV12
pub const DEFAULT_FRAME_CAPACITY: usize = 1920 * 1080 * 3 / 2;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub switcher: SwitcherConfig,
    pub pipeline: PipelineConfig,
    pub channels: ChannelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub day_device: DeviceSpec,
    pub night_device: DeviceSpec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub open_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Consecutive failed reads before the pipeline reports `degraded`
    pub max_failed_reads: u32,
    /// Measure the active camera's brightness every this many frames
    pub active_sample_stride: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitcherConfig {
    pub day_to_night_threshold: f64,
    pub night_to_day_threshold: f64,
    pub day_to_night_hold_ms: u64,
    pub night_to_day_hold_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub warmup_frames: u32,
    pub initial_camera: CameraMode,
    pub initial_mode: ControlMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBackendKind {
    InProcess,
    SharedMemory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub backend: ChannelBackendKind,
    /// Directory holding the slot files of the shared-memory backend
    pub shm_dir: PathBuf,
    /// Largest frame image, in bytes
    pub frame_capacity: usize,
    pub max_detections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    pub filter: String,
    pub uptime_timer: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            day_device: DeviceSpec::Index(0),
            night_device: DeviceSpec::Index(1),
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            open_timeout_ms: 2_000,
            read_timeout_ms: 1_000,
            max_failed_reads: 30,
            active_sample_stride: 8,
        }
    }
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            day_to_night_threshold: 40.0,
            night_to_day_threshold: 70.0,
            day_to_night_hold_ms: 10_000,
            night_to_day_hold_ms: 10_000,
            probe_interval_ms: 2_000,
            probe_timeout_ms: 1_000,
            warmup_frames: 3,
            initial_camera: CameraMode::Day,
            initial_mode: ControlMode::Auto,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 100,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: ChannelBackendKind::InProcess,
            shm_dir: PathBuf::from("/dev/shm"),
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            max_detections: MAX_DETECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "petcam=info".into(),
            uptime_timer: true,
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SwitcherConfig {
    pub fn day_to_night_hold(&self) -> Duration {
        Duration::from_millis(self.day_to_night_hold_ms)
    }

    pub fn night_to_day_hold(&self) -> Duration {
        Duration::from_millis(self.night_to_day_hold_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl PipelineConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Config {
    /// Built-in defaults, overlaid by the TOML file at `path` (if any), then
    /// by `PETCAM__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix("PETCAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let s = &self.switcher;
        if !s.day_to_night_threshold.is_finite() || !s.night_to_day_threshold.is_finite() {
            return Err(ConfigError::Invalid("brightness thresholds must be finite".into()));
        }
        if s.day_to_night_threshold >= s.night_to_day_threshold {
            return Err(ConfigError::Invalid(format!(
                "day_to_night_threshold ({}) must be below night_to_day_threshold ({})",
                s.day_to_night_threshold, s.night_to_day_threshold
            )));
        }
        if s.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid("probe_interval_ms must be positive".into()));
        }
        if self.capture.fps == 0 {
            return Err(ConfigError::Invalid("fps must be positive".into()));
        }
        if self.capture.max_failed_reads == 0 {
            return Err(ConfigError::Invalid("max_failed_reads must be positive".into()));
        }
        if self.pipeline.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shutdown_timeout_ms must be positive".into()));
        }
        if self.channels.frame_capacity == 0 || self.channels.max_detections == 0 {
            return Err(ConfigError::Invalid("channel capacities must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.switcher.day_to_night_hold(), Duration::from_secs(10));
        assert_eq!(config.switcher.probe_interval(), Duration::from_secs(2));
        assert_eq!(config.switcher.warmup_frames, 3);
        assert_eq!(config.channels.max_detections, 10);
    }

    #[test]
    fn thresholds_must_leave_a_gap() {
        let mut config = Config::default();
        config.switcher.day_to_night_threshold = 70.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.switcher.day_to_night_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rates_are_rejected() {
        let mut config = Config::default();
        config.capture.fps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.switcher.probe_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[switcher]
day_to_night_threshold = 30
initial_camera = "night"
initial_mode = "manual"

[capture]
night_device = "/dev/video4"

[channels]
backend = "shared_memory"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.switcher.day_to_night_threshold, 30.0);
        assert_eq!(config.switcher.night_to_day_threshold, 70.0);
        assert_eq!(config.switcher.initial_camera, CameraMode::Night);
        assert_eq!(config.switcher.initial_mode, ControlMode::Manual);
        assert_eq!(config.capture.night_device, DeviceSpec::Path("/dev/video4".into()));
        assert_eq!(config.capture.day_device, DeviceSpec::Index(0));
        assert_eq!(config.channels.backend, ChannelBackendKind::SharedMemory);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn invalid_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[switcher]\nnight_to_day_threshold = 10").unwrap();
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
