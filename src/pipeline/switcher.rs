//! Day/night camera switching with hysteresis
//!
//! The controller is a plain state machine: it is fed brightness samples and
//! commands together with the time they happened and answers with the
//! [`Transition`] it wants, if any. Opening cameras and moving the publish
//! gate is the orchestrator's job; it reports back through
//! [`CameraSwitchController::complete`] or [`CameraSwitchController::fail`].
//!
//! Only the day camera's brightness drives decisions. While the day camera
//! is active its own stream is sampled; while the night camera is active the
//! probe samples the day camera. Night-camera samples are kept for status.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::capture::CameraMode;
use crate::error::{PipelineError, SourceError};
use crate::SwitcherConfig;

/// Who decides the active camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Auto,
    Manual,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::Auto => "auto",
            ControlMode::Manual => "manual",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ControlMode::Auto),
            "manual" => Ok(ControlMode::Manual),
            other => Err(format!("mode must be 'auto' or 'manual', got '{other}'")),
        }
    }
}

/// Coarse brightness classification reported with the status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrightnessZone {
    Dark,
    Dim,
    Normal,
    Bright,
}

impl BrightnessZone {
    pub fn classify(value: f64) -> Self {
        if value < 50.0 {
            BrightnessZone::Dark
        } else if value < 70.0 {
            BrightnessZone::Dim
        } else if value < 180.0 {
            BrightnessZone::Normal
        } else {
            BrightnessZone::Bright
        }
    }
}

/// One mean-luma reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessSample {
    pub camera: CameraMode,
    pub value: f64,
    pub at: Instant,
}

/// Brightness history of one camera
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BrightnessStat {
    pub latest: Option<f64>,
    pub average: Option<f64>,
    pub samples: u64,
    pub updated: Option<SystemTime>,
}

impl BrightnessStat {
    fn record(&mut self, value: f64) {
        self.samples += 1;
        let previous = self.average.unwrap_or(value);
        self.average = Some(previous + (value - previous) / self.samples as f64);
        self.latest = Some(value);
        self.updated = Some(SystemTime::now());
    }
}

/// A camera change the controller wants carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: u64,
    pub from: CameraMode,
    pub to: CameraMode,
    pub reason: String,
}

/// External switch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCommand {
    pub mode: ControlMode,
    #[serde(default)]
    pub camera: Option<CameraMode>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SwitchCommand {
    pub fn auto() -> Self {
        Self {
            mode: ControlMode::Auto,
            camera: None,
            reason: None,
        }
    }

    pub fn manual(camera: CameraMode) -> Self {
        Self {
            mode: ControlMode::Manual,
            camera: Some(camera),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Build a command from loosely typed input such as CLI or HTTP fields.
    pub fn parse(mode: &str, camera: Option<&str>, reason: Option<&str>) -> Result<Self, PipelineError> {
        let mode = mode
            .parse::<ControlMode>()
            .map_err(PipelineError::InvalidManualCommand)?;
        let camera = camera
            .map(str::parse::<CameraMode>)
            .transpose()
            .map_err(PipelineError::InvalidManualCommand)?;
        let command = Self {
            mode,
            camera,
            reason: reason.map(str::to_owned),
        };
        command.validate()?;
        Ok(command)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        match (self.mode, self.camera) {
            (ControlMode::Manual, None) => Err(PipelineError::InvalidManualCommand(
                "manual mode requires a camera".into(),
            )),
            (ControlMode::Auto, Some(camera)) => Err(PipelineError::InvalidManualCommand(format!(
                "auto mode does not take a camera (got '{camera}')"
            ))),
            _ => Ok(()),
        }
    }
}

/// Status snapshot served to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub active_camera: CameraMode,
    pub control_mode: ControlMode,
    pub manual_target: Option<CameraMode>,
    pub day_brightness: Option<f64>,
    pub night_brightness: Option<f64>,
    /// Time the day camera has stayed below the day-to-night threshold
    pub day_hold_elapsed: Duration,
    /// Time the day camera has stayed above the night-to-day threshold
    pub night_hold_elapsed: Duration,
    pub degraded: bool,
    pub day: BrightnessStat,
    pub night: BrightnessStat,
    pub day_zone: Option<BrightnessZone>,
    pub day_to_night_threshold: f64,
    pub night_to_day_threshold: f64,
    pub day_to_night_hold: Duration,
    pub night_to_day_hold: Duration,
    pub last_switch_reason: String,
    pub switch_count: u64,
    pub transition_pending: bool,
    pub last_error: Option<String>,
}

/// Time since the first sample of an unbroken qualifying run
#[derive(Debug, Default, Clone, Copy)]
struct HoldTimer {
    since: Option<Instant>,
    elapsed: Duration,
}

impl HoldTimer {
    fn qualify(&mut self, at: Instant) -> Duration {
        let since = *self.since.get_or_insert(at);
        self.elapsed = at.saturating_duration_since(since);
        self.elapsed
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct CameraSwitchController {
    config: SwitcherConfig,
    active: CameraMode,
    mode: ControlMode,
    manual_target: Option<CameraMode>,
    brightness: [BrightnessStat; 2],
    below: HoldTimer,
    above: HoldTimer,
    pending: Option<Transition>,
    next_id: u64,
    retry_at: Option<Instant>,
    transition_failed: bool,
    capture_degraded: bool,
    last_error: Option<String>,
    last_switch_reason: String,
    switch_count: u64,
}

impl CameraSwitchController {
    pub fn new(config: SwitcherConfig) -> Self {
        let manual_target = match config.initial_mode {
            ControlMode::Manual => Some(config.initial_camera),
            ControlMode::Auto => None,
        };
        Self {
            active: config.initial_camera,
            mode: config.initial_mode,
            manual_target,
            config,
            brightness: [BrightnessStat::default(); 2],
            below: HoldTimer::default(),
            above: HoldTimer::default(),
            pending: None,
            next_id: 1,
            retry_at: None,
            transition_failed: false,
            capture_degraded: false,
            last_error: None,
            last_switch_reason: "initial".into(),
            switch_count: 0,
        }
    }

    pub fn active(&self) -> CameraMode {
        self.active
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn pending(&self) -> Option<&Transition> {
        self.pending.as_ref()
    }

    /// Record a brightness reading and return the transition it triggers.
    pub fn observe(&mut self, sample: BrightnessSample) -> Option<Transition> {
        if !sample.value.is_finite() {
            return None;
        }
        self.brightness[sample.camera.index()].record(sample.value);
        if sample.camera != CameraMode::Day {
            return None;
        }

        match self.mode {
            ControlMode::Manual => self.poll(sample.at),
            ControlMode::Auto => {
                match self.active {
                    CameraMode::Day => {
                        if sample.value < self.config.day_to_night_threshold {
                            self.below.qualify(sample.at);
                        } else {
                            self.below.reset();
                        }
                    }
                    CameraMode::Night => {
                        if sample.value > self.config.night_to_day_threshold {
                            self.above.qualify(sample.at);
                        } else {
                            self.above.reset();
                        }
                    }
                }
                self.poll(sample.at)
            }
        }
    }

    /// Transition that is due at `now`, if none is already in flight and any
    /// retry back-off has passed. Hold timers only move on samples, so polling
    /// never advances them.
    pub fn poll(&mut self, now: Instant) -> Option<Transition> {
        if self.pending.is_some() {
            return None;
        }
        if matches!(self.retry_at, Some(at) if now < at) {
            return None;
        }

        let (to, reason) = match self.mode {
            ControlMode::Manual => match self.manual_target {
                Some(target) if target != self.active => (target, "manual".to_string()),
                _ => return None,
            },
            ControlMode::Auto => match self.active {
                CameraMode::Day if self.below.since.is_some()
                    && self.below.elapsed >= self.config.day_to_night_hold() =>
                {
                    (CameraMode::Night, "brightness_low".to_string())
                }
                CameraMode::Night if self.above.since.is_some()
                    && self.above.elapsed >= self.config.night_to_day_hold() =>
                {
                    (CameraMode::Day, "brightness_high".to_string())
                }
                _ => return None,
            },
        };
        Some(self.begin(to, reason))
    }

    /// Apply an external command. Invalid commands leave every field as it was.
    pub fn apply_command(&mut self, command: &SwitchCommand, now: Instant) -> Result<Option<Transition>, PipelineError> {
        command.validate()?;

        self.below.reset();
        self.above.reset();
        self.retry_at = None;
        // A newer command supersedes whatever was being opened
        self.pending = None;

        match (command.mode, command.camera) {
            (ControlMode::Manual, Some(camera)) => {
                self.mode = ControlMode::Manual;
                self.manual_target = Some(camera);
                if camera == self.active {
                    self.last_switch_reason = command.reason.clone().unwrap_or_else(|| "manual".into());
                    self.transition_failed = false;
                    self.last_error = None;
                    return Ok(None);
                }
                let reason = command.reason.clone().unwrap_or_else(|| "manual".into());
                Ok(Some(self.begin(camera, reason)))
            }
            _ => {
                self.mode = ControlMode::Auto;
                self.manual_target = None;
                self.last_switch_reason = command.reason.clone().unwrap_or_else(|| "auto-resume".into());
                Ok(self.poll(now))
            }
        }
    }

    /// The target camera of `transition` is open and now active. Returns
    /// false if the transition was superseded in the meantime.
    pub fn complete(&mut self, transition: &Transition) -> bool {
        if self.pending.as_ref().map(|p| p.id) != Some(transition.id) {
            return false;
        }
        self.pending = None;
        self.active = transition.to;
        self.retry_at = None;
        self.transition_failed = false;
        // Read failures belonged to the camera just deactivated
        self.capture_degraded = false;
        self.last_error = None;
        self.below.reset();
        self.above.reset();
        self.last_switch_reason = transition.reason.clone();
        self.switch_count += 1;
        true
    }

    /// The target camera could not be opened; stay put and retry no sooner
    /// than one probe interval from `now`.
    pub fn fail(&mut self, transition: &Transition, error: &SourceError, now: Instant) {
        if self.pending.as_ref().map(|p| p.id) != Some(transition.id) {
            return;
        }
        self.pending = None;
        self.retry_at = Some(now + self.config.probe_interval());
        self.transition_failed = true;
        self.last_error = Some(format!("switch to {} failed: {}", transition.to, error));
    }

    /// Mark whether the active camera has exhausted its failed-read budget.
    /// Record the capture health of `camera`. Reports from a camera that is
    /// no longer active are ignored.
    pub fn set_capture_degraded(
        &mut self,
        camera: CameraMode,
        degraded: bool,
        error: Option<String>,
    ) {
        if camera != self.active {
            return;
        }
        self.capture_degraded = degraded;
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub fn status(&self) -> CameraStatus {
        let day = self.brightness[CameraMode::Day.index()];
        let night = self.brightness[CameraMode::Night.index()];
        CameraStatus {
            active_camera: self.active,
            control_mode: self.mode,
            manual_target: self.manual_target,
            day_brightness: day.latest,
            night_brightness: night.latest,
            day_hold_elapsed: self.below.elapsed,
            night_hold_elapsed: self.above.elapsed,
            degraded: self.capture_degraded || self.transition_failed,
            day,
            night,
            day_zone: day.latest.map(BrightnessZone::classify),
            day_to_night_threshold: self.config.day_to_night_threshold,
            night_to_day_threshold: self.config.night_to_day_threshold,
            day_to_night_hold: self.config.day_to_night_hold(),
            night_to_day_hold: self.config.night_to_day_hold(),
            last_switch_reason: self.last_switch_reason.clone(),
            switch_count: self.switch_count,
            transition_pending: self.pending.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    fn begin(&mut self, to: CameraMode, reason: String) -> Transition {
        let transition = Transition {
            id: self.next_id,
            from: self.active,
            to,
            reason,
        };
        self.next_id += 1;
        self.pending = Some(transition.clone());
        transition
    }
}
