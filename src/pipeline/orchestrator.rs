//! Pipeline orchestration
//!
//! Threads started by [`Pipeline::start`]:
//!
//! - `camera-day` / `camera-night`: one per camera. Only the camera the
//!   publish gate marks active holds its device open and captures; the other
//!   idles until a switch hands it an opened device.
//! - `detector`: runs inference on the freshest frame at its own cadence.
//! - `control`: probes the inactive camera and carries out switches.
//!
//! Switches are decided by the [`CameraSwitchController`] and executed only
//! on the control thread: the target device is opened with a timeout first,
//! and only then does the gate move, so a camera that fails to open never
//! interrupts the feed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::capture::decoder::frame_luma;
use crate::capture::source::open_with_timeout;
use crate::capture::{CameraBackend, CameraLease, CameraMode, DeviceClaims, Frame};
use crate::detection::{Detection, Detector};
use crate::error::{PipelineError, Result, SourceError};
use crate::pipeline::channel::{DetectionChannel, FrameChannel};
use crate::pipeline::gate::{GateOutcome, PublishGate};
use crate::pipeline::probe::BrightnessProbe;
use crate::pipeline::shutdown::{StopSignal, Worker};
use crate::pipeline::switcher::{
    BrightnessSample, CameraStatus, CameraSwitchController, SwitchCommand, Transition,
};
use crate::telemetry::{self, LogContext};
use crate::utils::DeviceSpec;
use crate::Config;

/// Longest the control thread sleeps before rechecking the stop flag.
const CONTROL_POLL: Duration = Duration::from_millis(50);

/// Pause between attempts to claim a device still held by its old owner.
const CLAIM_RETRY: Duration = Duration::from_millis(5);

/// State shared by every pipeline thread and handle
struct Shared {
    frames: Arc<FrameChannel>,
    detections: Arc<DetectionChannel>,
    gate: PublishGate,
    controller: Mutex<CameraSwitchController>,
    claims: Arc<DeviceClaims>,
    handoff: [Mutex<Option<CameraLease>>; 2],
    stop: StopSignal,
    requests: Sender<Transition>,
}

impl Shared {
    fn controller(&self) -> MutexGuard<'_, CameraSwitchController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handoff(&self, camera: CameraMode) -> MutexGuard<'_, Option<CameraLease>> {
        self.handoff[camera.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a transition for the control thread.
    fn request(&self, transition: Transition) {
        if self.requests.send(transition).is_err() {
            warn!("control thread is gone; switch request dropped");
        }
    }
}

/// Cloneable control and status surface for callers outside the pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Apply a switch command. Invalid commands are rejected here with the
    /// state untouched; a valid one returns the status right after it was
    /// applied; the camera change itself follows on the control thread.
    pub fn switch_camera(&self, command: SwitchCommand) -> Result<CameraStatus> {
        let mut controller = self.shared.controller();
        let transition = controller.apply_command(&command, Instant::now())?;
        info!(
            mode = %command.mode,
            camera = ?command.camera,
            reason = ?command.reason,
            "switch command accepted"
        );
        if let Some(transition) = transition {
            self.shared.request(transition);
        }
        Ok(controller.status())
    }

    pub fn get_camera_status(&self) -> CameraStatus {
        self.shared.controller().status()
    }

    pub fn frames(&self) -> Arc<FrameChannel> {
        Arc::clone(&self.shared.frames)
    }

    pub fn detections(&self) -> Arc<DetectionChannel> {
        Arc::clone(&self.shared.detections)
    }
}

/// Outcome of [`Pipeline::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub elapsed: Duration,
    /// Threads abandoned because they missed the shutdown deadline
    pub timed_out: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Owns the channels, the switch controller and every pipeline thread.
pub struct Pipeline {
    config: Config,
    shared: Arc<Shared>,
    requests: Receiver<Transition>,
    backend: Arc<dyn CameraBackend>,
    detector: Option<Box<dyn Detector>>,
    workers: Vec<Worker>,
    state: RunState,
    log: LogContext,
}

impl Pipeline {
    pub fn new(
        config: Config,
        backend: Arc<dyn CameraBackend>,
        detector: Box<dyn Detector>,
    ) -> Result<Self> {
        config.validate()?;

        let frames = Arc::new(FrameChannel::frames(&config.channels)?);
        let detections = Arc::new(DetectionChannel::detections(&config.channels)?);
        let (requests_tx, requests) = flume::unbounded();
        let shared = Arc::new(Shared {
            frames,
            detections,
            gate: PublishGate::new(config.switcher.initial_camera),
            controller: Mutex::new(CameraSwitchController::new(config.switcher.clone())),
            claims: Arc::new(DeviceClaims::new()),
            handoff: [Mutex::new(None), Mutex::new(None)],
            stop: StopSignal::new(),
            requests: requests_tx,
        });

        let log = LogContext::root("petcam");
        log.in_scope(|| {
            info!(
                backend = shared.frames.backend_kind(),
                initial_camera = %config.switcher.initial_camera,
                control_mode = %config.switcher.initial_mode,
                "pipeline created"
            )
        });

        Ok(Self {
            config,
            shared,
            requests,
            backend,
            detector: Some(detector),
            workers: Vec::new(),
            state: RunState::Idle,
            log,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn frames(&self) -> Arc<FrameChannel> {
        Arc::clone(&self.shared.frames)
    }

    pub fn detections(&self) -> Arc<DetectionChannel> {
        Arc::clone(&self.shared.detections)
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Start every pipeline thread. A pipeline runs at most once; if any
    /// thread fails to spawn, the ones already started are stopped again.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RunState::Idle {
            return Err(PipelineError::AlreadyRunning);
        }
        let detector = self.detector.take().ok_or(PipelineError::AlreadyRunning)?;
        self.state = RunState::Running;

        if let Err(e) = self.spawn_workers(detector) {
            self.log
                .in_scope(|| error!("failed to start pipeline: {}", e));
            self.stop();
            return Err(e);
        }

        self.log.in_scope(|| {
            info!(
                threads = self.workers.len(),
                active = %self.shared.gate.active(),
                "pipeline started"
            )
        });
        Ok(())
    }

    fn spawn_workers(&mut self, detector: Box<dyn Detector>) -> Result<()> {
        let capture = &self.config.capture;
        for camera in CameraMode::ALL {
            let (name, device) = match camera {
                CameraMode::Day => ("camera-day", capture.day_device.clone()),
                CameraMode::Night => ("camera-night", capture.night_device.clone()),
            };
            let worker = CaptureLoop {
                camera,
                device,
                backend: Arc::clone(&self.backend),
                shared: Arc::clone(&self.shared),
                frame_interval: capture.frame_interval(),
                open_timeout: capture.open_timeout(),
                read_timeout: capture.read_timeout(),
                max_failed_reads: capture.max_failed_reads,
                sample_stride: capture.active_sample_stride.max(1),
                lease: None,
                sequence: 0,
                failures: 0,
                degraded: false,
            };
            self.workers
                .push(Worker::spawn(name, self.log.child(name), move || worker.run())?);
        }

        let detect = DetectLoop {
            shared: Arc::clone(&self.shared),
            detector,
            interval: self.config.pipeline.detection_interval(),
            max_detections: self.config.channels.max_detections,
        };
        self.workers.push(Worker::spawn(
            "detector",
            self.log.child("detector"),
            move || detect.run(),
        )?);

        let devices = [capture.day_device.clone(), capture.night_device.clone()];
        let control_log = self.log.child("control");
        let control = ControlLoop {
            probe: BrightnessProbe::new(
                Arc::clone(&self.backend),
                devices.clone(),
                Arc::clone(&self.shared.claims),
                capture.open_timeout(),
                self.config.switcher.probe_timeout(),
                control_log.child("probe"),
            ),
            shared: Arc::clone(&self.shared),
            requests: self.requests.clone(),
            backend: Arc::clone(&self.backend),
            devices,
            open_timeout: capture.open_timeout(),
            probe_interval: self.config.switcher.probe_interval(),
            warmup_frames: self.config.switcher.warmup_frames,
        };
        self.workers
            .push(Worker::spawn("control", control_log, move || control.run())?);
        Ok(())
    }

    /// Stop every thread. The gate is closed first, so no frame or detection
    /// is published once this returns; threads that miss the shutdown
    /// deadline are abandoned and listed in the report.
    pub fn stop(&mut self) -> ShutdownReport {
        if self.state != RunState::Running {
            return ShutdownReport::default();
        }
        self.state = RunState::Stopped;

        let started = Instant::now();
        let budget = self.config.pipeline.shutdown_timeout();
        let deadline = started + budget;

        self.shared.gate.close();
        self.shared.stop.trigger();

        let mut report = ShutdownReport::default();
        let _entered = self.log.span().enter();
        for worker in self.workers.drain(..) {
            let name = worker.name();
            if worker.join_until(deadline, budget).is_err() {
                report.timed_out.push(name);
            }
        }
        for camera in CameraMode::ALL {
            if let Some(lease) = self.shared.handoff(camera).take() {
                lease.release();
            }
        }

        report.elapsed = started.elapsed();
        if report.is_clean() {
            info!(elapsed = ?report.elapsed, "pipeline stopped");
        } else {
            error!(
                elapsed = ?report.elapsed,
                abandoned = ?report.timed_out,
                "pipeline stopped with stuck threads"
            );
        }
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture thread of one camera
struct CaptureLoop {
    camera: CameraMode,
    device: DeviceSpec,
    backend: Arc<dyn CameraBackend>,
    shared: Arc<Shared>,
    frame_interval: Duration,
    open_timeout: Duration,
    read_timeout: Duration,
    max_failed_reads: u32,
    sample_stride: u64,
    lease: Option<CameraLease>,
    sequence: u64,
    failures: u32,
    degraded: bool,
}

impl CaptureLoop {
    fn run(mut self) {
        debug!(camera = %self.camera, device = %self.device, "capture thread running");
        while !self.shared.stop.is_stopped() {
            let started = Instant::now();

            if let Some(handed) = self.shared.handoff(self.camera).take() {
                if let Some(old) = self.lease.replace(handed) {
                    old.release();
                }
            }

            if self.shared.gate.active() == self.camera {
                self.tick();
            } else {
                if let Some(lease) = self.lease.take() {
                    debug!(camera = %self.camera, "camera no longer active, releasing device");
                    lease.release();
                }
                // The switch that deactivated us already cleared the status flag
                self.failures = 0;
                self.degraded = false;
            }

            let next = started + self.frame_interval;
            if self.shared.stop.wait(next.saturating_duration_since(Instant::now())) {
                break;
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        debug!(camera = %self.camera, "capture thread exiting");
    }

    fn tick(&mut self) {
        if self.lease.is_none() {
            // Busy while a switch is still handing the device over
            let Some(claim) = self.shared.claims.try_claim(self.camera) else {
                return;
            };
            match open_with_timeout(&self.backend, self.camera, &self.device, self.open_timeout) {
                Ok(handle) => {
                    info!(camera = %self.camera, device = %self.device, "camera opened");
                    self.lease = Some(CameraLease { handle, claim });
                }
                Err(e) => {
                    self.record_failure(e);
                    return;
                }
            }
        }
        let Some(lease) = self.lease.as_mut() else {
            return;
        };

        let raw = match lease.handle.read_frame(self.read_timeout) {
            Ok(raw) => raw,
            Err(e) => {
                self.record_failure(e);
                return;
            }
        };

        self.sequence += 1;
        let luma = if self.sequence % self.sample_stride == 0 {
            frame_luma(&raw).ok()
        } else {
            None
        };
        let frame = Frame::from_raw(raw, self.camera, self.sequence);
        let camera = self.camera.as_str();

        match self.shared.gate.publish(self.camera, frame, &self.shared.frames) {
            Ok(GateOutcome::Published(_)) => {
                metrics::counter!(telemetry::FRAMES_PUBLISHED, "camera" => camera).increment(1);
                self.failures = 0;
                if self.degraded {
                    self.degraded = false;
                    self.shared
                        .controller()
                        .set_capture_degraded(self.camera, false, None);
                    info!(camera, "capture recovered");
                }
                if let Some(value) = luma {
                    metrics::gauge!(telemetry::BRIGHTNESS, "camera" => camera).set(value);
                    let sample = BrightnessSample {
                        camera: self.camera,
                        value,
                        at: Instant::now(),
                    };
                    let transition = self.shared.controller().observe(sample);
                    if let Some(transition) = transition {
                        self.shared.request(transition);
                    }
                }
            }
            Ok(GateOutcome::WarmingUp { remaining }) => {
                metrics::counter!(telemetry::WARMUP_FRAMES_DISCARDED, "camera" => camera)
                    .increment(1);
                debug!(camera, remaining, "discarded warm-up frame");
            }
            Ok(GateOutcome::Inactive) | Ok(GateOutcome::Closed) => {}
            Err(e) => {
                metrics::counter!(telemetry::PUBLISH_REJECTED, "camera" => camera).increment(1);
                warn!(camera, "frame publish rejected: {}", e);
            }
        }
    }

    fn record_failure(&mut self, e: SourceError) {
        self.failures += 1;
        metrics::counter!(telemetry::CAPTURE_FAILURES, "camera" => self.camera.as_str())
            .increment(1);

        if self.failures < self.max_failed_reads {
            debug!(camera = %self.camera, failures = self.failures, "capture failed: {}", e);
            return;
        }
        if !self.degraded {
            self.degraded = true;
            error!(
                camera = %self.camera,
                failures = self.failures,
                "camera keeps failing, serving last good frame: {}",
                e
            );
            self.shared.controller().set_capture_degraded(
                self.camera,
                true,
                Some(format!("{} camera: {}", self.camera, e)),
            );
        }
        if self.failures % self.max_failed_reads == 0 {
            // Reopen on the next tick
            if let Some(lease) = self.lease.take() {
                lease.release();
            }
        }
    }
}

/// Inference thread
struct DetectLoop {
    shared: Arc<Shared>,
    detector: Box<dyn Detector>,
    interval: Duration,
    max_detections: usize,
}

impl DetectLoop {
    fn run(mut self) {
        let mut last_seen = 0;
        while !self.shared.stop.is_stopped() {
            let started = Instant::now();

            if let Some(latest) = self.shared.frames.latest() {
                if latest.sequence != last_seen {
                    last_seen = latest.sequence;
                    self.detect(&latest.value, latest.sequence);
                }
            }

            let next = started + self.interval;
            if self.shared.stop.wait(next.saturating_duration_since(Instant::now())) {
                break;
            }
        }
    }

    fn detect(&mut self, frame: &Frame, frame_sequence: u64) {
        let started = Instant::now();
        let mut boxes = match self.detector.infer(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!(frame_sequence, "{}", e);
                return;
            }
        };
        metrics::histogram!(telemetry::DETECTION_TIME_US)
            .record(started.elapsed().as_micros() as f64);

        if boxes.len() > self.max_detections {
            boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            boxes.truncate(self.max_detections);
        }
        let detection = Detection::new(boxes, frame_sequence);
        match self
            .shared
            .gate
            .publish_if_open(detection, &self.shared.detections)
        {
            Ok(Some(_)) | Ok(None) => {}
            Err(e) => warn!(frame_sequence, "detection publish rejected: {}", e),
        }
    }
}

/// Probe timer and switch executor
struct ControlLoop {
    shared: Arc<Shared>,
    requests: Receiver<Transition>,
    probe: BrightnessProbe,
    backend: Arc<dyn CameraBackend>,
    devices: [DeviceSpec; 2],
    open_timeout: Duration,
    probe_interval: Duration,
    warmup_frames: u32,
}

impl ControlLoop {
    fn run(self) {
        let mut next_probe = Instant::now();
        while !self.shared.stop.is_stopped() {
            if Instant::now() >= next_probe {
                next_probe = Instant::now() + self.probe_interval;
                self.probe_tick();
            }

            let wait = next_probe
                .saturating_duration_since(Instant::now())
                .min(CONTROL_POLL);
            match self.requests.recv_timeout(wait) {
                Ok(transition) => self.execute(transition),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn probe_tick(&self) {
        let inactive = self.shared.controller().active().other();
        if let Some(sample) = self.probe.sample(inactive) {
            let transition = self.shared.controller().observe(sample);
            if let Some(transition) = transition {
                self.execute(transition);
            }
        }
        // Picks up switches whose earlier attempt failed
        let retry = self.shared.controller().poll(Instant::now());
        if let Some(transition) = retry {
            self.execute(transition);
        }
    }

    fn execute(&self, transition: Transition) {
        if self.shared.stop.is_stopped() {
            return;
        }
        if self.shared.controller().pending().map(|p| p.id) != Some(transition.id) {
            debug!(id = transition.id, "switch superseded before it started");
            return;
        }

        info!(
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "switching camera"
        );
        let lease = self.open_target(transition.to);

        let mut controller = self.shared.controller();
        match lease {
            Ok(lease) => {
                if !controller.complete(&transition) {
                    drop(controller);
                    debug!(id = transition.id, "switch superseded while opening");
                    lease.release();
                    return;
                }
                // Gate first: a target thread that grabs the lease must
                // already see itself active, or it would release it again
                self.shared.gate.switch_to(transition.to, self.warmup_frames);
                if let Some(stale) = self.shared.handoff(transition.to).replace(lease) {
                    stale.release();
                }
                drop(controller);

                metrics::counter!(telemetry::CAMERA_SWITCHES, "to" => transition.to.as_str())
                    .increment(1);
                info!(active = %transition.to, "camera switched");
            }
            Err(e) => {
                controller.fail(&transition, &e, Instant::now());
                drop(controller);

                metrics::counter!(telemetry::SWITCH_FAILURES, "to" => transition.to.as_str())
                    .increment(1);
                warn!(
                    to = %transition.to,
                    retry_in = ?self.probe_interval,
                    "switch failed, staying on {}: {}",
                    transition.from,
                    e
                );
            }
        }
    }

    /// Claim and open `camera`, waiting up to the open timeout for a previous
    /// owner to let go of the device.
    fn open_target(&self, camera: CameraMode) -> std::result::Result<CameraLease, SourceError> {
        let device = &self.devices[camera.index()];
        let deadline = Instant::now() + self.open_timeout;
        let claim = loop {
            if let Some(claim) = self.shared.claims.try_claim(camera) {
                break claim;
            }
            if Instant::now() >= deadline || self.shared.stop.wait(CLAIM_RETRY) {
                return Err(SourceError::Open {
                    device: device.to_string(),
                    reason: "device is still in use".into(),
                });
            }
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let handle = open_with_timeout(&self.backend, camera, device, remaining)?;
        Ok(CameraLease { handle, claim })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::detection::SyntheticDetector;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.capture.fps = 200;
        config.pipeline.detection_interval_ms = 5;
        config.switcher.probe_interval_ms = 20;
        config
    }

    fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn start_twice_is_rejected() {
        let backend: Arc<dyn CameraBackend> = Arc::new(SyntheticBackend::default());
        let mut pipeline =
            Pipeline::new(fast_config(), backend, Box::new(SyntheticDetector::default())).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        assert!(pipeline.stop().is_clean());
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
    }

    #[test]
    fn inactive_camera_holds_no_device() {
        let backend = Arc::new(SyntheticBackend::default());
        let dyn_backend: Arc<dyn CameraBackend> = backend.clone();
        let mut config = fast_config();
        // Keep the probe out of the way
        config.switcher.probe_interval_ms = 60_000;
        let mut pipeline =
            Pipeline::new(config, dyn_backend, Box::new(SyntheticDetector::default())).unwrap();
        pipeline.start().unwrap();

        let frames = pipeline.frames();
        assert!(wait_for(Duration::from_secs(2), || frames.latest().is_some()));
        assert_eq!(backend.camera(CameraMode::Day).open_handles(), 1);
        // The single startup probe has closed its handle again
        assert!(wait_for(Duration::from_secs(2), || {
            backend.camera(CameraMode::Night).open_handles() == 0
        }));

        pipeline.stop();
        assert_eq!(backend.camera(CameraMode::Day).open_handles(), 0);
    }

    #[test]
    fn switched_camera_uses_the_device_opened_for_the_switch() {
        let backend = Arc::new(SyntheticBackend::default());
        let dyn_backend: Arc<dyn CameraBackend> = backend.clone();
        let mut config = fast_config();
        config.switcher.probe_interval_ms = 60_000;
        let mut pipeline =
            Pipeline::new(config, dyn_backend, Box::new(SyntheticDetector::default())).unwrap();
        pipeline.start().unwrap();
        let handle = pipeline.handle();
        let frames = pipeline.frames();
        let night = backend.camera(CameraMode::Night);
        let day = backend.camera(CameraMode::Day);

        // Let the startup sample of the night camera finish first
        assert!(wait_for(Duration::from_secs(2), || {
            night.opens() >= 1 && night.open_handles() == 0
        }));

        for target in [CameraMode::Night, CameraMode::Day, CameraMode::Night] {
            let camera = backend.camera(target);
            let before = camera.opens();
            handle.switch_camera(SwitchCommand::manual(target)).unwrap();
            assert!(wait_for(Duration::from_secs(2), || {
                frames.latest().map(|p| p.value.meta.camera) == Some(target)
            }));
            std::thread::sleep(Duration::from_millis(30));
            // Exactly the open done by the switch; no release and reopen
            assert_eq!(camera.opens(), before + 1, "{target} reopened");
            assert_eq!(camera.open_handles(), 1);
        }

        pipeline.stop();
        assert_eq!(day.open_handles(), 0);
        assert_eq!(night.open_handles(), 0);
    }

    #[test]
    fn status_is_served_before_start() {
        let backend: Arc<dyn CameraBackend> = Arc::new(SyntheticBackend::default());
        let pipeline =
            Pipeline::new(Config::default(), backend, Box::new(SyntheticDetector::default()))
                .unwrap();
        let status = pipeline.handle().get_camera_status();
        assert_eq!(status.active_camera, CameraMode::Day);
        assert!(!status.degraded);
        assert_eq!(status.last_switch_reason, "initial");
    }
}
