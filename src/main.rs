//! Petcam day/night pipeline runner
//!
//! Runs the full pipeline on synthetic cameras whose scene brightness slowly
//! swings between night and day, so switching can be watched in the logs.
//! Set `PETCAM_CONFIG` to a TOML file to override the defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use petcam::capture::{CameraBackend, CameraMode, SyntheticBackend};
use petcam::detection::SyntheticDetector;
use petcam::{telemetry, Config, Pipeline};

/// Length of one full dark-bright-dark cycle of the synthetic scene
const RAMP_PERIOD: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::var_os("PETCAM_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    telemetry::init_tracing(&config.logging).map_err(|e| eyre!(e))?;

    info!("Petcam launching...");
    if let Some(path) = &config_path {
        info!("Using configuration from {}", path.display());
    }

    let (backend, synthetic) = select_backend(&config);
    let detector = Box::new(SyntheticDetector::new(3, Duration::from_millis(20)));
    let mut pipeline = Pipeline::new(config, backend, detector)?;
    let handle = pipeline.handle();
    pipeline.start()?;

    if let Some(synthetic) = synthetic {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let phase = (started.elapsed().as_secs_f64() / RAMP_PERIOD.as_secs_f64()).fract();
                // Triangle wave: 150 at the start, 10 half way through
                let level = 10.0 + 140.0 * (2.0 * phase - 1.0).abs();
                synthetic.camera(CameraMode::Day).set_brightness(level);
            }
        });
    }

    let status_handle = handle.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let status = status_handle.get_camera_status();
            let frames = status_handle.frames();
            let detections = status_handle.detections();
            let frame = frames.latest();
            let detection = detections.latest();
            info!(
                active = %status.active_camera,
                mode = %status.control_mode,
                day = ?status.day_brightness,
                night = ?status.night_brightness,
                day_hold = ?status.day_hold_elapsed,
                night_hold = ?status.night_hold_elapsed,
                degraded = status.degraded,
                switches = status.switch_count,
                reason = %status.last_switch_reason,
                frame_seq = frame.as_ref().map(|f| f.sequence),
                frame_age = ?frame.as_ref().map(|f| f.value.age()),
                detection_for = detection.as_ref().map(|d| d.value.frame_sequence),
                "status"
            );
            if let Some(frame) = &frame {
                if frame.value.age() > Duration::from_secs(2) {
                    warn!(age = ?frame.value.age(), "no fresh frames");
                }
            }
            if let (Some(frame), Some(detection)) = (&frame, &detection) {
                let skew = detection.value.skew_from(&frame.value);
                if skew > Duration::from_secs(1) {
                    warn!(?skew, "detections are lagging behind frames");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    let report = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    if !report.is_clean() {
        warn!(abandoned = ?report.timed_out, "some threads did not stop in time");
    }

    info!("Petcam shut down in {:?}", report.elapsed);
    Ok(())
}

/// Hardware cameras when built with `v4l2` and `PETCAM_CAMERAS=v4l2`,
/// synthetic ones otherwise.
fn select_backend(config: &Config) -> (Arc<dyn CameraBackend>, Option<Arc<SyntheticBackend>>) {
    #[cfg(feature = "v4l2")]
    {
        if std::env::var("PETCAM_CAMERAS").as_deref() == Ok("v4l2") {
            info!("Using V4L2 cameras");
            match petcam::capture::V4l2Backend::discover() {
                Some((day, night)) => info!(%day, %night, "capture devices found"),
                None => warn!("fewer than two capture devices found"),
            }
            let backend: Arc<dyn CameraBackend> =
                Arc::new(petcam::capture::V4l2Backend::new(&config.capture));
            return (backend, None);
        }
    }

    let synthetic = Arc::new(SyntheticBackend::new(
        config.capture.width.min(640),
        config.capture.height.min(480),
    ));
    info!("Using synthetic cameras");
    let backend: Arc<dyn CameraBackend> = synthetic.clone();
    (backend, Some(synthetic))
}
