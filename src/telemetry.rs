//! Logging context and metric names
//!
//! Components never reach for process-wide logger state. Each one is handed a
//! [`LogContext`], a span tagged with the component name, and logs inside it.
//! Installing a subscriber is left to the binary.

use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::LoggingConfig;

pub const FRAMES_PUBLISHED: &str = "petcam_frames_published_total";
pub const WARMUP_FRAMES_DISCARDED: &str = "petcam_warmup_frames_discarded_total";
pub const PUBLISH_REJECTED: &str = "petcam_publish_rejected_total";
pub const CAPTURE_FAILURES: &str = "petcam_capture_failures_total";
pub const PROBE_FAILURES: &str = "petcam_probe_failures_total";
pub const CAMERA_SWITCHES: &str = "petcam_camera_switches_total";
pub const SWITCH_FAILURES: &str = "petcam_camera_switch_failures_total";
pub const BRIGHTNESS: &str = "petcam_brightness";
pub const DETECTION_TIME_US: &str = "petcam_detection_time_us";

/// Span-backed logging context held by a pipeline component
#[derive(Clone, Debug)]
pub struct LogContext {
    component: &'static str,
    span: Span,
}

impl LogContext {
    /// Root context for one pipeline instance.
    pub fn root(name: &'static str) -> Self {
        Self {
            component: name,
            span: tracing::info_span!("pipeline", name),
        }
    }

    /// Context for a component nested under this one.
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            component,
            span: tracing::info_span!(parent: &self.span, "component", name = component),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn in_scope<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.span.in_scope(f)
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over the configured
/// filter when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    if config.uptime_timer {
        builder
            .with_timer(tracing_subscriber::fmt::time::uptime())
            .try_init()?;
    } else {
        builder.try_init()?;
    }
    Ok(())
}
