//! Error kinds shared across the pipeline

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a camera source capability.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("failed to open camera {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("no frame within {0:?}")]
    ReadTimeout(Duration),

    #[error("frame read failed: {0}")]
    Read(String),
}

/// Failures of a single-slot channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("record of {len} bytes exceeds slot capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("shared slot is incompatible: {0}")]
    Incompatible(String),

    #[error("shared slot record is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
#[error("inference failed: {0}")]
pub struct DetectorError(pub String);

/// Top-level pipeline error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid switch command: {0}")]
    InvalidManualCommand(String),

    #[error("{component} thread did not exit within {timeout:?}")]
    ThreadJoinTimeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("failed to spawn {component} thread: {source}")]
    Spawn {
        component: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline is already running")]
    AlreadyRunning,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
