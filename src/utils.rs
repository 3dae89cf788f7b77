use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Camera device given either as an index or as a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    Index(u32),
    Path(PathBuf),
}

impl DeviceSpec {
    /// Filesystem path of the device node, `/dev/videoN` for an index.
    pub fn path(&self) -> PathBuf {
        match self {
            DeviceSpec::Index(i) => PathBuf::from(format!("/dev/video{}", i)),
            DeviceSpec::Path(p) => p.clone(),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Index(i) => write!(f, "#{}", i),
            DeviceSpec::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<u32>() {
            Ok(index) => DeviceSpec::Index(index),
            Err(_) => DeviceSpec::Path(PathBuf::from(s.trim())),
        })
    }
}

/// Auto-detect capture devices, in index order
#[cfg(feature = "v4l2")]
pub fn detect_capture_devices() -> Vec<DeviceSpec> {
    use std::path::Path;
    use tracing::{debug, info};
    use v4l::{capability::Flags, Device};

    info!("Auto-detecting capture devices...");

    let mut found = Vec::new();
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        if let Ok(dev) = Device::with_path(&path) {
            if let Ok(caps) = dev.query_caps() {
                // Check for capture capability
                if caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                    info!("Found capture device: {} - {}", path, caps.card);
                    found.push(DeviceSpec::Index(i));
                } else {
                    debug!("Skipping {}: no capture capability", path);
                }
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_are_indices() {
        assert_eq!("1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Index(1));
        assert_eq!(
            DeviceSpec::Index(2).path(),
            PathBuf::from("/dev/video2")
        );
    }

    #[test]
    fn other_strings_are_paths() {
        let spec: DeviceSpec = "/dev/v4l/by-id/usb-cam".parse().unwrap();
        assert_eq!(spec.path(), PathBuf::from("/dev/v4l/by-id/usb-cam"));
    }
}
