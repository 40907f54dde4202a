pub mod capture;
pub mod device;
pub mod error;
pub mod permission;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::capture::{Orientation, SessionSettings};
use crate::device::{CaptureType, ConnectFlags, DeviceIdentifier};

pub use capture::{CaptureController, DecodedFrame};
pub use error::{CameraError, DeviceError};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `CAMGATE__CAPTURE__WIDTH=1920`
pub const ENV_PREFIX: &str = "CAMGATE";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSettings,
    pub permission: PermissionSettings,
    pub availability: AvailabilitySettings,
    pub pipeline: PipelineSettings,
}

/// Which device implementation backs the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    V4l2,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub backend: Backend,
    pub device: DeviceIdentifier,
    pub nodes: DeviceNodes,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub orientation: Orientation,
    pub connect_flags: ConnectFlags,
    pub capture_type: CaptureType,
}

/// Device node per identifier, for the V4L2 backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceNodes {
    pub main: String,
    pub computer_vision: String,
}

impl DeviceNodes {
    pub fn path(&self, identifier: DeviceIdentifier) -> &str {
        match identifier {
            DeviceIdentifier::Main => &self.main,
            DeviceIdentifier::ComputerVision => &self.computer_vision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilitySettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Per-subscriber queue depth before frames are dropped
    pub frame_channel_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backend: Backend::V4l2,
            device: DeviceIdentifier::Main,
            nodes: DeviceNodes::default(),
            width: 1280,
            height: 720,
            fps: 30,
            buffer_count: 4,
            orientation: Orientation::Upright,
            connect_flags: ConnectFlags::CameraOnly,
            capture_type: CaptureType::Video,
        }
    }
}

impl Default for DeviceNodes {
    fn default() -> Self {
        Self {
            main: "/dev/video0".into(),
            computer_vision: "/dev/video2".into(),
        }
    }
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl Default for AvailabilitySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval_ms: 1000,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_channel_capacity: 4,
        }
    }
}

impl Config {
    /// Defaults, overlaid with an optional TOML file, overlaid with `CAMGATE__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn permission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.permission.poll_interval_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            availability_attempts: self.availability.max_attempts.max(1),
            availability_interval: Duration::from_millis(self.availability.interval_ms),
            frame_rate: self.capture.fps,
            connect_flags: self.capture.connect_flags,
            capture_type: self.capture.capture_type,
        }
    }
}
