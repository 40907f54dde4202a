//! Error types for the capture session and device layer

use thiserror::Error;

/// Failures surfaced by the capture session.
///
/// Every stage of the start sequence maps onto exactly one variant; the
/// session reports them through the `on_started` callback rather than letting
/// them escape to the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("a start sequence is already in flight")]
    AlreadyInitializing,

    #[error("device unavailable after {attempts} availability checks")]
    DeviceUnavailable { attempts: u32 },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("device reported no stream capabilities")]
    NoCapabilityAvailable,

    #[error("capture prepare failed: {0}")]
    PrepareFailed(String),

    #[error("capture start failed: {0}")]
    CaptureStartFailed(String),

    #[error("invalid frame geometry: {0}")]
    InvalidFrameGeometry(String),
}

/// Errors reported by a device driver or handle
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device rejected command: {0}")]
    Rejected(String),

    #[error("capture has not been prepared")]
    NotPrepared,
}

pub type CameraResult<T> = Result<T, CameraError>;
pub type DeviceResult<T> = Result<T, DeviceError>;
