//! Device connection and capability subsystem

pub mod simulated;
pub mod v4l2;

pub use simulated::{SimulatedDriver, SimulatedStats};
pub use v4l2::V4l2Driver;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{PixelFormat, RawFrameBuffer, ResultExtras};
use crate::capture::selector::{nearest_capability, StreamCapability};
use crate::error::DeviceResult;

/// Which physical camera a session targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceIdentifier {
    /// World-facing main camera
    Main,
    /// Computer-vision sensor
    ComputerVision,
}

/// Connection mode passed to the driver; only direct camera access is supported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConnectFlags {
    #[default]
    CameraOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectContext {
    pub identifier: DeviceIdentifier,
    pub flags: ConnectFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureType {
    Image,
    #[default]
    Video,
    Preview,
}

/// One configured output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub capability: StreamCapability,
    pub output_format: PixelFormat,
}

/// Configuration handed to the device; immutable once submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub frame_rate: u32,
    pub streams: Vec<StreamConfig>,
}

impl CaptureConfig {
    pub fn single(capability: StreamCapability, frame_rate: u32) -> Self {
        Self {
            frame_rate,
            streams: vec![StreamConfig {
                capability,
                output_format: capability.format,
            }],
        }
    }
}

/// Frame-arrival callback, invoked on the device's delivery thread
pub type FrameCallback = Arc<dyn Fn(&RawFrameBuffer<'_>, &ResultExtras) + Send + Sync>;

/// Entry point of the driver/SDK
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// `Err` means the query itself failed; `Ok(false)` that the device is busy or absent
    async fn availability(&self, identifier: DeviceIdentifier) -> DeviceResult<bool>;

    async fn connect(&self, context: ConnectContext) -> DeviceResult<Box<dyn CameraHandle>>;
}

/// A connected device, exclusively owned by the session
#[async_trait]
pub trait CameraHandle: Send + Sync {
    async fn stream_capabilities(&mut self, capture_type: CaptureType)
        -> DeviceResult<Vec<StreamCapability>>;

    /// Device ranking of `available` against a target resolution
    fn best_fit(
        &self,
        available: &[StreamCapability],
        width: u32,
        height: u32,
    ) -> Option<StreamCapability> {
        nearest_capability(available, width, height)
    }

    async fn prepare(&mut self, config: &CaptureConfig) -> DeviceResult<()>;

    async fn pre_capture_aeawb(&mut self) -> DeviceResult<()>;

    async fn start_capture(&mut self) -> DeviceResult<()>;

    async fn stop_capture(&mut self) -> DeviceResult<()>;

    /// Install or clear the frame callback. Once a clear returns, the callback
    /// is not running and will not be invoked again.
    fn set_frame_callback(&mut self, callback: Option<FrameCallback>);

    /// Release the device. The handle is dropped afterwards whatever the result.
    async fn disconnect(&mut self) -> DeviceResult<()>;
}
