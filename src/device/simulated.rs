//! In-process camera with a scriptable lifecycle

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    CameraDriver, CameraHandle, CaptureConfig, CaptureType, ConnectContext, DeviceIdentifier,
    FrameCallback,
};
use crate::capture::frame::{PixelFormat, RawFrameBuffer, ResultExtras};
use crate::capture::selector::{nearest_capability, StreamCapability};
use crate::error::{DeviceError, DeviceResult};

/// Padding byte written after each row of a simulated frame
pub const PADDING_BYTE: u8 = 0xEE;

/// Behaviour of the simulated camera
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    pub capabilities: Vec<StreamCapability>,
    /// Availability checks answered "busy" before the device shows up; `None` never
    pub available_after: Option<u64>,
    pub fail_availability_query: bool,
    pub fail_connect: bool,
    pub fail_prepare: bool,
    pub fail_aeawb: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_disconnect: bool,
    /// Whether the device ranking finds a match
    pub ranks_capabilities: bool,
    /// Bytes of alignment padding after every row
    pub row_padding: u32,
    pub frame_interval: Duration,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self {
            capabilities: vec![
                StreamCapability {
                    width: 1280,
                    height: 720,
                    format: PixelFormat::Rgba32,
                },
                StreamCapability {
                    width: 1920,
                    height: 1080,
                    format: PixelFormat::Rgba32,
                },
            ],
            available_after: Some(0),
            fail_availability_query: false,
            fail_connect: false,
            fail_prepare: false,
            fail_aeawb: false,
            fail_start: false,
            fail_stop: false,
            fail_disconnect: false,
            ranks_capabilities: true,
            row_padding: 64,
            frame_interval: Duration::from_millis(33),
        }
    }
}

/// Call counters observed by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub availability_checks: u64,
    pub connects: u64,
    pub prepares: u64,
    pub starts: u64,
    pub stops: u64,
    pub callback_clears: u64,
    pub disconnects: u64,
    pub frames_delivered: u64,
    pub live_handles: i64,
}

#[derive(Default)]
struct Counters {
    availability_checks: AtomicU64,
    connects: AtomicU64,
    prepares: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
    callback_clears: AtomicU64,
    disconnects: AtomicU64,
    frames_delivered: AtomicU64,
    live_handles: AtomicI64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

struct Shared {
    camera: SimulatedCamera,
    counters: Counters,
}

#[derive(Clone)]
pub struct SimulatedDriver {
    shared: Arc<Shared>,
}

impl SimulatedDriver {
    pub fn new(camera: SimulatedCamera) -> Self {
        Self {
            shared: Arc::new(Shared {
                camera,
                counters: Counters::default(),
            }),
        }
    }

    pub fn stats(&self) -> SimulatedStats {
        let c = &self.shared.counters;
        SimulatedStats {
            availability_checks: c.availability_checks.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            prepares: c.prepares.load(Ordering::Relaxed),
            starts: c.starts.load(Ordering::Relaxed),
            stops: c.stops.load(Ordering::Relaxed),
            callback_clears: c.callback_clears.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            live_handles: c.live_handles.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CameraDriver for SimulatedDriver {
    async fn availability(&self, identifier: DeviceIdentifier) -> DeviceResult<bool> {
        let checks = bump(&self.shared.counters.availability_checks);
        if self.shared.camera.fail_availability_query {
            return Err(DeviceError::Rejected("availability query failed".into()));
        }
        let available = matches!(self.shared.camera.available_after, Some(n) if checks > n);
        debug!("Simulated {:?} availability check {}: {}", identifier, checks, available);
        Ok(available)
    }

    async fn connect(&self, context: ConnectContext) -> DeviceResult<Box<dyn CameraHandle>> {
        bump(&self.shared.counters.connects);
        if self.shared.camera.fail_connect {
            return Err(DeviceError::Rejected("connect refused".into()));
        }
        info!("Simulated camera connected: {:?}", context);
        self.shared.counters.live_handles.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimulatedHandle {
            shared: Arc::clone(&self.shared),
            prepared: None,
            callback: Arc::new(Mutex::new(None)),
            delivery: None,
        }))
    }
}

struct SimulatedHandle {
    shared: Arc<Shared>,
    prepared: Option<StreamCapability>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    delivery: Option<JoinHandle<()>>,
}

impl SimulatedHandle {
    /// Rows filled with `row % 251`, followed by padding bytes
    fn render(capability: StreamCapability, row_padding: u32) -> (Bytes, u32) {
        let row_bytes = capability.width as usize * capability.format.bytes_per_pixel();
        let row_stride = row_bytes + row_padding as usize;
        let mut buf = BytesMut::with_capacity(row_stride * capability.height as usize);
        for row in 0..capability.height as usize {
            buf.resize(buf.len() + row_bytes, (row % 251) as u8);
            buf.resize(buf.len() + row_padding as usize, PADDING_BYTE);
        }
        (buf.freeze(), row_stride as u32)
    }
}

#[async_trait]
impl CameraHandle for SimulatedHandle {
    async fn stream_capabilities(
        &mut self,
        _capture_type: CaptureType,
    ) -> DeviceResult<Vec<StreamCapability>> {
        Ok(self.shared.camera.capabilities.clone())
    }

    fn best_fit(
        &self,
        available: &[StreamCapability],
        width: u32,
        height: u32,
    ) -> Option<StreamCapability> {
        if self.shared.camera.ranks_capabilities {
            nearest_capability(available, width, height)
        } else {
            None
        }
    }

    async fn prepare(&mut self, config: &CaptureConfig) -> DeviceResult<()> {
        bump(&self.shared.counters.prepares);
        if self.shared.camera.fail_prepare {
            return Err(DeviceError::Rejected("prepare failed".into()));
        }
        let stream = config
            .streams
            .first()
            .ok_or_else(|| DeviceError::Unsupported("no streams configured".into()))?;
        self.prepared = Some(stream.capability);
        Ok(())
    }

    async fn pre_capture_aeawb(&mut self) -> DeviceResult<()> {
        if self.shared.camera.fail_aeawb {
            return Err(DeviceError::Rejected("AE/AWB did not converge".into()));
        }
        Ok(())
    }

    async fn start_capture(&mut self) -> DeviceResult<()> {
        bump(&self.shared.counters.starts);
        let capability = self.prepared.ok_or(DeviceError::NotPrepared)?;
        if self.shared.camera.fail_start {
            return Err(DeviceError::Rejected("start refused".into()));
        }

        let (image, row_stride) = Self::render(capability, self.shared.camera.row_padding);
        let interval = self.shared.camera.frame_interval;
        let callback = Arc::clone(&self.callback);
        let shared = Arc::clone(&self.shared);

        self.delivery = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut frame_number = 0u64;
            loop {
                ticker.tick().await;
                let guard = callback.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(deliver) = guard.as_ref() {
                    frame_number += 1;
                    let raw = RawFrameBuffer {
                        width: capability.width,
                        height: capability.height,
                        pixel_stride: capability.format.bytes_per_pixel() as u32,
                        row_stride,
                        data: &image,
                    };
                    let extras = ResultExtras {
                        frame_number,
                        device_timestamp: Some(interval * frame_number as u32),
                    };
                    deliver(&raw, &extras);
                    bump(&shared.counters.frames_delivered);
                }
            }
        }));
        Ok(())
    }

    async fn stop_capture(&mut self) -> DeviceResult<()> {
        bump(&self.shared.counters.stops);
        if self.shared.camera.fail_stop {
            return Err(DeviceError::Rejected("stop refused".into()));
        }
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: Option<FrameCallback>) {
        if callback.is_none() {
            bump(&self.shared.counters.callback_clears);
        }
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        bump(&self.shared.counters.disconnects);
        if self.shared.camera.fail_disconnect {
            return Err(DeviceError::Rejected("disconnect failed".into()));
        }
        Ok(())
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
        self.shared.counters.live_handles.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn becomes_available_after_configured_checks() {
        let driver = SimulatedDriver::new(SimulatedCamera {
            available_after: Some(2),
            ..Default::default()
        });
        assert!(!driver.availability(DeviceIdentifier::Main).await.unwrap());
        assert!(!driver.availability(DeviceIdentifier::Main).await.unwrap());
        assert!(driver.availability(DeviceIdentifier::Main).await.unwrap());
    }

    #[test]
    fn rendered_rows_carry_padding() {
        let capability = StreamCapability {
            width: 2,
            height: 2,
            format: PixelFormat::Yuyv,
        };
        let (image, stride) = SimulatedHandle::render(capability, 3);
        assert_eq!(stride, 7);
        assert_eq!(
            &image[..],
            &[0, 0, 0, 0, PADDING_BYTE, PADDING_BYTE, PADDING_BYTE, 1, 1, 1, 1, PADDING_BYTE, PADDING_BYTE, PADDING_BYTE]
        );
    }

    #[tokio::test]
    async fn start_requires_prepare() {
        let driver = SimulatedDriver::new(SimulatedCamera::default());
        let mut handle = driver
            .connect(ConnectContext {
                identifier: DeviceIdentifier::Main,
                flags: Default::default(),
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.start_capture().await,
            Err(DeviceError::NotPrepared)
        ));
        drop(handle);
        assert_eq!(driver.stats().live_handles, 0);
    }
}
