//! V4L2 camera driver with mmap streaming

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::format::Format;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    CameraDriver, CameraHandle, CaptureConfig, CaptureType, ConnectContext, DeviceIdentifier,
    FrameCallback,
};
use crate::capture::frame::{PixelFormat, RawFrameBuffer, ResultExtras};
use crate::capture::selector::StreamCapability;
use crate::error::{DeviceError, DeviceResult};
use crate::DeviceNodes;

const V4L2_CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Dequeue timeout so the delivery thread notices a stop request
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

pub(crate) fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Rgba32 => FourCC::new(b"AB24"),
        PixelFormat::Bgra32 => FourCC::new(b"AR24"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Grey8 => FourCC::new(b"GREY"),
    }
}

pub(crate) fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"AB24" => Some(PixelFormat::Rgba32),
        b"AR24" => Some(PixelFormat::Bgra32),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"GREY" => Some(PixelFormat::Grey8),
        _ => None,
    }
}

/// Driver resolving identifiers to `/dev/video*` nodes
pub struct V4l2Driver {
    nodes: DeviceNodes,
    buffer_count: u32,
}

impl V4l2Driver {
    pub fn new(nodes: DeviceNodes, buffer_count: u32) -> Self {
        Self {
            nodes,
            buffer_count,
        }
    }

    fn path(&self, identifier: DeviceIdentifier) -> PathBuf {
        PathBuf::from(self.nodes.path(identifier))
    }
}

#[async_trait]
impl CameraDriver for V4l2Driver {
    async fn availability(&self, identifier: DeviceIdentifier) -> DeviceResult<bool> {
        let path = self.path(identifier);
        if !path.exists() {
            debug!("{} not present", path.display());
            return Ok(false);
        }

        // Busy devices may refuse the open; that is "not yet available"
        let device = match Device::with_path(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("{} not openable: {}", path.display(), e);
                return Ok(false);
            }
        };
        let caps = device.query_caps()?;
        Ok(caps.capabilities.contains(CapFlags::VIDEO_CAPTURE))
    }

    #[instrument(skip(self))]
    async fn connect(&self, context: ConnectContext) -> DeviceResult<Box<dyn CameraHandle>> {
        let path = self.path(context.identifier);
        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unsupported(format!(
                "{} doesn't support video capture",
                path.display()
            )));
        }

        Ok(Box::new(V4l2Handle {
            device: Some(device),
            path,
            buffer_count: self.buffer_count,
            format: None,
            callback: Arc::new(Mutex::new(None)),
            worker: None,
        }))
    }
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct V4l2Handle {
    device: Option<Device>,
    path: PathBuf,
    buffer_count: u32,
    format: Option<(Format, PixelFormat)>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    worker: Option<CaptureWorker>,
}

impl V4l2Handle {
    fn device(&self) -> DeviceResult<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| DeviceError::Rejected(format!("{} disconnected", self.path.display())))
    }

    fn set_control(device: &Device, id: u32, value: Value) {
        if let Err(e) = device.set_control(Control { id, value }) {
            debug!("Control {:#x} not applied: {}", id, e);
        }
    }

    async fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        match tokio::task::spawn_blocking(move || worker.thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Capture thread for {} panicked", self.path.display()),
            Err(e) => warn!("Failed to join capture thread: {}", e),
        }
    }
}

fn enumerate(device: &Device) -> DeviceResult<Vec<StreamCapability>> {
    let mut capabilities = Vec::new();
    for description in device.enum_formats()? {
        let Some(format) = pixel_format(description.fourcc) else {
            debug!("Skipping format {}", description.fourcc);
            continue;
        };
        for size in device.enum_framesizes(description.fourcc)? {
            match size.size {
                FrameSizeEnum::Discrete(d) => capabilities.push(StreamCapability {
                    width: d.width,
                    height: d.height,
                    format,
                }),
                FrameSizeEnum::Stepwise(s) => capabilities.push(StreamCapability {
                    width: s.max_width,
                    height: s.max_height,
                    format,
                }),
            }
        }
    }
    Ok(capabilities)
}

#[async_trait]
impl CameraHandle for V4l2Handle {
    async fn stream_capabilities(
        &mut self,
        capture_type: CaptureType,
    ) -> DeviceResult<Vec<StreamCapability>> {
        if capture_type == CaptureType::Image {
            return Err(DeviceError::Unsupported("still capture".into()));
        }
        enumerate(self.device()?)
    }

    async fn prepare(&mut self, config: &CaptureConfig) -> DeviceResult<()> {
        let stream = config
            .streams
            .first()
            .ok_or_else(|| DeviceError::Unsupported("no streams configured".into()))?;
        let device = self.device()?;

        let requested = Format::new(
            stream.capability.width,
            stream.capability.height,
            fourcc(stream.output_format),
        );
        let actual = device.set_format(&requested)?;
        if actual.fourcc != requested.fourcc {
            return Err(DeviceError::Rejected(format!(
                "driver negotiated {} instead of {}",
                actual.fourcc, requested.fourcc
            )));
        }
        if let Err(e) = device.set_params(&Parameters::with_fps(config.frame_rate)) {
            warn!("Frame rate {} not applied: {}", config.frame_rate, e);
        }

        info!(
            "Prepared {}x{} {} stride {}",
            actual.width, actual.height, actual.fourcc, actual.stride
        );
        self.format = Some((actual, stream.output_format));
        Ok(())
    }

    async fn pre_capture_aeawb(&mut self) -> DeviceResult<()> {
        let device = self.device()?;
        Self::set_control(
            device,
            V4L2_CID_EXPOSURE_AUTO,
            Value::Integer(V4L2_EXPOSURE_APERTURE_PRIORITY),
        );
        Self::set_control(device, V4L2_CID_AUTO_WHITE_BALANCE, Value::Boolean(true));
        Ok(())
    }

    async fn start_capture(&mut self) -> DeviceResult<()> {
        let (format, pixel_format) = self.format.clone().ok_or(DeviceError::NotPrepared)?;
        let mut stream = MmapStream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let running = Arc::new(AtomicBool::new(true));
        let callback = Arc::clone(&self.callback);
        let path = self.path.clone();
        let flag = Arc::clone(&running);
        let pixel_stride = pixel_format.bytes_per_pixel() as u32;

        let thread = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!("Dequeue from {} failed: {}", path.display(), e);
                            break;
                        }
                    };

                    let raw = RawFrameBuffer {
                        width: format.width,
                        height: format.height,
                        pixel_stride,
                        row_stride: format.stride,
                        data: buf,
                    };
                    let extras = ResultExtras {
                        frame_number: meta.sequence as u64,
                        device_timestamp: Some(
                            Duration::from_secs(meta.timestamp.sec as u64)
                                + Duration::from_micros(meta.timestamp.usec as u64),
                        ),
                    };

                    let guard = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(deliver) = guard.as_ref() {
                        deliver(&raw, &extras);
                    }
                }
                debug!("Capture thread for {} exiting", path.display());
            })?;

        self.worker = Some(CaptureWorker { running, thread });
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    async fn stop_capture(&mut self) -> DeviceResult<()> {
        self.join_worker().await;
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: Option<FrameCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.join_worker().await;
        if self.device.take().is_some() {
            info!("Released {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            let _ = worker.thread.join();
        }
    }
}

/// Whether `path` is a capture node with at least one repackable format
pub fn supports_raw_capture(path: &Path) -> bool {
    let Ok(device) = Device::with_path(path) else {
        return false;
    };
    let capture = device
        .query_caps()
        .map(|caps| caps.capabilities.contains(CapFlags::VIDEO_CAPTURE))
        .unwrap_or(false);
    capture
        && device
            .enum_formats()
            .map(|formats| formats.iter().any(|f| pixel_format(f.fourcc).is_some()))
            .unwrap_or(false)
}
