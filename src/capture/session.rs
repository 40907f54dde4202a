//! Camera session state machine
//!
//! Drives permission, availability, connect, configure and capture start in
//! sequence, and tears the device down on stop or on any stage failure.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use tracing::{debug, error, info, instrument, warn};

use super::selector::{select_best_fit, Selection};
use super::sink::FrameSink;
use crate::device::{
    CameraDriver, CameraHandle, CaptureConfig, CaptureType, ConnectContext, ConnectFlags,
    DeviceIdentifier,
};
use crate::error::{CameraError, CameraResult};
use crate::permission::{PermissionGate, PermissionKind, PermissionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingPermission,
    AwaitingDeviceAvailability,
    Connecting,
    Configuring,
    StartingCapture,
    Capturing,
    Disconnecting,
}

impl SessionState {
    pub fn is_initializing(self) -> bool {
        matches!(
            self,
            SessionState::RequestingPermission
                | SessionState::AwaitingDeviceAvailability
                | SessionState::Connecting
                | SessionState::Configuring
                | SessionState::StartingCapture
        )
    }

    pub fn is_capturing(self) -> bool {
        self == SessionState::Capturing
    }
}

/// Lock-free view of the session state, shared with the boundary
#[derive(Debug, Clone)]
pub struct SessionStatus(Arc<AtomicCell<SessionState>>);

impl Default for SessionStatus {
    fn default() -> Self {
        Self(Arc::new(AtomicCell::new(SessionState::Idle)))
    }
}

impl SessionStatus {
    pub fn get(&self) -> SessionState {
        self.0.load()
    }

    fn set(&self, state: SessionState) {
        let previous = self.0.swap(state);
        if previous != state {
            debug!("Session {:?} -> {:?}", previous, state);
        }
    }

    /// Claim the session for a new start sequence.
    ///
    /// Only an idle session can be claimed; the state is left untouched otherwise.
    pub fn try_begin(&self) -> CameraResult<()> {
        self.0
            .compare_exchange(SessionState::Idle, SessionState::RequestingPermission)
            .map(|_| ())
            .map_err(|current| {
                warn!("Start rejected, session is {:?}", current);
                CameraError::AlreadyInitializing
            })
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub availability_attempts: u32,
    pub availability_interval: Duration,
    pub frame_rate: u32,
    pub connect_flags: ConnectFlags,
    pub capture_type: CaptureType,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            availability_attempts: 10,
            availability_interval: Duration::from_secs(1),
            frame_rate: 30,
            connect_flags: ConnectFlags::CameraOnly,
            capture_type: CaptureType::Video,
        }
    }
}

fn live_handle(
    handle: &mut Option<Box<dyn CameraHandle>>,
) -> CameraResult<&mut Box<dyn CameraHandle>> {
    handle
        .as_mut()
        .ok_or_else(|| CameraError::ConnectFailed("no device handle".into()))
}

/// What a start request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRequest {
    pub identifier: DeviceIdentifier,
    pub width: u32,
    pub height: u32,
}

/// Owns the device handle for the lifetime of a capture.
///
/// Capturing implies a live handle: the state only reaches `Capturing`
/// after the handle is stored, and the handle is only released from
/// `Disconnecting`.
pub struct CameraSession {
    driver: Arc<dyn CameraDriver>,
    gate: PermissionGate,
    settings: SessionSettings,
    status: SessionStatus,
    sink: Arc<FrameSink>,
    handle: Option<Box<dyn CameraHandle>>,
    request: Option<StartRequest>,
    selection: Option<Selection>,
}

impl CameraSession {
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        gate: PermissionGate,
        settings: SessionSettings,
        sink: Arc<FrameSink>,
    ) -> Self {
        Self {
            driver,
            gate,
            settings,
            status: SessionStatus::default(),
            sink,
            handle: None,
            request: None,
            selection: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    pub fn is_capturing(&self) -> bool {
        self.state().is_capturing()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// The request the current capture was started with
    pub fn request(&self) -> Option<StartRequest> {
        self.request
    }

    /// Stream chosen for the current capture
    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    /// Run the full start sequence.
    ///
    /// Fails with `AlreadyInitializing` without touching anything when a
    /// sequence is in flight or the session is not idle.
    pub async fn start(&mut self, request: StartRequest) -> CameraResult<()> {
        self.status.try_begin()?;
        self.initialize(request).await
    }

    /// Start sequence for a session already claimed through [`SessionStatus::try_begin`]
    #[instrument(skip(self), fields(identifier = ?request.identifier))]
    pub(crate) async fn initialize(&mut self, request: StartRequest) -> CameraResult<()> {
        self.request = Some(request);
        match self.run_stages(request).await {
            Ok(()) => {
                info!(
                    "Capturing {:?} at {}x{}",
                    request.identifier, request.width, request.height
                );
                Ok(())
            }
            Err(e) => {
                error!("Camera start failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, request: StartRequest) -> CameraResult<()> {
        self.status.set(SessionState::RequestingPermission);
        self.request_permission().await?;

        self.status.set(SessionState::AwaitingDeviceAvailability);
        self.await_availability(request.identifier).await?;

        self.status.set(SessionState::Connecting);
        self.connect(request.identifier).await?;

        self.status.set(SessionState::Configuring);
        self.configure(request).await?;

        self.status.set(SessionState::StartingCapture);
        self.start_capture().await
    }

    async fn request_permission(&self) -> CameraResult<()> {
        match self.gate.request_and_await(PermissionKind::Camera).await {
            PermissionState::Granted => Ok(()),
            _ => Err(CameraError::PermissionDenied),
        }
    }

    async fn await_availability(&self, identifier: DeviceIdentifier) -> CameraResult<()> {
        let attempts = self.settings.availability_attempts;
        for attempt in 1..=attempts {
            match self.driver.availability(identifier).await {
                Ok(true) => {
                    debug!("{:?} available after {} checks", identifier, attempt);
                    return Ok(());
                }
                Ok(false) => debug!("{:?} not available ({}/{})", identifier, attempt, attempts),
                Err(e) => warn!("Availability check {}/{} failed: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.availability_interval).await;
            }
        }
        Err(CameraError::DeviceUnavailable { attempts })
    }

    async fn connect(&mut self, identifier: DeviceIdentifier) -> CameraResult<()> {
        let context = ConnectContext {
            identifier,
            flags: self.settings.connect_flags,
        };
        let handle = self
            .driver
            .connect(context)
            .await
            .map_err(|e| CameraError::ConnectFailed(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    async fn configure(&mut self, request: StartRequest) -> CameraResult<()> {
        let handle = live_handle(&mut self.handle)?;

        let available = handle
            .stream_capabilities(self.settings.capture_type)
            .await
            .map_err(|e| {
                warn!("Capability enumeration failed: {}", e);
                CameraError::NoCapabilityAvailable
            })?;
        let selection = select_best_fit(&available, request.width, request.height, |caps, w, h| {
            handle.best_fit(caps, w, h)
        })?;

        let config = CaptureConfig::single(selection.capability, self.settings.frame_rate);
        handle
            .prepare(&config)
            .await
            .map_err(|e| CameraError::PrepareFailed(e.to_string()))?;

        self.selection = Some(selection);
        Ok(())
    }

    async fn start_capture(&mut self) -> CameraResult<()> {
        let handle = live_handle(&mut self.handle)?;

        handle
            .pre_capture_aeawb()
            .await
            .map_err(|e| CameraError::CaptureStartFailed(format!("AE/AWB: {}", e)))?;
        handle
            .start_capture()
            .await
            .map_err(|e| CameraError::CaptureStartFailed(e.to_string()))?;

        self.sink.set_active(true);
        handle.set_frame_callback(Some(self.sink.callback()));
        self.status.set(SessionState::Capturing);
        Ok(())
    }

    /// Stop capture and release the device. A no-op on an idle session.
    pub async fn stop(&mut self) {
        if self.state() == SessionState::Idle && self.handle.is_none() {
            debug!("Stop on idle session");
            return;
        }
        self.disconnect().await;
    }

    /// Best-effort teardown; always ends in `Idle`
    async fn disconnect(&mut self) {
        let was = self.state();
        self.status.set(SessionState::Disconnecting);

        if let Some(mut handle) = self.handle.take() {
            if matches!(was, SessionState::StartingCapture | SessionState::Capturing) {
                self.sink.set_active(false);
                if let Err(e) = handle.stop_capture().await {
                    warn!("Stop capture failed: {}", e);
                }
                handle.set_frame_callback(None);
            }
            if let Err(e) = handle.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
            info!("Device handle released");
        }

        self.selection = None;
        self.request = None;
        self.status.set(SessionState::Idle);
    }
}
