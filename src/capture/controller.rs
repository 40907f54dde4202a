//! Externally facing capture entry point

use std::sync::{Arc, Mutex, PoisonError};

use flume::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::DecodedFrame;
use super::session::{CameraSession, SessionState, SessionStatus, StartRequest};
use super::sink::{FrameSink, FrameStats};
use crate::device::{CameraDriver, DeviceIdentifier};
use crate::error::CameraResult;
use crate::permission::PermissionGate;
use crate::Config;

type StartedCallback = Box<dyn FnOnce(bool) + Send>;
type StartedSlot = Arc<Mutex<Option<StartedCallback>>>;

/// One start sequence and the caller waiting on its outcome
struct StartAttempt {
    task: JoinHandle<()>,
    started: StartedSlot,
}

impl StartAttempt {
    /// Abandon the sequence; its caller hears `false` unless it already got an answer
    async fn abandon(self) {
        if !self.task.is_finished() {
            debug!("Abandoning in-flight start");
            self.task.abort();
        }
        let _ = self.task.await;
        report(&self.started, false);
    }
}

/// Start/stop surface over a single camera session.
///
/// Consumers only ever see decoded frames; the device handle stays inside
/// the session. Must be used from within a tokio runtime.
pub struct CaptureController {
    session: Arc<tokio::sync::Mutex<CameraSession>>,
    status: SessionStatus,
    sink: Arc<FrameSink>,
    attempt: Mutex<Option<StartAttempt>>,
}

impl CaptureController {
    pub fn new(driver: Arc<dyn CameraDriver>, gate: PermissionGate, config: &Config) -> Self {
        let sink = Arc::new(FrameSink::new(
            config.capture.orientation,
            config.pipeline.frame_channel_capacity,
        ));
        let session = CameraSession::new(driver, gate, config.session_settings(), Arc::clone(&sink));
        Self {
            status: session.status(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
            sink,
            attempt: Mutex::new(None),
        }
    }

    /// Begin capturing from `identifier` at roughly `width`x`height`.
    ///
    /// `on_started` receives the outcome of the start sequence. A start while
    /// another is in flight is rejected immediately with `AlreadyInitializing`.
    pub fn start<F>(
        &self,
        identifier: DeviceIdentifier,
        width: u32,
        height: u32,
        on_started: F,
    ) -> CameraResult<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        // Claim and bookkeeping happen under one lock so `stop` never misses a claimed start
        let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status.get() == SessionState::Capturing {
            drop(attempt);
            info!("Already capturing, ignoring start");
            on_started(true);
            return Ok(());
        }
        if let Err(e) = self.status.try_begin() {
            drop(attempt);
            on_started(false);
            return Err(e);
        }

        let request = StartRequest {
            identifier,
            width,
            height,
        };
        let started: StartedSlot = Arc::new(Mutex::new(Some(Box::new(on_started))));
        let session = Arc::clone(&self.session);
        let slot = Arc::clone(&started);
        let task = tokio::spawn(async move {
            let ok = session.lock().await.initialize(request).await.is_ok();
            report(&slot, ok);
        });

        // A previous attempt can only be here once it has left the session idle;
        // it still reports to its own caller.
        *attempt = Some(StartAttempt { task, started });
        Ok(())
    }

    /// Stop capture from any state.
    ///
    /// An in-flight start is abandoned at its current suspension point and
    /// reported as failed; the device is then released.
    pub async fn stop(&self) {
        if let Some(attempt) = self.take_attempt() {
            attempt.abandon().await;
        }
        self.session.lock().await.stop().await;
    }

    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.status.get().is_capturing()
    }

    pub fn latest_decoded_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.sink.latest()
    }

    /// Stream of decoded frames. Frames are dropped for a receiver that falls behind.
    pub fn subscribe(&self) -> Receiver<Arc<DecodedFrame>> {
        self.sink.subscribe()
    }

    pub fn stats(&self) -> FrameStats {
        self.sink.stats()
    }

    fn take_attempt(&self) -> Option<StartAttempt> {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn report(pending: &Mutex<Option<StartedCallback>>, ok: bool) {
    let callback = pending.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(callback) = callback {
        callback(ok);
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        let attempt = self.take_attempt();
        if attempt.is_none() && self.status.get() == SessionState::Idle {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release the camera on teardown");
            return;
        };
        let session = Arc::clone(&self.session);
        runtime.spawn(async move {
            if let Some(attempt) = attempt {
                attempt.abandon().await;
            }
            session.lock().await.stop().await;
        });
    }
}
