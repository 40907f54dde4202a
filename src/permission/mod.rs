//! Awaitable wrapper over callback-based permission requests

mod backend;

pub use backend::{DevicePermissions, SimulatedOutcome, SimulatedPermissions};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Permission the session needs before touching the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PermissionKind {
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PermissionState {
    Unknown = 0,
    Granted = 1,
    Denied = 2,
}

impl PermissionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PermissionState::Granted,
            2 => PermissionState::Denied,
            _ => PermissionState::Unknown,
        }
    }
}

/// The platform permission subsystem.
///
/// `request` must eventually invoke exactly one outcome on the responder,
/// from any thread.
pub trait PermissionBackend: Send + Sync {
    fn check(&self, kind: PermissionKind) -> bool;

    fn request(&self, kind: PermissionKind, responder: PermissionResponder);
}

/// Outcome handlers for a single request cycle.
///
/// Each handler consumes the responder, so a cycle resolves at most once.
#[derive(Debug)]
pub struct PermissionResponder {
    kind: PermissionKind,
    slot: Arc<AtomicU8>,
}

impl PermissionResponder {
    pub fn kind(&self) -> PermissionKind {
        self.kind
    }

    pub fn granted(self) {
        info!("{:?} permission granted", self.kind);
        self.resolve(PermissionState::Granted);
    }

    pub fn denied(self) {
        warn!("{:?} permission denied", self.kind);
        self.resolve(PermissionState::Denied);
    }

    /// Treated exactly like `denied`
    pub fn denied_permanently(self) {
        warn!("{:?} permission denied permanently", self.kind);
        self.resolve(PermissionState::Denied);
    }

    fn resolve(self, state: PermissionState) {
        let _ = self.slot.compare_exchange(
            PermissionState::Unknown as u8,
            state as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Turns a permission request into one awaited tri-state result
#[derive(Clone)]
pub struct PermissionGate {
    backend: Arc<dyn PermissionBackend>,
    poll_interval: Duration,
}

impl PermissionGate {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(backend: Arc<dyn PermissionBackend>) -> Self {
        Self::with_poll_interval(backend, Self::DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(backend: Arc<dyn PermissionBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
        }
    }

    /// Request `kind` and wait for the outcome.
    ///
    /// There is no timeout; abandon the future to give up waiting.
    #[instrument(skip(self))]
    pub async fn request_and_await(&self, kind: PermissionKind) -> PermissionState {
        if self.backend.check(kind) {
            debug!("{:?} permission already held", kind);
            return PermissionState::Granted;
        }

        let slot = Arc::new(AtomicU8::new(PermissionState::Unknown as u8));
        self.backend.request(
            kind,
            PermissionResponder {
                kind,
                slot: Arc::clone(&slot),
            },
        );

        loop {
            match PermissionState::from_u8(slot.load(Ordering::Acquire)) {
                PermissionState::Unknown => tokio::time::sleep(self.poll_interval).await,
                resolved => return resolved,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Holds on to the responder so the test decides when to answer
    #[derive(Default)]
    struct ManualBackend {
        held: bool,
        pending: Mutex<Option<PermissionResponder>>,
    }

    impl PermissionBackend for ManualBackend {
        fn check(&self, _kind: PermissionKind) -> bool {
            self.held
        }

        fn request(&self, _kind: PermissionKind, responder: PermissionResponder) {
            *self.pending.lock().unwrap() = Some(responder);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_after_delayed_grant() {
        let backend = Arc::new(ManualBackend::default());
        let gate = PermissionGate::new(backend.clone());

        let waiter = tokio::spawn(async move { gate.request_and_await(PermissionKind::Camera).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        backend.pending.lock().unwrap().take().unwrap().granted();
        assert_eq!(waiter.await.unwrap(), PermissionState::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_denial_reads_as_denied() {
        let backend = Arc::new(ManualBackend::default());
        let gate = PermissionGate::new(backend.clone());

        let waiter = tokio::spawn(async move { gate.request_and_await(PermissionKind::Camera).await });
        while backend.pending.lock().unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        backend.pending.lock().unwrap().take().unwrap().denied_permanently();
        assert_eq!(waiter.await.unwrap(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn held_permission_skips_request() {
        let backend = Arc::new(ManualBackend {
            held: true,
            ..Default::default()
        });
        let gate = PermissionGate::new(backend.clone());
        assert_eq!(
            gate.request_and_await(PermissionKind::Camera).await,
            PermissionState::Granted
        );
        assert!(backend.pending.lock().unwrap().is_none());
    }
}
