//! Permission backends: device node access on Linux, and a scripted one

use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::{access, AccessFlags};
use tracing::{debug, warn};

use super::{PermissionBackend, PermissionKind, PermissionResponder};

/// Camera permission as read/write access to the capture device nodes.
///
/// Linux has no interactive prompt, so requests resolve immediately.
#[derive(Debug, Clone)]
pub struct DevicePermissions {
    nodes: Vec<PathBuf>,
}

impl DevicePermissions {
    pub fn new(nodes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    fn accessible(&self) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().all(|node| {
                let ok = access(node, AccessFlags::R_OK | AccessFlags::W_OK).is_ok();
                debug!("Access check {}: {}", node.display(), ok);
                ok
            })
    }
}

impl PermissionBackend for DevicePermissions {
    fn check(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Camera => self.accessible(),
        }
    }

    fn request(&self, kind: PermissionKind, responder: PermissionResponder) {
        if self.check(kind) {
            responder.granted();
        } else {
            warn!(
                "No read/write access to {:?}; add the user to the 'video' group",
                self.nodes
            );
            responder.denied_permanently();
        }
    }
}

/// How a scripted permission request resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedOutcome {
    Grant,
    Deny,
    DenyPermanently,
    /// Never answer
    Ignore,
}

/// Answers requests with a fixed outcome after a delay
#[derive(Debug, Clone)]
pub struct SimulatedPermissions {
    pub already_held: bool,
    pub outcome: SimulatedOutcome,
    pub delay: Duration,
}

impl SimulatedPermissions {
    pub fn granting() -> Self {
        Self::new(SimulatedOutcome::Grant, Duration::ZERO)
    }

    pub fn new(outcome: SimulatedOutcome, delay: Duration) -> Self {
        Self {
            already_held: false,
            outcome,
            delay,
        }
    }
}

impl PermissionBackend for SimulatedPermissions {
    fn check(&self, _kind: PermissionKind) -> bool {
        self.already_held
    }

    fn request(&self, _kind: PermissionKind, responder: PermissionResponder) {
        let outcome = self.outcome;
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match outcome {
                SimulatedOutcome::Grant => responder.granted(),
                SimulatedOutcome::Deny => responder.denied(),
                SimulatedOutcome::DenyPermanently => responder.denied_permanently(),
                // Keep the responder alive so the request stays pending
                SimulatedOutcome::Ignore => std::future::pending::<()>().await,
            }
        });
    }
}
