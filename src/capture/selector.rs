//! Stream capability selection

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::frame::PixelFormat;
use crate::error::{CameraError, CameraResult};

/// A resolution/format combination the hardware can stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamCapability {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl std::fmt::Display for StreamCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// Outcome of a selection. `fallback_used` is set when the ranking found
/// nothing and the first enumerated capability was taken instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub capability: StreamCapability,
    pub fallback_used: bool,
}

/// Pick the stream configuration to use for a requested resolution.
///
/// `best_fit` is the device's own ranking; when it comes back empty the first
/// capability in `available` is used and the fallback is logged and counted.
pub fn select_best_fit<F>(
    available: &[StreamCapability],
    target_width: u32,
    target_height: u32,
    best_fit: F,
) -> CameraResult<Selection>
where
    F: FnOnce(&[StreamCapability], u32, u32) -> Option<StreamCapability>,
{
    let first = *available.first().ok_or(CameraError::NoCapabilityAvailable)?;

    if let Some(capability) = best_fit(available, target_width, target_height) {
        info!(
            "Selected stream {} for target {}x{}",
            capability, target_width, target_height
        );
        return Ok(Selection {
            capability,
            fallback_used: false,
        });
    }

    warn!(
        "No best-fit stream for {}x{}, falling back to first enumerated {}",
        target_width, target_height, first
    );
    metrics::counter!("capability_fallbacks").increment(1);
    Ok(Selection {
        capability: first,
        fallback_used: true,
    })
}

/// Nearest-resolution ranking: smallest combined width/height distance,
/// earliest entry on ties.
pub fn nearest_capability(
    available: &[StreamCapability],
    target_width: u32,
    target_height: u32,
) -> Option<StreamCapability> {
    available
        .iter()
        .enumerate()
        .min_by_key(|(index, cap)| {
            let distance = cap.width.abs_diff(target_width) as u64
                + cap.height.abs_diff(target_height) as u64;
            (distance, *index)
        })
        .map(|(_, cap)| *cap)
}
