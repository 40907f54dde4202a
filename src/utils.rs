use std::path::Path;

use tracing::info;

use crate::device::v4l2::supports_raw_capture;
use crate::DeviceNodes;

/// Scan `/dev/video0..9` for capture nodes with a repackable raw format
pub fn detect_capture_nodes() -> Vec<String> {
    info!("Auto-detecting capture devices...");

    (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists() && supports_raw_capture(Path::new(path)))
        .inspect(|path| info!("Found capture node: {}", path))
        .collect()
}

/// Fill identifiers whose configured node is missing from the detected nodes.
///
/// The first detected node backs the main camera, the second the
/// computer-vision sensor.
pub fn resolve_nodes(configured: &DeviceNodes, detected: &[String]) -> DeviceNodes {
    let mut nodes = configured.clone();
    let mut fallback = detected.iter();
    if !Path::new(&nodes.main).exists() {
        if let Some(path) = fallback.next() {
            nodes.main = path.clone();
        }
    }
    if !Path::new(&nodes.computer_vision).exists() {
        if let Some(path) = fallback.find(|p| **p != nodes.main) {
            nodes.computer_vision = path.clone();
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_nodes_take_detected_ones() {
        let configured = DeviceNodes {
            main: "/nonexistent/video0".into(),
            computer_vision: "/nonexistent/video2".into(),
        };
        let detected = vec!["/dev/video4".to_string(), "/dev/video6".to_string()];

        let nodes = resolve_nodes(&configured, &detected);
        assert_eq!(nodes.main, "/dev/video4");
        assert_eq!(nodes.computer_vision, "/dev/video6");
    }

    #[test]
    fn nothing_detected_keeps_configuration() {
        let configured = DeviceNodes {
            main: "/nonexistent/video0".into(),
            computer_vision: "/nonexistent/video2".into(),
        };
        assert_eq!(resolve_nodes(&configured, &[]), configured);
    }
}
