//! camgate: permission-gated camera capture

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camgate::capture::CaptureController;
use camgate::device::simulated::SimulatedCamera;
use camgate::device::{CameraDriver, SimulatedDriver, V4l2Driver};
use camgate::permission::{
    DevicePermissions, PermissionBackend, PermissionGate, SimulatedPermissions,
};
use camgate::{utils, Backend, Config};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camgate=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camgate launching...");

    // Load configuration
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("camgate.toml"));
    let config = Config::load(Some(&path))?;
    camgate::CONFIG.store(Arc::new(config.clone()));

    let (driver, permissions): (Arc<dyn CameraDriver>, Arc<dyn PermissionBackend>) =
        match config.capture.backend {
            Backend::V4l2 => {
                let nodes = utils::resolve_nodes(&config.capture.nodes, &utils::detect_capture_nodes());
                info!("Using capture nodes: {:?}", nodes);
                let permissions = DevicePermissions::new([PathBuf::from(
                    nodes.path(config.capture.device),
                )]);
                (
                    Arc::new(V4l2Driver::new(nodes, config.capture.buffer_count)),
                    Arc::new(permissions),
                )
            }
            Backend::Simulated => (
                Arc::new(SimulatedDriver::new(SimulatedCamera::default())),
                Arc::new(SimulatedPermissions::granting()),
            ),
        };

    let gate = PermissionGate::with_poll_interval(permissions, config.permission_poll_interval());
    let controller = CaptureController::new(driver, gate, &config);

    let (started_tx, started_rx) = oneshot::channel();
    controller.start(
        config.capture.device,
        config.capture.width,
        config.capture.height,
        move |ok| {
            let _ = started_tx.send(ok);
        },
    )?;

    let started = tokio::select! {
        started = started_rx => started.unwrap_or(false),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during start");
            controller.stop().await;
            return Ok(());
        }
    };
    if !started {
        return Err(eyre!("camera failed to start"));
    }

    let frames = controller.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            frame = frames.recv_async() => match frame {
                Ok(frame) => tracing::trace!("Frame {} {}x{}", frame.sequence, frame.width, frame.height),
                Err(e) => {
                    error!("Frame stream closed: {}", e);
                    break;
                }
            },
            _ = report.tick() => {
                let stats = controller.stats();
                info!(
                    "decoded={} dropped={} errors={}",
                    stats.frames_decoded, stats.frames_dropped, stats.decode_errors
                );
                if !controller.is_connected() {
                    warn!("Capture no longer active");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    controller.stop().await;
    info!("camgate shutting down");
    Ok(())
}
