//! End-to-end lifecycle of the capture controller against the simulated camera

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camgate::capture::{CaptureController, PixelFormat, SessionState, StreamCapability};
use camgate::device::simulated::{SimulatedCamera, PADDING_BYTE};
use camgate::device::{DeviceIdentifier, SimulatedDriver};
use camgate::permission::{
    PermissionBackend, PermissionGate, PermissionKind, PermissionResponder, SimulatedOutcome,
    SimulatedPermissions,
};
use camgate::{CameraError, Config};
use tokio::sync::oneshot;

fn small_camera() -> SimulatedCamera {
    SimulatedCamera {
        capabilities: vec![
            StreamCapability {
                width: 320,
                height: 240,
                format: PixelFormat::Rgba32,
            },
            StreamCapability {
                width: 640,
                height: 480,
                format: PixelFormat::Rgba32,
            },
        ],
        row_padding: 48,
        ..Default::default()
    }
}

fn build_controller(camera: SimulatedCamera, permissions: SimulatedPermissions) -> (CaptureController, SimulatedDriver) {
    let driver = SimulatedDriver::new(camera);
    let gate = PermissionGate::new(Arc::new(permissions));
    let controller = CaptureController::new(Arc::new(driver.clone()), gate, &Config::default());
    (controller, driver)
}

fn start(controller: &CaptureController) -> Result<oneshot::Receiver<bool>, CameraError> {
    let (tx, rx) = oneshot::channel();
    controller.start(DeviceIdentifier::Main, 640, 480, move |ok| {
        let _ = tx.send(ok);
    })?;
    Ok(rx)
}

#[tokio::test(start_paused = true)]
async fn capture_delivers_packed_frames() {
    let (controller, driver) = build_controller(small_camera(), SimulatedPermissions::granting());
    assert!(!controller.is_connected());
    assert!(controller.latest_decoded_frame().is_none());

    let started = start(&controller).unwrap();
    assert!(started.await.unwrap());
    assert!(controller.is_connected());

    let frames = controller.subscribe();
    let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((frame.width, frame.height), (640, 480));
    assert_eq!(frame.data.len(), 640 * 480 * 4);
    assert!(!frame.data.contains(&PADDING_BYTE));
    assert_eq!(frame.row(5), Some(&[5u8; 640 * 4][..]));

    let latest = controller.latest_decoded_frame().unwrap();
    assert!(latest.sequence >= frame.sequence);

    controller.stop().await;
    assert!(!controller.is_connected());
    assert_eq!(controller.state(), SessionState::Idle);
    let stats = driver.stats();
    assert_eq!(stats.callback_clears, 1);
    assert_eq!(stats.live_handles, 0);
}

#[tokio::test(start_paused = true)]
async fn second_start_while_initializing_is_rejected() {
    let permissions = SimulatedPermissions::new(SimulatedOutcome::Grant, Duration::from_secs(3));
    let (controller, driver) = build_controller(small_camera(), permissions);

    let first = start(&controller).unwrap();
    assert!(controller.state().is_initializing());

    let (tx, rx) = oneshot::channel();
    let second = controller.start(DeviceIdentifier::ComputerVision, 320, 240, move |ok| {
        let _ = tx.send(ok);
    });
    assert_eq!(second.unwrap_err(), CameraError::AlreadyInitializing);
    assert!(!rx.await.unwrap());
    assert!(controller.state().is_initializing());

    assert!(first.await.unwrap());
    assert!(controller.is_connected());
    assert_eq!(driver.stats().connects, 1);
    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn denied_permission_reports_failure() {
    let permissions = SimulatedPermissions::new(SimulatedOutcome::DenyPermanently, Duration::from_secs(1));
    let (controller, driver) = build_controller(small_camera(), permissions);

    assert!(!start(&controller).unwrap().await.unwrap());
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!controller.is_connected());
    assert_eq!(driver.stats().connects, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_pending_permission() {
    let permissions = SimulatedPermissions::new(SimulatedOutcome::Ignore, Duration::ZERO);
    let (controller, driver) = build_controller(small_camera(), permissions);

    let started = start(&controller).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(controller.state(), SessionState::RequestingPermission);

    controller.stop().await;
    assert!(!started.await.unwrap());
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(driver.stats().availability_checks, 0);
}

#[tokio::test(start_paused = true)]
async fn start_while_capturing_is_a_success() {
    let (controller, driver) = build_controller(small_camera(), SimulatedPermissions::granting());
    assert!(start(&controller).unwrap().await.unwrap());
    assert!(start(&controller).unwrap().await.unwrap());
    assert_eq!(driver.stats().connects, 1);
    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_when_idle_touches_nothing() {
    let (controller, driver) = build_controller(small_camera(), SimulatedPermissions::granting());
    controller.stop().await;
    controller.stop().await;
    assert_eq!(driver.stats().callback_clears, 0);
    assert_eq!(driver.stats().disconnects, 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_releases_the_device() {
    let (controller, driver) = build_controller(small_camera(), SimulatedPermissions::granting());
    assert!(start(&controller).unwrap().await.unwrap());
    assert_eq!(driver.stats().live_handles, 1);

    drop(controller);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.stats().live_handles, 0);
    assert_eq!(driver.stats().disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_mid_start_reports_failure_and_stops_polling() {
    let camera = SimulatedCamera {
        available_after: None,
        ..small_camera()
    };
    let (controller, driver) = build_controller(camera, SimulatedPermissions::granting());

    let started = start(&controller).unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(controller.state(), SessionState::AwaitingDeviceAvailability);
    let checks = driver.stats().availability_checks;
    assert!(checks > 0);

    drop(controller);
    assert!(!started.await.unwrap());

    tokio::time::sleep(Duration::from_secs(20)).await;
    let stats = driver.stats();
    assert_eq!(stats.availability_checks, checks);
    assert_eq!(stats.connects, 0);
}

/// Denies the first request and grants every later one
#[derive(Default)]
struct DenyOnce {
    requests: AtomicU32,
}

impl PermissionBackend for DenyOnce {
    fn check(&self, _kind: PermissionKind) -> bool {
        false
    }

    fn request(&self, _kind: PermissionKind, responder: PermissionResponder) {
        if self.requests.fetch_add(1, Ordering::SeqCst) == 0 {
            responder.denied();
        } else {
            responder.granted();
        }
    }
}

/// Log sink that stalls on the transition back to idle
struct StallOnIdle;

impl std::io::Write for StallOnIdle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.windows(7).any(|w| w == b"-> Idle") {
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_right_after_failure_gets_its_own_outcome() {
    // Widens the gap between a failed start reaching Idle and its caller being told
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("camgate::capture::session=debug"))
        .with_ansi(false)
        .with_writer(|| StallOnIdle)
        .try_init();

    let driver = SimulatedDriver::new(small_camera());
    let gate = PermissionGate::new(Arc::new(DenyOnce::default()));
    let controller = CaptureController::new(Arc::new(driver.clone()), gate, &Config::default());

    let first = start(&controller).unwrap();
    while controller.state() != SessionState::Idle {
        tokio::task::yield_now().await;
    }
    let second = start(&controller).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), first).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), second).await.unwrap();
    assert!(!first.unwrap());
    assert!(second.unwrap());
    assert!(controller.is_connected());
    assert_eq!(driver.stats().connects, 1);

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);
}
