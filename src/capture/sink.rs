//! Frame-arrival handling: decode, publish, fan out

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use flume::{Receiver, Sender, TrySendError};
use tracing::{trace, warn};

use super::decoder::FrameDecoder;
use super::frame::{DecodedFrame, Orientation, RawFrameBuffer, ResultExtras};
use crate::device::FrameCallback;

/// Frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
}

/// Receives raw frames on the device thread and publishes decoded ones.
///
/// Decoded buffers ping-pong: when the previously published frame is no
/// longer held by any consumer, it becomes the target of the next decode.
pub struct FrameSink {
    decoder: FrameDecoder,
    active: AtomicBool,
    latest: ArcSwapOption<DecodedFrame>,
    spare: Mutex<Option<DecodedFrame>>,
    subscribers: Mutex<Vec<Sender<Arc<DecodedFrame>>>>,
    channel_capacity: usize,
    decoded: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl FrameSink {
    pub fn new(orientation: Orientation, channel_capacity: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(orientation),
            active: AtomicBool::new(false),
            latest: ArcSwapOption::empty(),
            spare: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            channel_capacity: channel_capacity.max(1),
            decoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Callback to register with the device handle
    pub fn callback(self: &Arc<Self>) -> FrameCallback {
        let sink = Arc::clone(self);
        Arc::new(move |raw: &RawFrameBuffer<'_>, extras: &ResultExtras| sink.on_frame(raw, extras))
    }

    /// Frames are ignored unless the sink is active
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.latest.load_full()
    }

    pub fn subscribe(&self) -> Receiver<Arc<DecodedFrame>> {
        let (tx, rx) = flume::bounded(self.channel_capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_decoded: self.decoded.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn on_frame(&self, raw: &RawFrameBuffer<'_>, extras: &ResultExtras) {
        if !self.is_active() {
            trace!("Dropping frame {} on inactive sink", extras.frame_number);
            return;
        }

        let decode_start = Instant::now();
        let mut spare = self.spare.lock().unwrap_or_else(PoisonError::into_inner);
        let mut frame = match self.decoder.decode_recycling(raw, &mut spare) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Frame {} discarded: {}", extras.frame_number, e);
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frame_decode_errors").increment(1);
                return;
            }
        };
        frame.sequence = extras.frame_number;

        let frame = Arc::new(frame);
        if let Some(previous) = self.latest.swap(Some(Arc::clone(&frame))) {
            *spare = Arc::try_unwrap(previous).ok();
        }
        drop(spare);

        self.decoded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_decoded").increment(1);
        metrics::histogram!("decode_time_us").record(decode_start.elapsed().as_micros() as f64);

        self.publish(&frame);
    }

    fn publish(&self, frame: &Arc<DecodedFrame>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped").increment(1);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}
