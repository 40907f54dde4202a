pub mod controller;
pub mod decoder;
pub mod frame;
pub mod selector;
pub mod session;
pub mod sink;

pub use controller::CaptureController;
pub use decoder::FrameDecoder;
pub use frame::{DecodedFrame, Orientation, PixelFormat, RawFrameBuffer, ResultExtras};
pub use selector::{nearest_capability, select_best_fit, Selection, StreamCapability};
pub use session::{CameraSession, SessionSettings, SessionState, SessionStatus, StartRequest};
pub use sink::{FrameSink, FrameStats};
