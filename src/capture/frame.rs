use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Packed single-plane pixel formats the decoder can repack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba32,
    Bgra32,
    Rgb24,
    Bgr24,
    Yuyv,
    Grey8,
}

impl PixelFormat {
    /// Bytes occupied by one pixel in a tightly packed row
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv => 2,
            PixelFormat::Grey8 => 1,
        }
    }
}

/// Row orientation applied while repacking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Upright,
    /// Row 0 of the source lands on the last row of the output
    FlipVertical,
}

/// Frame buffer as delivered by the device.
///
/// Only valid for the duration of the frame callback; the borrow keeps it from
/// being retained past the callback's return.
#[derive(Debug, Clone, Copy)]
pub struct RawFrameBuffer<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel in the source buffer
    pub pixel_stride: u32,
    /// Byte distance between the starts of consecutive rows
    pub row_stride: u32,
    pub data: &'a [u8],
}

impl RawFrameBuffer<'_> {
    /// Bytes of pixel data in one row, excluding alignment padding
    pub fn actual_row_bytes(&self) -> usize {
        self.width as usize * self.pixel_stride as usize
    }

    pub fn is_packed(&self) -> bool {
        self.row_stride as usize == self.actual_row_bytes()
    }
}

/// Per-frame extras reported alongside the buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultExtras {
    pub frame_number: u64,
    /// Hardware timestamp if available
    pub device_timestamp: Option<Duration>,
}

/// Tightly packed, row-major frame ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl DecodedFrame {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel
    }

    /// Pixel bytes of row `index`, or `None` past the last row
    pub fn row(&self, index: usize) -> Option<&[u8]> {
        let len = self.row_bytes();
        let start = index.checked_mul(len)?;
        self.data.get(start..start.checked_add(len)?)
    }

    /// Whether this buffer can be reused for a frame of the given geometry
    pub fn matches(&self, width: u32, height: u32, bytes_per_pixel: usize) -> bool {
        self.width == width && self.height == height && self.bytes_per_pixel == bytes_per_pixel
    }
}
