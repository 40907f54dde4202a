//! Repacks padded hardware frame buffers into tightly packed rows

use tracing::trace;

use super::frame::{DecodedFrame, Orientation, RawFrameBuffer};
use crate::error::{CameraError, CameraResult};

/// Converts raw device buffers into display-ready frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder {
    orientation: Orientation,
}

impl FrameDecoder {
    pub fn new(orientation: Orientation) -> Self {
        Self { orientation }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Decode `raw` into a packed frame, reusing `previous` when its geometry matches.
    ///
    /// Row `r` of the source starts at `r * row_stride`; exactly
    /// `width * pixel_stride` bytes are taken from it and written at
    /// `r * actual_row_bytes` of the output (or at the mirrored row when
    /// flipping). Trailing padding is never copied.
    pub fn decode(
        &self,
        raw: &RawFrameBuffer<'_>,
        previous: Option<DecodedFrame>,
    ) -> CameraResult<DecodedFrame> {
        let geometry = Geometry::validate(raw)?;
        Ok(self.repack(raw, &geometry, previous))
    }

    /// Like [`decode`](Self::decode), taking the reusable buffer out of `spare`
    /// only once the geometry checks out. A rejected frame leaves `spare` untouched.
    pub fn decode_recycling(
        &self,
        raw: &RawFrameBuffer<'_>,
        spare: &mut Option<DecodedFrame>,
    ) -> CameraResult<DecodedFrame> {
        let geometry = Geometry::validate(raw)?;
        Ok(self.repack(raw, &geometry, spare.take()))
    }

    fn repack(
        &self,
        raw: &RawFrameBuffer<'_>,
        geometry: &Geometry,
        previous: Option<DecodedFrame>,
    ) -> DecodedFrame {
        let mut frame = match previous {
            Some(frame) if frame.matches(raw.width, raw.height, geometry.bytes_per_pixel) => frame,
            stale => {
                if let Some(stale) = stale {
                    trace!(
                        "Releasing {}x{} buffer for {}x{} frame",
                        stale.width,
                        stale.height,
                        raw.width,
                        raw.height
                    );
                }
                DecodedFrame {
                    width: raw.width,
                    height: raw.height,
                    bytes_per_pixel: geometry.bytes_per_pixel,
                    sequence: 0,
                    data: vec![0; geometry.packed_len],
                }
            }
        };

        let rows = raw.height as usize;
        let row_bytes = geometry.row_bytes;
        let stride = raw.row_stride as usize;
        let dst = &mut frame.data[..];

        match self.orientation {
            Orientation::Upright if raw.is_packed() => {
                dst.copy_from_slice(&raw.data[..geometry.packed_len]);
            }
            Orientation::Upright => {
                for row in 0..rows {
                    let src = row * stride;
                    let out = row * row_bytes;
                    dst[out..out + row_bytes].copy_from_slice(&raw.data[src..src + row_bytes]);
                }
            }
            Orientation::FlipVertical => {
                for row in 0..rows {
                    let src = row * stride;
                    let out = (rows - 1 - row) * row_bytes;
                    dst[out..out + row_bytes].copy_from_slice(&raw.data[src..src + row_bytes]);
                }
            }
        }

        frame
    }
}

/// Checked sizes derived from a raw buffer
struct Geometry {
    bytes_per_pixel: usize,
    row_bytes: usize,
    packed_len: usize,
}

impl Geometry {
    fn validate(raw: &RawFrameBuffer<'_>) -> CameraResult<Self> {
        let invalid = |msg: String| Err(CameraError::InvalidFrameGeometry(msg));

        if raw.width == 0 || raw.height == 0 {
            return invalid(format!("empty frame {}x{}", raw.width, raw.height));
        }
        if raw.pixel_stride == 0 {
            return invalid("pixel stride is zero".into());
        }

        let bytes_per_pixel = raw.pixel_stride as usize;
        let row_bytes = (raw.width as usize)
            .checked_mul(bytes_per_pixel)
            .ok_or_else(|| CameraError::InvalidFrameGeometry("row size overflows".into()))?;
        let stride = raw.row_stride as usize;
        if stride < row_bytes {
            return invalid(format!(
                "row stride {} shorter than {} pixel bytes",
                stride, row_bytes
            ));
        }

        let rows = raw.height as usize;
        let packed_len = row_bytes
            .checked_mul(rows)
            .ok_or_else(|| CameraError::InvalidFrameGeometry("frame size overflows".into()))?;
        // The last row need not carry its padding
        let required = (rows - 1)
            .checked_mul(stride)
            .and_then(|n| n.checked_add(row_bytes))
            .ok_or_else(|| CameraError::InvalidFrameGeometry("frame size overflows".into()))?;
        if raw.data.len() < required {
            return invalid(format!(
                "buffer holds {} bytes, geometry needs {}",
                raw.data.len(),
                required
            ));
        }

        Ok(Self {
            bytes_per_pixel,
            row_bytes,
            packed_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rows filled with their index, padding filled with 0xEE
    fn padded_frame(width: u32, height: u32, pixel_stride: u32, row_stride: u32) -> Vec<u8> {
        let row_bytes = (width * pixel_stride) as usize;
        let mut data = vec![0xEE; row_stride as usize * height as usize];
        for row in 0..height as usize {
            let start = row * row_stride as usize;
            data[start..start + row_bytes].fill((row % 251) as u8);
        }
        data
    }

    fn raw(data: &[u8], width: u32, height: u32, pixel_stride: u32, row_stride: u32) -> RawFrameBuffer<'_> {
        RawFrameBuffer {
            width,
            height,
            pixel_stride,
            row_stride,
            data,
        }
    }

    #[test]
    fn packed_source_is_copied_verbatim() {
        let data: Vec<u8> = (0..4 * 3 * 2).map(|i| i as u8).collect();
        let frame = FrameDecoder::default()
            .decode(&raw(&data, 4, 2, 3, 12), None)
            .unwrap();
        assert_eq!(frame.data, data);

        let again = FrameDecoder::default()
            .decode(&raw(&data, 4, 2, 3, 12), None)
            .unwrap();
        assert_eq!(frame, again);
    }

    #[test]
    fn padded_rows_are_stripped() {
        let data = padded_frame(1920, 1080, 4, 7744);
        let input = raw(&data, 1920, 1080, 4, 7744);
        let frame = FrameDecoder::default().decode(&input, None).unwrap();

        assert_eq!(input.actual_row_bytes(), 7680);
        assert_eq!(frame.data.len(), 7680 * 1080);
        assert!(!frame.data.contains(&0xEE));
        for r in 0..1080 {
            assert_eq!(frame.row(r), Some(&data[r * 7744..r * 7744 + 7680]));
        }
    }

    #[test]
    fn last_row_without_padding_is_accepted() {
        let mut data = padded_frame(3, 3, 2, 8);
        data.truncate(8 * 2 + 6);
        let frame = FrameDecoder::default()
            .decode(&raw(&data, 3, 3, 2, 8), None)
            .unwrap();
        assert_eq!(frame.row(2), Some(&[2u8; 6][..]));
        assert_eq!(frame.row(3), None);
    }

    #[test]
    fn flip_reverses_rows_once() {
        let data = padded_frame(2, 3, 1, 4);
        let frame = FrameDecoder::new(Orientation::FlipVertical)
            .decode(&raw(&data, 2, 3, 1, 4), None)
            .unwrap();
        assert_eq!(frame.data, vec![2, 2, 1, 1, 0, 0]);
    }

    #[test]
    fn flip_applies_to_packed_source() {
        let data = vec![1, 1, 2, 2];
        let frame = FrameDecoder::new(Orientation::FlipVertical)
            .decode(&raw(&data, 1, 2, 2, 2), None)
            .unwrap();
        assert_eq!(frame.data, vec![2, 2, 1, 1]);
    }

    #[test]
    fn matching_buffer_is_reused() {
        let data = padded_frame(8, 4, 4, 40);
        let decoder = FrameDecoder::default();
        let first = decoder.decode(&raw(&data, 8, 4, 4, 40), None).unwrap();
        let ptr = first.data.as_ptr();

        let second = decoder.decode(&raw(&data, 8, 4, 4, 40), Some(first)).unwrap();
        assert_eq!(second.data.as_ptr(), ptr);
    }

    #[test]
    fn rejected_frame_keeps_the_spare_buffer() {
        let data = padded_frame(8, 4, 4, 40);
        let decoder = FrameDecoder::default();
        let mut spare = Some(decoder.decode(&raw(&data, 8, 4, 4, 40), None).unwrap());
        let ptr = spare.as_ref().unwrap().data.as_ptr();

        let short = &data[..100];
        assert!(decoder.decode_recycling(&raw(short, 8, 4, 4, 40), &mut spare).is_err());
        assert!(spare.is_some());

        let frame = decoder.decode_recycling(&raw(&data, 8, 4, 4, 40), &mut spare).unwrap();
        assert_eq!(frame.data.as_ptr(), ptr);
        assert!(spare.is_none());
    }

    #[test]
    fn resized_frame_reallocates() {
        let small = padded_frame(4, 4, 4, 16);
        let large = padded_frame(8, 8, 4, 32);
        let decoder = FrameDecoder::default();
        let first = decoder.decode(&raw(&small, 4, 4, 4, 16), None).unwrap();

        let second = decoder.decode(&raw(&large, 8, 8, 4, 32), Some(first)).unwrap();
        assert_eq!((second.width, second.height), (8, 8));
        assert_eq!(second.data.len(), 8 * 8 * 4);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let data = vec![0u8; 64];
        let decoder = FrameDecoder::default();
        let cases = [
            raw(&data, 0, 4, 4, 16),
            raw(&data, 4, 0, 4, 16),
            raw(&data, 4, 4, 0, 16),
            raw(&data, 4, 4, 4, 12),
            raw(&data, 4, 8, 4, 16),
        ];
        for case in cases {
            assert!(matches!(
                decoder.decode(&case, None),
                Err(CameraError::InvalidFrameGeometry(_))
            ));
        }
    }
}
