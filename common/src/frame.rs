use bytes::Bytes;

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale, one byte per pixel.
    Luma8,
    /// Packed 8-bit RGB.
    Rgb8,
    /// Packed 8-bit RGBA.
    Rgba8,
    /// Y plane followed by an interleaved half-resolution UV plane.
    Nv12,
}

impl PixelFormat {
    /// Number of bytes a `width x height` buffer of this format occupies.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Luma8 => pixels,
            PixelFormat::Rgb8 => pixels * 3,
            PixelFormat::Rgba8 => pixels * 4,
            // Chroma planes are subsampled 2x2, rounding up for odd sizes.
            PixelFormat::Nv12 => {
                let chroma_w = (width as usize).div_ceil(2);
                let chroma_h = (height as usize).div_ceil(2);
                pixels + chroma_w * chroma_h * 2
            }
        }
    }
}

/// Sensor rotation relative to the natural display orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    pub fn degrees(self) -> u16 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }
}

/// Requested capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One captured image plus metadata.
///
/// Frames are immutable once built: the pixel buffer is a shared `Bytes`
/// handle, so handing a frame to the scheduler or a decode worker only bumps
/// a reference count.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
    captured_at_ms: i64,
    seq: u64,
    orientation: Orientation,
}

impl Frame {
    /// Build a frame, checking that the buffer matches the declared geometry.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let data = data.into();
        let expected = format.buffer_len(width, height);
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                got: data.len(),
                expected,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            captured_at_ms,
            seq,
            orientation: Orientation::Deg0,
        })
    }

    /// Convenience constructor for 8-bit grayscale frames.
    pub fn luma8(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        Self::new(data, width, height, PixelFormat::Luma8, captured_at_ms, seq)
    }

    /// Returns a copy of this frame tagged with `orientation`.
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Returns a copy of this frame re-stamped with a new capture time and sequence number.
    /// The pixel buffer is shared, not copied.
    pub fn restamped(&self, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            captured_at_ms,
            seq,
            ..self.clone()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer has wrong size: got {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_frame_accepts_exact_buffer() {
        let frame = Frame::luma8(vec![0u8; 12], 4, 3, 1708300000000, 7).unwrap();
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 3);
        assert_eq!(frame.seq(), 7);
        assert_eq!(frame.orientation(), Orientation::Deg0);
    }

    #[test]
    fn wrong_buffer_size_rejected() {
        let result = Frame::new(vec![0u8; 10], 4, 3, PixelFormat::Rgb8, 0, 0);
        assert!(matches!(
            result,
            Err(FrameError::BufferSize {
                got: 10,
                expected: 36
            })
        ));
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(Frame::luma8(Vec::new(), 0, 3, 0, 0).is_err());
    }

    #[test]
    fn nv12_len_rounds_chroma_up() {
        // 3x3 luma + 2x2 chroma pairs
        assert_eq!(PixelFormat::Nv12.buffer_len(3, 3), 9 + 8);
        assert_eq!(PixelFormat::Nv12.buffer_len(4, 2), 8 + 4);
    }

    #[test]
    fn restamp_shares_pixels() {
        let frame = Frame::luma8(vec![1u8, 2, 3, 4], 2, 2, 10, 1)
            .unwrap()
            .with_orientation(Orientation::Deg90);
        let later = frame.restamped(20, 2);
        assert_eq!(later.captured_at_ms(), 20);
        assert_eq!(later.seq(), 2);
        assert_eq!(later.orientation(), Orientation::Deg90);
        assert_eq!(later.data().as_ptr(), frame.data().as_ptr());
    }
}
