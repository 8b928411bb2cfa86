//! Video frame payloads.

use bytemuck::{Pod, Zeroable};

use crate::payload::zeroed_box;

/// Pixel layout of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    /// Interleaved 8-bit red, green, blue.
    Rgb,
    /// Interleaved 8-bit red, green, blue, alpha.
    Rgba,
    /// Full-resolution luma plane followed by interleaved half-resolution
    /// chroma.
    Nv12,
}

impl ImageType {
    /// Interleaved channels per pixel, or `None` for a planar layout.
    pub const fn channels(self) -> Option<usize> {
        match self {
            Self::Rgb => Some(3),
            Self::Rgba => Some(4),
            Self::Nv12 => None,
        }
    }

    /// Number of memory planes.
    pub const fn planes(self) -> usize {
        match self {
            Self::Rgb | Self::Rgba => 1,
            Self::Nv12 => 2,
        }
    }

    /// Bytes needed for one `width` x `height` frame.
    ///
    /// NV12 carries a full-resolution luma plane plus one interleaved
    /// chroma pair per 2x2 block.
    pub const fn frame_len(self, width: usize, height: usize) -> usize {
        match self {
            Self::Rgb => width * height * 3,
            Self::Rgba => width * height * 4,
            Self::Nv12 => width * height + width.div_ceil(2) * height.div_ceil(2) * 2,
        }
    }
}

const WIDTH_4K: usize = 3840;
const HEIGHT_4K: usize = 2160;
const CHANNELS_RGB: usize = 3;
const DATA_LEN_4K_RGB: usize = WIDTH_4K * HEIGHT_4K * CHANNELS_RGB;

/// A 3840x2160 RGB frame with capture metadata, stored fully inline.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Image4kRgb {
    /// Capture time in nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Monotonic frame counter assigned by the producer.
    pub frame_number: u64,
    /// Row-major interleaved RGB pixels.
    pub data: [u8; DATA_LEN_4K_RGB],
}

// SAFETY: repr(C), two u64 fields followed by a byte array whose length is a
// multiple of 8, so there is no padding; every bit pattern is valid.
#[allow(unsafe_code)]
unsafe impl Zeroable for Image4kRgb {}
#[allow(unsafe_code)]
unsafe impl Pod for Image4kRgb {}

impl Image4kRgb {
    /// Frame width in pixels.
    pub const WIDTH: usize = WIDTH_4K;
    /// Frame height in pixels.
    pub const HEIGHT: usize = HEIGHT_4K;
    /// Pixel layout.
    pub const IMAGE_TYPE: ImageType = ImageType::Rgb;
    /// Interleaved channels per pixel.
    pub const CHANNELS: usize = CHANNELS_RGB;
    /// Length of `data` in bytes.
    pub const DATA_LEN: usize = DATA_LEN_4K_RGB;

    /// `(height, width, channels)`.
    pub const fn shape() -> (usize, usize, usize) {
        (Self::HEIGHT, Self::WIDTH, Self::CHANNELS)
    }

    /// Zeroed frame allocated on the heap.
    pub fn new_boxed() -> Box<Self> {
        zeroed_box()
    }

    /// Set every pixel byte to `value`.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Pixel bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel bytes.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGB value at column `x`, row `y`, or `None` outside the frame.
    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= Self::WIDTH || y >= Self::HEIGHT {
            return None;
        }
        let offset = (y * Self::WIDTH + x) * Self::CHANNELS;
        let rgb = self.data.get(offset..offset + Self::CHANNELS)?;
        Some([rgb[0], rgb[1], rgb[2]])
    }
}

impl std::fmt::Debug for Image4kRgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image4kRgb")
            .field("timestamp", &self.timestamp)
            .field("frame_number", &self.frame_number)
            .field("shape", &Self::shape())
            .finish_non_exhaustive()
    }
}
