//! # Frame Types
//!
//! Source frames arrive as float RGBA from the render host, bottom row first.
//! Encoded frames hold the wire layout handed to the transport:
//!
//! ```text
//! RGBA8      [R G B A][R G B A]...                 stride = width * 4
//! UYVY422    [U Y0 V Y1][U Y0 V Y1]...             stride = width * 2
//! Planar16   Y plane:  width x height  u16         stride = width * 2
//!            UV plane: width x height  u16 (U,V interleaved, half width)
//! ```

use crate::metadata::ColorimetryDescriptor;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },
    #[error("Pixel buffer holds {actual} samples, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

// ============================================================================
// Layout / Mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorMode {
    Sdr,
    Hdr,
}

/// Wire layout of an encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    Rgba8,
    Uyvy422,
    Planar16_422,
}

/// Four-character code the transport uses to tag a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const RGBA: FourCC = FourCC(*b"RGBA");
    pub const UYVY: FourCC = FourCC(*b"UYVY");
    pub const P216: FourCC = FourCC(*b"P216");

    /// Little-endian packed value, as carried in C frame structs
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl PixelLayout {
    pub fn fourcc(&self) -> FourCC {
        match self {
            Self::Rgba8 => FourCC::RGBA,
            Self::Uyvy422 => FourCC::UYVY,
            Self::Planar16_422 => FourCC::P216,
        }
    }

    /// Row stride in bytes (first plane for planar layouts)
    pub fn stride(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            Self::Rgba8 => w * 4,
            Self::Uyvy422 | Self::Planar16_422 => w * 2,
        }
    }

    /// Total buffer size in bytes
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgba8 => pixels * 4,
            Self::Uyvy422 => pixels * 2,
            // Y plane + UV plane, both width*height u16 samples
            Self::Planar16_422 => pixels * 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, Self::Planar16_422)
    }
}

// ============================================================================
// Frame Descriptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    width: u32,
    height: u32,
    color_mode: ColorMode,
    layout: PixelLayout,
    frame_rate_num: i32,
    frame_rate_den: i32,
}

impl FrameDescriptor {
    pub fn new(
        width: u32,
        height: u32,
        color_mode: ColorMode,
        layout: PixelLayout,
        frame_rate_num: i32,
        frame_rate_den: i32,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions {
                width: width as i64,
                height: height as i64,
            });
        }
        Ok(Self {
            width,
            height,
            color_mode,
            layout,
            frame_rate_num,
            frame_rate_den,
        })
    }

    /// Validate host-side signed dimensions
    pub fn dimensions_from_host(width: i32, height: i32) -> Result<(u32, u32), FrameError> {
        match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
            _ => Err(FrameError::InvalidDimensions {
                width: width as i64,
                height: height as i64,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn frame_rate(&self) -> (i32, i32) {
        (self.frame_rate_num, self.frame_rate_den)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

// ============================================================================
// Raw Frame
// ============================================================================

/// Float RGBA frame from the producer, rows stored bottom to top
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    width: u32,
    height: u32,
    pixels: Vec<f32>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions {
                width: width as i64,
                height: height as i64,
            });
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Snapshot a borrowed host buffer
    pub fn from_slice(width: u32, height: u32, pixels: &[f32]) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Self::new(width, height, pixels.to_vec())
    }

    /// Uniform colour fill, mostly for tests and test patterns
    pub fn filled(width: u32, height: u32, rgba: [f32; 4]) -> Result<Self, FrameError> {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self::new(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Mutable access for producers filling a frame in place
    pub fn pixels_mut(&mut self) -> &mut [f32] {
        &mut self.pixels
    }

    /// Source row that lands on output row `out_row` (vertical flip)
    #[inline]
    pub fn flipped_row(&self, out_row: usize) -> &[f32] {
        let row_len = self.width as usize * 4;
        let src_row = self.height as usize - 1 - out_row;
        &self.pixels[src_row * row_len..(src_row + 1) * row_len]
    }
}

// ============================================================================
// Encoded Frame
// ============================================================================

/// Storage for an encoded frame, discriminated by sample width
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    Packed8(Vec<u8>),
    Planar16(Vec<u16>),
}

impl PixelBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Packed8(data) => data,
            Self::Planar16(data) => bytemuck::cast_slice(data),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Packed8(data) => data,
            Self::Planar16(data) => bytemuck::cast_slice_mut(data),
        }
    }
}

/// Reusable output buffer, owned by exactly one conversion path
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    layout: PixelLayout,
    width: u32,
    height: u32,
    buffer: PixelBuffer,
}

impl EncodedFrame {
    pub fn new(layout: PixelLayout, width: u32, height: u32) -> Self {
        let mut frame = Self {
            layout,
            width: 0,
            height: 0,
            buffer: PixelBuffer::Packed8(Vec::new()),
        };
        frame.prepare(layout, width, height);
        frame
    }

    /// Size the buffer for `layout` at `width`x`height`.
    /// Keeps the existing allocation when nothing changed.
    pub fn prepare(&mut self, layout: PixelLayout, width: u32, height: u32) {
        let unchanged = self.layout == layout
            && self.width == width
            && self.height == height
            && self.buffer.as_bytes().len() == layout.buffer_size(width, height);
        if unchanged {
            return;
        }

        let pixels = width as usize * height as usize;
        self.buffer = match layout {
            PixelLayout::Rgba8 | PixelLayout::Uyvy422 => {
                let mut data = match std::mem::replace(&mut self.buffer, PixelBuffer::Packed8(Vec::new())) {
                    PixelBuffer::Packed8(data) => data,
                    PixelBuffer::Planar16(_) => Vec::new(),
                };
                data.resize(layout.buffer_size(width, height), 0);
                PixelBuffer::Packed8(data)
            }
            PixelLayout::Planar16_422 => {
                let mut data = match std::mem::replace(&mut self.buffer, PixelBuffer::Packed8(Vec::new())) {
                    PixelBuffer::Planar16(data) => data,
                    PixelBuffer::Packed8(_) => Vec::new(),
                };
                data.resize(pixels * 2, 0);
                PixelBuffer::Planar16(data)
            }
        };
        self.layout = layout;
        self.width = width;
        self.height = height;
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.layout.stride(self.width)
    }

    pub fn fourcc(&self) -> FourCC {
        self.layout.fourcc()
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.as_bytes_mut()
    }

    /// Packed 8-bit samples, `None` for planar layouts
    pub fn packed_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.buffer {
            PixelBuffer::Packed8(data) => Some(data),
            PixelBuffer::Planar16(_) => None,
        }
    }

    /// Y and UV planes, `None` for packed layouts
    pub fn planes(&self) -> Option<(&[u16], &[u16])> {
        match &self.buffer {
            PixelBuffer::Planar16(data) => {
                let y_len = self.width as usize * self.height as usize;
                Some(data.split_at(y_len))
            }
            PixelBuffer::Packed8(_) => None,
        }
    }

    pub fn planes_mut(&mut self) -> Option<(&mut [u16], &mut [u16])> {
        let y_len = self.width as usize * self.height as usize;
        match &mut self.buffer {
            PixelBuffer::Planar16(data) => Some(data.split_at_mut(y_len)),
            PixelBuffer::Packed8(_) => None,
        }
    }

    /// Number of 16-bit samples for planar frames, bytes otherwise
    pub fn sample_count(&self) -> usize {
        match &self.buffer {
            PixelBuffer::Packed8(data) => data.len(),
            PixelBuffer::Planar16(data) => data.len(),
        }
    }

    /// Check the buffer length against the declared layout and size
    pub fn is_consistent(&self) -> bool {
        self.as_bytes().len() == self.layout.buffer_size(self.width, self.height)
    }
}

// ============================================================================
// Queue Entry
// ============================================================================

/// One frame handed from the producer to the async worker
#[derive(Debug)]
pub struct QueueEntry {
    pub frame: RawFrame,
    pub descriptor: FrameDescriptor,
    /// Colorimetry in effect when the frame was submitted
    pub colorimetry: ColorimetryDescriptor,
    pub enqueued_at: Instant,
    /// Producer-assigned sequence number
    pub sequence: u64,
}

impl QueueEntry {
    pub fn new(
        frame: RawFrame,
        descriptor: FrameDescriptor,
        colorimetry: ColorimetryDescriptor,
        sequence: u64,
    ) -> Self {
        Self {
            frame,
            descriptor,
            colorimetry,
            enqueued_at: Instant::now(),
            sequence,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(PixelLayout::Rgba8.buffer_size(4, 3), 48);
        assert_eq!(PixelLayout::Uyvy422.buffer_size(5, 3), 30);
        assert_eq!(PixelLayout::Planar16_422.buffer_size(5, 3), 60);
        assert_eq!(PixelLayout::Uyvy422.stride(1920), 3840);
        assert_eq!(PixelLayout::Rgba8.stride(1920), 7680);
    }

    #[test]
    fn test_descriptor_rejects_zero() {
        let err = FrameDescriptor::new(0, 10, ColorMode::Sdr, PixelLayout::Rgba8, 25, 1);
        assert!(matches!(err, Err(FrameError::InvalidDimensions { .. })));
        assert!(FrameDescriptor::dimensions_from_host(-4, 10).is_err());
        assert!(FrameDescriptor::dimensions_from_host(4, 0).is_err());
        assert_eq!(FrameDescriptor::dimensions_from_host(4, 2), Ok((4, 2)));
    }

    #[test]
    fn test_raw_frame_length_checked() {
        assert!(RawFrame::new(2, 2, vec![0.0; 15]).is_err());
        let frame = RawFrame::new(2, 2, vec![0.0; 16]).unwrap();
        assert_eq!(frame.pixels().len(), 16);
    }

    #[test]
    fn test_flipped_row() {
        let mut pixels = vec![0.0; 2 * 3 * 4];
        // bottom row (row 0 in memory) marked with 1.0
        pixels[0] = 1.0;
        let frame = RawFrame::new(2, 3, pixels).unwrap();
        assert_eq!(frame.flipped_row(2)[0], 1.0);
        assert_eq!(frame.flipped_row(0)[0], 0.0);
    }

    #[test]
    fn test_encoded_frame_reuses_allocation() {
        let mut frame = EncodedFrame::new(PixelLayout::Uyvy422, 64, 32);
        let ptr = frame.as_bytes().as_ptr();
        frame.prepare(PixelLayout::Uyvy422, 64, 32);
        assert_eq!(frame.as_bytes().as_ptr(), ptr);
        assert!(frame.is_consistent());

        frame.prepare(PixelLayout::Planar16_422, 64, 32);
        assert_eq!(frame.as_bytes().len(), 64 * 32 * 4);
        let (y, uv) = frame.planes().unwrap();
        assert_eq!(y.len(), 64 * 32);
        assert_eq!(uv.len(), 64 * 32);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_fourcc() {
        assert_eq!(PixelLayout::Uyvy422.fourcc().to_string(), "UYVY");
        assert_eq!(FourCC::RGBA.as_u32(), u32::from_le_bytes(*b"RGBA"));
    }
}
