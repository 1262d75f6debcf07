// PIXEL CONVERT - Float RGBA to wire formats
//
// The render host hands us float RGBA, bottom row first.
// Network receivers want top-down 8-bit 4:2:2, packed RGBA, or 16-bit
// planar 4:2:2 for HDR. This module is the CPU reference for all three;
// GPU backends must match it within one LSB.
//
// Every routine flips rows in the same pass that converts them.

use crate::frame::{EncodedFrame, PixelLayout, RawFrame};
use crate::metadata::TransferFunction;
use serde::{Deserialize, Serialize};

// ============================================================================
// Colour Matrices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorMatrix {
    BT709,  // HD
    BT2020, // UHD/HDR (non-constant luminance)
}

impl ColorMatrix {
    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::BT709 => (0.2126, 0.0722),
            Self::BT2020 => (0.2627, 0.0593),
        }
    }

    /// HDR transfer functions travel with BT.2020, SDR with BT.709
    pub fn for_transfer(transfer: TransferFunction) -> Self {
        match transfer {
            TransferFunction::Sdr => Self::BT709,
            TransferFunction::Pq | TransferFunction::Hlg => Self::BT2020,
        }
    }

    /// Planar16 only carries HDR output and is always BT.2020
    pub fn for_layout(layout: PixelLayout) -> Self {
        match layout {
            PixelLayout::Rgba8 | PixelLayout::Uyvy422 => Self::BT709,
            PixelLayout::Planar16_422 => Self::BT2020,
        }
    }

    /// RGB to Y'CbCr matrix, rows are Y, Cb, Cr
    pub fn rgb_to_yuv_matrix(&self) -> [[f32; 3]; 3] {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;

        // Y  = Wr*R + Wg*G + Wb*B
        // Cb = (B - Y) / (2 * (1 - Wb))
        // Cr = (R - Y) / (2 * (1 - Wr))
        let cb_scale = 1.0 / (2.0 * (1.0 - wb));
        let cr_scale = 1.0 / (2.0 * (1.0 - wr));

        [
            [wr, wg, wb],
            [-wr * cb_scale, -wg * cb_scale, 0.5],
            [0.5, -wg * cr_scale, -wb * cr_scale],
        ]
    }
}

// ============================================================================
// Quantisation
// ============================================================================

/// Limited-range 16-bit luma: 16 << 8 .. 235 << 8
pub const LUMA16_MIN: u16 = 4096;
pub const LUMA16_MAX: u16 = 60160;
/// Limited-range 16-bit chroma: 16 << 8 .. 240 << 8, centred on 128 << 8
pub const CHROMA16_MIN: u16 = 4096;
pub const CHROMA16_MAX: u16 = 61440;
const CHROMA16_MID: f32 = 32768.0;

#[inline]
fn unit(v: f32) -> f32 {
    // NaN compares false everywhere, map it to black
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[inline]
fn luma8(y: f32) -> u8 {
    (y * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
fn chroma8(c: f32) -> u8 {
    (128.0 + c * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
fn luma16(y: f32) -> u16 {
    let range = (LUMA16_MAX - LUMA16_MIN) as f32;
    (LUMA16_MIN as f32 + y * range)
        .round()
        .clamp(LUMA16_MIN as f32, LUMA16_MAX as f32) as u16
}

#[inline]
fn chroma16(c: f32) -> u16 {
    let range = (CHROMA16_MAX - CHROMA16_MIN) as f32;
    (CHROMA16_MID + c * range)
        .round()
        .clamp(CHROMA16_MIN as f32, CHROMA16_MAX as f32) as u16
}

// ============================================================================
// Converter
// ============================================================================

/// Pixel pair after matrixing: two lumas and the pair's averaged chroma
#[derive(Debug, Clone, Copy)]
struct PairSample {
    y0: f32,
    y1: f32,
    u: f32,
    v: f32,
}

#[derive(Debug)]
pub struct PixelConverter {
    // Pre-computed forward matrices
    bt709: [[f32; 3]; 3],
    bt2020: [[f32; 3]; 3],
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelConverter {
    pub fn new() -> Self {
        Self {
            bt709: ColorMatrix::BT709.rgb_to_yuv_matrix(),
            bt2020: ColorMatrix::BT2020.rgb_to_yuv_matrix(),
        }
    }

    fn matrix(&self, matrix: ColorMatrix) -> &[[f32; 3]; 3] {
        match matrix {
            ColorMatrix::BT709 => &self.bt709,
            ColorMatrix::BT2020 => &self.bt2020,
        }
    }

    #[inline]
    fn yuv(m: &[[f32; 3]; 3], px: &[f32]) -> (f32, f32, f32) {
        let r = unit(px[0]);
        let g = unit(px[1]);
        let b = unit(px[2]);
        (
            m[0][0] * r + m[0][1] * g + m[0][2] * b,
            m[1][0] * r + m[1][1] * g + m[1][2] * b,
            m[2][0] * r + m[2][1] * g + m[2][2] * b,
        )
    }

    /// Matrix the pixel pair starting at column `x`.
    /// A trailing odd column is paired with itself.
    #[inline]
    fn pair(m: &[[f32; 3]; 3], row: &[f32], x: usize, width: usize) -> PairSample {
        let p0 = &row[x * 4..x * 4 + 4];
        let p1 = if x + 1 < width {
            &row[(x + 1) * 4..(x + 1) * 4 + 4]
        } else {
            p0
        };
        let (y0, u0, v0) = Self::yuv(m, p0);
        let (y1, u1, v1) = Self::yuv(m, p1);
        PairSample {
            y0,
            y1,
            u: (u0 + u1) * 0.5,
            v: (v0 + v1) * 0.5,
        }
    }

    /// RGBA float -> UYVY 4:2:2, BT.709, full-range 8-bit
    pub fn convert_to_uyvy(&self, src: &RawFrame, dst: &mut EncodedFrame) {
        let width = src.width() as usize;
        let height = src.height() as usize;
        dst.prepare(PixelLayout::Uyvy422, src.width(), src.height());
        let stride = dst.stride();
        let m = *self.matrix(ColorMatrix::for_layout(PixelLayout::Uyvy422));

        let Some(out) = dst.packed_mut() else {
            return;
        };

        for y in 0..height {
            let src_row = src.flipped_row(y);
            let dst_row = &mut out[y * stride..(y + 1) * stride];

            for x in (0..width).step_by(2) {
                let s = Self::pair(&m, src_row, x, width);
                let o = x * 2;
                dst_row[o] = chroma8(s.u);
                dst_row[o + 1] = luma8(s.y0);
                if x + 1 < width {
                    dst_row[o + 2] = chroma8(s.v);
                    dst_row[o + 3] = luma8(s.y1);
                }
            }
        }
    }

    /// RGBA float -> 16-bit planar 4:2:2, limited range, BT.2020.
    /// The transfer function is a label on the frame, not applied here.
    pub fn convert_to_planar16(&self, src: &RawFrame, dst: &mut EncodedFrame) {
        let width = src.width() as usize;
        let height = src.height() as usize;
        dst.prepare(PixelLayout::Planar16_422, src.width(), src.height());
        let m = *self.matrix(ColorMatrix::for_layout(PixelLayout::Planar16_422));

        let Some((y_plane, uv_plane)) = dst.planes_mut() else {
            return;
        };

        for y in 0..height {
            let src_row = src.flipped_row(y);
            let y_row = &mut y_plane[y * width..(y + 1) * width];
            let uv_row = &mut uv_plane[y * width..(y + 1) * width];

            for x in (0..width).step_by(2) {
                let s = Self::pair(&m, src_row, x, width);
                y_row[x] = luma16(s.y0);
                uv_row[x] = chroma16(s.u);
                if x + 1 < width {
                    y_row[x + 1] = luma16(s.y1);
                    uv_row[x + 1] = chroma16(s.v);
                }
            }
        }
    }

    /// RGBA float -> RGBA8, per-channel clamp and scale
    pub fn convert_to_rgba8(&self, src: &RawFrame, dst: &mut EncodedFrame) {
        let width = src.width() as usize;
        let height = src.height() as usize;
        dst.prepare(PixelLayout::Rgba8, src.width(), src.height());
        let stride = dst.stride();

        let Some(out) = dst.packed_mut() else {
            return;
        };

        for y in 0..height {
            let src_row = src.flipped_row(y);
            let dst_row = &mut out[y * stride..(y + 1) * stride];
            for (o, v) in dst_row.iter_mut().zip(&src_row[..width * 4]) {
                *o = luma8(unit(*v));
            }
        }
    }

    /// Convert into whichever layout `dst` should carry
    pub fn convert(&self, layout: PixelLayout, src: &RawFrame, dst: &mut EncodedFrame) {
        match layout {
            PixelLayout::Rgba8 => self.convert_to_rgba8(src, dst),
            PixelLayout::Uyvy422 => self.convert_to_uyvy(src, dst),
            PixelLayout::Planar16_422 => self.convert_to_planar16(src, dst),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
