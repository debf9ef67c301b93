//! Decoded pixel data and the few pure pixel operations the caches need.
//!
//! Everything here is a pure function over RGBA buffers: no locks, no I/O.

use crate::cache::CacheValue;
use crate::media::Resolution;

/// Decoded RGBA image ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    /// RGBA pixel data, row-major
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Sub-rectangle of a raster, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ClipRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl Raster {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Raster filled with one color.
    pub fn solid(resolution: Resolution, color: [u8; 4]) -> Self {
        let mut pixels = vec![0u8; resolution.rgba_bytes()];
        fill(&mut pixels, color);
        Self::new(pixels, resolution.width, resolution.height)
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Memory size in bytes
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }

    /// Any pixel with alpha below 255.
    pub fn has_transparency(&self) -> bool {
        self.pixels.chunks_exact(4).any(|px| px[3] < 255)
    }

    /// Resize using bilinear interpolation
    pub fn resized(&self, target: Resolution) -> Raster {
        let pixels = resize_bilinear(
            &self.pixels,
            self.width,
            self.height,
            target.width.max(1),
            target.height.max(1),
        );
        Raster::new(pixels, target.width.max(1), target.height.max(1))
    }

    /// Scale so the raster covers `target`, then center-crop to it.
    pub fn resized_to_fill(&self, target: Resolution) -> Raster {
        if self.width == 0 || self.height == 0 {
            return Raster::solid(target, [0, 0, 0, 255]);
        }
        let scale = f64::max(
            target.width as f64 / self.width as f64,
            target.height as f64 / self.height as f64,
        );
        let covered = Resolution::new(
            ((self.width as f64 * scale).round() as u32).max(target.width),
            ((self.height as f64 * scale).round() as u32).max(target.height),
        );
        let scaled = self.resized(covered);
        let x = (covered.width - target.width) / 2;
        let y = (covered.height - target.height) / 2;
        scaled.cropped(ClipRect::new(x, y, target.width, target.height))
    }

    /// Copy out a sub-rectangle, clamped to the raster bounds.
    pub fn cropped(&self, clip: ClipRect) -> Raster {
        let x0 = clip.x.min(self.width);
        let y0 = clip.y.min(self.height);
        let w = clip.width.min(self.width - x0);
        let h = clip.height.min(self.height - y0);

        let src_stride = self.width as usize * 4;
        let row_len = w as usize * 4;
        let mut pixels = Vec::with_capacity(row_len * h as usize);
        for row in y0..y0 + h {
            let start = row as usize * src_stride + x0 as usize * 4;
            pixels.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        Raster::new(pixels, w, h)
    }
}

impl CacheValue for Raster {
    fn estimated_memory_footprint(&self) -> usize {
        self.memory_size()
    }
}

/// Fill an RGBA buffer with a solid color
#[inline]
pub fn fill(frame: &mut [u8], color: [u8; 4]) {
    // Fast path for black (most common)
    if color == [0, 0, 0, 255] {
        frame.fill(0);
        for chunk in frame.chunks_exact_mut(4) {
            chunk[3] = 255;
        }
    } else {
        for chunk in frame.chunks_exact_mut(4) {
            chunk.copy_from_slice(&color);
        }
    }
}

/// Resize using bilinear interpolation
pub fn resize_bilinear(data: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    if src_w == dst_w && src_h == dst_h {
        return data.to_vec();
    }
    if src_w == 0 || src_h == 0 {
        return vec![0u8; dst_w as usize * dst_h as usize * 4];
    }

    let src_w = src_w as usize;
    let src_h = src_h as usize;
    let dst_w = dst_w as usize;
    let dst_h = dst_h as usize;

    let mut result = vec![0u8; dst_w * dst_h * 4];

    let x_ratio = (src_w as f64 - 1.0) / dst_w.max(1) as f64;
    let y_ratio = (src_h as f64 - 1.0) / dst_h.max(1) as f64;

    for y in 0..dst_h {
        let src_y = y as f64 * y_ratio;
        let y0 = src_y.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let y_frac = src_y - y0 as f64;

        for x in 0..dst_w {
            let src_x = x as f64 * x_ratio;
            let x0 = src_x.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let x_frac = src_x - x0 as f64;

            let idx00 = (y0 * src_w + x0) * 4;
            let idx01 = (y0 * src_w + x1) * 4;
            let idx10 = (y1 * src_w + x0) * 4;
            let idx11 = (y1 * src_w + x1) * 4;
            let dst_idx = (y * dst_w + x) * 4;

            for c in 0..4 {
                let v00 = data.get(idx00 + c).copied().unwrap_or(0) as f64;
                let v01 = data.get(idx01 + c).copied().unwrap_or(0) as f64;
                let v10 = data.get(idx10 + c).copied().unwrap_or(0) as f64;
                let v11 = data.get(idx11 + c).copied().unwrap_or(0) as f64;

                let v0 = v00 * (1.0 - x_frac) + v01 * x_frac;
                let v1 = v10 * (1.0 - x_frac) + v11 * x_frac;
                let v = v0 * (1.0 - y_frac) + v1 * y_frac;

                result[dst_idx + c] = v.round() as u8;
            }
        }
    }

    result
}
