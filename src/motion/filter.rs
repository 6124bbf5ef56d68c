//! Single-channel image operations used by the frame differencer

use once_cell::sync::Lazy;

use super::Rect;
use crate::capture::Frame;

/// Fixed-point scale of the Gaussian taps
const KERNEL_ONE: u32 = 1 << 16;

/// Default 21-tap kernel, built once
static KERNEL_21: Lazy<Vec<u32>> = Lazy::new(|| build_kernel(21));

/// 8-bit single-channel plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayPlane {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn same_size(&self, other: &GrayPlane) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// Crop `roi` out of the frame and convert it to luminance.
///
/// The caller guarantees the region fits inside the frame.
pub fn crop_luma(frame: &Frame, roi: Rect) -> GrayPlane {
    let format = frame.meta.format;
    let channels = format.channels();
    let mut out = Vec::with_capacity(roi.w as usize * roi.h as usize);

    for y in roi.y..roi.y + roi.h {
        let row = frame.row(y);
        let start = roi.x as usize * channels;
        let end = (roi.x + roi.w) as usize * channels;
        out.extend(row[start..end].chunks_exact(channels).map(|px| format.luma(px)));
    }

    GrayPlane {
        width: roi.w,
        height: roi.h,
        data: out,
    }
}

/// Gaussian taps for an odd kernel size, sigma derived from the size
fn build_kernel(ksize: u32) -> Vec<u32> {
    let ksize = ksize | 1;
    let half = (ksize / 2) as i32;
    let sigma = 0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let scale = -0.5 / (sigma * sigma);

    let raw: Vec<f64> = (-half..=half)
        .map(|i| ((i * i) as f64 * scale).exp())
        .collect();
    let sum: f64 = raw.iter().sum();

    let mut taps: Vec<u32> = raw
        .iter()
        .map(|w| (w / sum * KERNEL_ONE as f64).round() as u32)
        .collect();

    // Push rounding drift into the centre tap so the taps sum to exactly one
    let total: u32 = taps.iter().sum();
    let centre = half as usize;
    taps[centre] = (taps[centre] + KERNEL_ONE).saturating_sub(total);
    taps
}

/// Separable Gaussian blur with replicated borders. Kernel sizes below 3 are a no-op.
pub fn gaussian_blur(src: &GrayPlane, ksize: u32) -> GrayPlane {
    if ksize < 3 || src.data.is_empty() {
        return src.clone();
    }

    let owned;
    let taps: &[u32] = if (ksize | 1) == 21 {
        KERNEL_21.as_slice()
    } else {
        owned = build_kernel(ksize);
        &owned
    };
    let half = (taps.len() / 2) as i64;

    let w = src.width as usize;
    let h = src.height as usize;
    let clamp = |v: i64, len: usize| v.clamp(0, len as i64 - 1) as usize;

    // Horizontal pass keeps 8 fractional bits
    let mut tmp = vec![0u16; w * h];
    for y in 0..h {
        let row = &src.data[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0u32;
            for (k, tap) in taps.iter().enumerate() {
                let sx = clamp(x as i64 + k as i64 - half, w);
                acc += tap * row[sx] as u32;
            }
            tmp[y * w + x] = ((acc + (1 << 7)) >> 8) as u16;
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u64;
            for (k, tap) in taps.iter().enumerate() {
                let sy = clamp(y as i64 + k as i64 - half, h);
                acc += *tap as u64 * tmp[sy * w + x] as u64;
            }
            out[y * w + x] = ((acc + (1 << 23)) >> 24).min(255) as u8;
        }
    }

    GrayPlane {
        width: src.width,
        height: src.height,
        data: out,
    }
}

/// |a - b| > threshold → 255, else 0
pub fn diff_mask(a: &GrayPlane, b: &GrayPlane, threshold: u8) -> GrayPlane {
    let data = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&p, &q)| if p.abs_diff(q) > threshold { 255 } else { 0 })
        .collect();

    GrayPlane {
        width: a.width,
        height: a.height,
        data,
    }
}

/// Binary dilation with a 3x3 square element
pub fn dilate(mask: &GrayPlane, iterations: u32) -> GrayPlane {
    let w = mask.width as usize;
    let h = mask.height as usize;
    let mut cur = mask.data.clone();
    let mut tmp = vec![0u8; cur.len()];

    for _ in 0..iterations {
        for y in 0..h {
            for x in 0..w {
                let lo = x.saturating_sub(1);
                let hi = (x + 1).min(w - 1);
                tmp[y * w + x] = cur[y * w + lo..=y * w + hi].iter().copied().max().unwrap_or(0);
            }
        }
        for y in 0..h {
            let lo = y.saturating_sub(1);
            let hi = (y + 1).min(h - 1);
            for x in 0..w {
                cur[y * w + x] = (lo..=hi).map(|sy| tmp[sy * w + x]).max().unwrap_or(0);
            }
        }
    }

    GrayPlane {
        width: mask.width,
        height: mask.height,
        data: cur,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_taps_sum_to_one() {
        for k in [3, 5, 21] {
            let taps = build_kernel(k);
            assert_eq!(taps.len(), k as usize);
            assert_eq!(taps.iter().sum::<u32>(), KERNEL_ONE);
            assert!(taps[k as usize / 2] >= taps[0]);
        }
    }

    #[test]
    fn blur_keeps_flat_image_flat() {
        let mut plane = GrayPlane::new(40, 30);
        plane.data.fill(117);
        let blurred = gaussian_blur(&plane, 21);
        assert!(blurred.data.iter().all(|&p| p == 117));
    }

    #[test]
    fn blur_spreads_a_step() {
        let mut plane = GrayPlane::new(41, 1);
        for x in 20..41 {
            plane.data[x] = 200;
        }
        let blurred = gaussian_blur(&plane, 21);
        assert!(blurred.get(0, 0) < 5);
        assert!(blurred.get(40, 0) > 195);
        let edge = blurred.get(20, 0);
        assert!((100..140).contains(&edge), "edge value {}", edge);
    }

    #[test]
    fn dilate_grows_a_pixel() {
        let mut mask = GrayPlane::new(7, 7);
        mask.data[3 * 7 + 3] = 255;
        let grown = dilate(&mask, 2);
        let set = grown.data.iter().filter(|&&p| p == 255).count();
        assert_eq!(set, 25);
        assert_eq!(grown.get(1, 1), 255);
        assert_eq!(grown.get(0, 0), 0);
    }

    #[test]
    fn diff_mask_is_strictly_greater_than_threshold() {
        let a = GrayPlane {
            width: 3,
            height: 1,
            data: vec![10, 10, 10],
        };
        let b = GrayPlane {
            width: 3,
            height: 1,
            data: vec![35, 36, 0],
        };
        let mask = diff_mask(&a, &b, 25);
        assert_eq!(mask.data, vec![0, 255, 0]);
    }
}
