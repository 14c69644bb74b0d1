//! Grayscale raster primitives.
//!
//! Everything here operates on [`GrayImage`] buffers or the shared BGR
//! colour layout; the detectors compose these into their pipelines.

use holoscan_core::Rgb;
use image::GrayImage;

/// Convert a BGR frame to grayscale with the usual luma weights.
pub fn grayscale(pixels: &[Rgb], width: u32, height: u32) -> GrayImage {
    let mut out = GrayImage::new(width, height);
    for (dst, px) in out.iter_mut().zip(pixels.iter()) {
        let luma = 0.299 * px.r as f32 + 0.587 * px.g as f32 + 0.114 * px.b as f32;
        *dst = luma.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Binary threshold: `>= level` becomes 255, everything else 0.
pub fn threshold(img: &GrayImage, level: u8) -> GrayImage {
    let mut out = img.clone();
    for p in out.iter_mut() {
        *p = if *p >= level { 255 } else { 0 };
    }
    out
}

/// Summed-area table with a zero row and column prepended, so the sum of
/// any rectangle is four lookups.
pub struct IntegralImage {
    width: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    pub fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sums = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0u64;
            for x in 0..w {
                row += img.as_raw()[y * w + x] as u64;
                sums[(y + 1) * stride + (x + 1)] = sums[y * stride + (x + 1)] + row;
            }
        }
        Self { width: stride, sums }
    }

    /// Sum over `[x0, x1) × [y0, y1)`.
    pub fn rect_sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> u64 {
        let s = &self.sums;
        let w = self.width;
        s[y1 * w + x1] + s[y0 * w + x0] - s[y0 * w + x1] - s[y1 * w + x0]
    }
}

/// 5×5 Gaussian blur (σ≈1), separable.
pub fn gaussian_blur_5x5(img: &GrayImage) -> GrayImage {
    const KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
    const NORM: f32 = 16.0;
    let (w, h) = (img.width() as i32, img.height() as i32);
    let src = img.as_raw();

    let sample = |buf: &[f32], x: i32, y: i32| -> f32 {
        let xc = x.clamp(0, w - 1);
        let yc = y.clamp(0, h - 1);
        buf[(yc * w + xc) as usize]
    };

    let srcf: Vec<f32> = src.iter().map(|&v| v as f32).collect();
    let mut horiz = vec![0.0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, &kv) in KERNEL.iter().enumerate() {
                acc += kv * sample(&srcf, x + k as i32 - 2, y);
            }
            horiz[(y * w + x) as usize] = acc / NORM;
        }
    }

    let mut out = GrayImage::new(img.width(), img.height());
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, &kv) in KERNEL.iter().enumerate() {
                acc += kv * sample(&horiz, x, y + k as i32 - 2);
            }
            out.put_pixel(
                x as u32,
                y as u32,
                image::Luma([(acc / NORM).round().clamp(0.0, 255.0) as u8]),
            );
        }
    }
    out
}

/// The 5×5 elliptical structuring element used for mask cleanup.
const ELLIPSE_5X5: [[bool; 5]; 5] = [
    [false, false, true, false, false],
    [true, true, true, true, true],
    [true, true, true, true, true],
    [true, true, true, true, true],
    [false, false, true, false, false],
];

fn morph_5x5(img: &GrayImage, erode: bool) -> GrayImage {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let src = img.as_raw();
    let mut out = GrayImage::new(img.width(), img.height());

    for y in 0..h {
        for x in 0..w {
            let mut hit = erode;
            'kernel: for (ky, row) in ELLIPSE_5X5.iter().enumerate() {
                for (kx, &on) in row.iter().enumerate() {
                    if !on {
                        continue;
                    }
                    let sx = (x + kx as i32 - 2).clamp(0, w - 1);
                    let sy = (y + ky as i32 - 2).clamp(0, h - 1);
                    let v = src[(sy * w + sx) as usize] > 0;
                    if erode && !v {
                        hit = false;
                        break 'kernel;
                    }
                    if !erode && v {
                        hit = true;
                        break 'kernel;
                    }
                }
            }
            out.put_pixel(x as u32, y as u32, image::Luma([if hit { 255 } else { 0 }]));
        }
    }
    out
}

/// Morphological open (erode then dilate) with the 5×5 ellipse.
pub fn morph_open(img: &GrayImage) -> GrayImage {
    morph_5x5(&morph_5x5(img, true), false)
}

/// Morphological close (dilate then erode) with the 5×5 ellipse.
pub fn morph_close(img: &GrayImage) -> GrayImage {
    morph_5x5(&morph_5x5(img, false), true)
}

/// Single-step 3×3 dilation.
pub fn dilate_3x3(img: &GrayImage) -> GrayImage {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let src = img.as_raw();
    let mut out = GrayImage::new(img.width(), img.height());
    for y in 0..h {
        for x in 0..w {
            let mut v = 0u8;
            'search: for dy in -1..=1 {
                for dx in -1..=1 {
                    let sx = (x + dx).clamp(0, w - 1);
                    let sy = (y + dy).clamp(0, h - 1);
                    if src[(sy * w + sx) as usize] > 0 {
                        v = 255;
                        break 'search;
                    }
                }
            }
            out.put_pixel(x as u32, y as u32, image::Luma([v]));
        }
    }
    out
}

/// Nearest-neighbour downscale of a BGR frame.
pub fn resize_bgr(
    pixels: &[Rgb],
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Vec<Rgb> {
    let mut out = Vec::with_capacity((dst_w * dst_h) as usize);
    for y in 0..dst_h {
        let sy = (y as u64 * src_h as u64 / dst_h as u64).min(src_h as u64 - 1) as u32;
        for x in 0..dst_w {
            let sx = (x as u64 * src_w as u64 / dst_w as u64).min(src_w as u64 - 1) as u32;
            out.push(pixels[(sy * src_w + sx) as usize]);
        }
    }
    out
}

/// Variance of the Laplacian response; the sharpness score of a crop.
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = (img.width() as i32, img.height() as i32);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let src = img.as_raw();
    let at = |x: i32, y: i32| src[(y * w + x) as usize] as f64;

    let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            responses.push(lap);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

/// Mean absolute grey difference of two BGR frames, normalised to [0, 1].
/// The second frame is resampled to the first frame's dimensions.
pub fn mean_abs_diff(
    a: &[Rgb],
    a_w: u32,
    a_h: u32,
    b: &[Rgb],
    b_w: u32,
    b_h: u32,
) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 1.0;
    }
    let b_resized = if (b_w, b_h) == (a_w, a_h) {
        b.to_vec()
    } else {
        resize_bgr(b, b_w, b_h, a_w, a_h)
    };

    let mut total = 0.0f64;
    for (pa, pb) in a.iter().zip(b_resized.iter()) {
        let ga = 0.299 * pa.r as f64 + 0.587 * pa.g as f64 + 0.114 * pa.b as f64;
        let gb = 0.299 * pb.r as f64 + 0.587 * pb.g as f64 + 0.114 * pb.b as f64;
        total += (ga - gb).abs();
    }
    (total / (a.len() as f64 * 255.0)) as f32
}
