//! Depth-assisted document proposal.
//!
//! Learns a static depth background, masks the colour frame to what moved
//! closer than the background, then proposes convex quadrilaterals from
//! the edge map and ranks their full-resolution crops by sharpness.

use holoscan_core::Rgb;
use image::GrayImage;
use log::debug;

use crate::contour::{approx_polygon, arc_length, bounding_rect, find_contours, is_convex};
use crate::edge::canny;
use crate::raster::{
    dilate_3x3, gaussian_blur_5x5, grayscale, laplacian_variance, morph_close, morph_open,
    resize_bgr,
};

/// Depth frames averaged into the background model.
const REQUIRED_BACKGROUND_SAMPLES: usize = 5;
/// A pixel is foreground when it moved at least this much closer (mm).
const FOREGROUND_DELTA_MM: i32 = 15;
/// Polygon approximation tolerance as a fraction of the perimeter.
const APPROX_EPS_FRACTION: f64 = 0.018;
/// Minimum bounding-box area as a fraction of the frame.
const MIN_AREA_RATIO: f32 = 0.01;
/// Accepted bounding-box aspect ratio range.
const ASPECT_RANGE: (f32, f32) = (0.5, 2.0);
/// Canny thresholds for the masked frame.
const CANNY_LOW: f32 = 100.0;
const CANNY_HIGH: f32 = 200.0;

/// A ranked document crop at full colour resolution.
#[derive(Debug, Clone)]
pub struct DocumentCandidate {
    pub pixels: Vec<Rgb>,
    pub width: u32,
    pub height: u32,
    pub score: f32,
}

/// Background-learning document detector. One instance per camera.
#[derive(Debug, Default)]
pub struct DocumentDetector {
    background_samples: Vec<Vec<u16>>,
    background: Option<Vec<u16>>,
}

impl DocumentDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the depth background has been learned.
    pub fn background_ready(&self) -> bool {
        self.background.is_some()
    }

    /// Forget the background model (e.g. after the camera moved).
    pub fn reset(&mut self) {
        self.background_samples.clear();
        self.background = None;
    }

    /// Process one aligned (colour, depth) pair. Returns the best-scoring
    /// quadrilateral crop, if any. Until the background is learned every
    /// call contributes a sample and detection is skipped.
    pub fn detect(
        &mut self,
        color: &[Rgb],
        color_w: u32,
        color_h: u32,
        depth: &[u16],
        depth_w: u32,
        depth_h: u32,
    ) -> Option<DocumentCandidate> {
        if color.len() != (color_w * color_h) as usize
            || depth.len() != (depth_w * depth_h) as usize
        {
            return None;
        }

        if self.background.is_none() {
            self.background_samples.push(depth.to_vec());
            if self.background_samples.len() < REQUIRED_BACKGROUND_SAMPLES {
                return None;
            }
            self.learn_background(depth.len());
            debug!("document background learned from {REQUIRED_BACKGROUND_SAMPLES} frames");
        }

        let background = self.background.as_ref()?;
        let resized = resize_bgr(color, color_w, color_h, depth_w, depth_h);

        // Foreground where the scene moved closer than the background;
        // zero background depth means "never observed", so anything solid
        // there counts as foreground too.
        let mut mask = GrayImage::new(depth_w, depth_h);
        for (i, out) in mask.iter_mut().enumerate() {
            let bg = background[i] as i32;
            let curr = depth[i] as i32;
            let foreground = if bg > 0 {
                bg - curr > FOREGROUND_DELTA_MM
            } else {
                curr > FOREGROUND_DELTA_MM
            };
            *out = if foreground { 255 } else { 0 };
        }
        let mask = morph_close(&morph_open(&mask));

        // Mask the colour frame, then find edges.
        let mut masked = resized.clone();
        for (px, &m) in masked.iter_mut().zip(mask.as_raw().iter()) {
            if m == 0 {
                *px = Rgb::black();
            }
        }
        let gray = grayscale(&masked, depth_w, depth_h);
        let blurred = gaussian_blur_5x5(&gray);
        let edges = dilate_3x3(&canny(&blurred, CANNY_LOW, CANNY_HIGH));

        let frame_area = (depth_w * depth_h) as f32;
        let scale_x = color_w as f32 / depth_w as f32;
        let scale_y = color_h as f32 / depth_h as f32;

        let mut best: Option<DocumentCandidate> = None;

        for contour in find_contours(&edges) {
            let eps = arc_length(&contour.points) * APPROX_EPS_FRACTION;
            let poly = approx_polygon(&contour.points, eps);
            if poly.len() != 4 || !is_convex(&poly) {
                continue;
            }

            let (bx, by, bw, bh) = bounding_rect(&poly);
            let bbox_area = (bw * bh) as f32;
            let area_ratio = bbox_area / frame_area;
            if area_ratio < MIN_AREA_RATIO {
                continue;
            }
            let aspect = bw as f32 / bh as f32;
            if !(ASPECT_RANGE.0..=ASPECT_RANGE.1).contains(&aspect) {
                continue;
            }

            // Project the box back to the full-resolution colour frame.
            let ox = ((bx as f32 * scale_x).round() as i64).clamp(0, color_w as i64 - 1) as u32;
            let oy = ((by as f32 * scale_y).round() as i64).clamp(0, color_h as i64 - 1) as u32;
            let ow = ((bw as f32 * scale_x).round() as u32).min(color_w - ox).max(1);
            let oh = ((bh as f32 * scale_y).round() as u32).min(color_h - oy).max(1);

            let crop = crop_bgr(color, color_w, ox, oy, ow, oh);
            let crop_gray = grayscale(&crop, ow, oh);
            let sharpness = laplacian_variance(&crop_gray);
            let score = (0.9 * sharpness / 1000.0) as f32 + 0.1 * area_ratio;

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(DocumentCandidate {
                    pixels: crop,
                    width: ow,
                    height: oh,
                    score,
                });
            }
        }

        best
    }

    fn learn_background(&mut self, len: usize) {
        let mut sums = vec![0u32; len];
        let mut counts = vec![0u32; len];
        for sample in &self.background_samples {
            for (i, &d) in sample.iter().enumerate() {
                if d > 0 {
                    sums[i] += d as u32;
                    counts[i] += 1;
                }
            }
        }
        let background = sums
            .iter()
            .zip(counts.iter())
            .map(|(&s, &c)| if c > 0 { (s / c) as u16 } else { 0 })
            .collect();
        self.background = Some(background);
        self.background_samples.clear();
    }
}

fn crop_bgr(pixels: &[Rgb], stride: u32, x: u32, y: u32, w: u32, h: u32) -> Vec<Rgb> {
    let mut out = Vec::with_capacity((w * h) as usize);
    for row in y..y + h {
        let start = (row * stride + x) as usize;
        out.extend_from_slice(&pixels[start..start + w as usize]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DW: u32 = 64;
    const DH: u32 = 48;
    const CW: u32 = 128;
    const CH: u32 = 96;

    fn flat_depth(value: u16) -> Vec<u16> {
        vec![value; (DW * DH) as usize]
    }

    fn scene_with_document() -> (Vec<Rgb>, Vec<u16>) {
        // A raised rectangle in depth with a textured bright card in colour.
        let mut depth = flat_depth(1000);
        for y in 10..38 {
            for x in 14..50 {
                depth[(y * DW + x) as usize] = 900;
            }
        }
        let mut color = vec![Rgb::new(20, 20, 20); (CW * CH) as usize];
        for y in 20..76 {
            for x in 28..100 {
                let v = if (x / 2 + y / 2) % 2 == 0 { 230 } else { 180 };
                color[(y * CW + x) as usize] = Rgb::new(v, v, v);
            }
        }
        (color, depth)
    }

    fn learn(detector: &mut DocumentDetector) {
        let color = vec![Rgb::new(20, 20, 20); (CW * CH) as usize];
        for _ in 0..REQUIRED_BACKGROUND_SAMPLES {
            detector.detect(&color, CW, CH, &flat_depth(1000), DW, DH);
        }
    }

    #[test]
    fn no_detection_before_background_learned() {
        let mut detector = DocumentDetector::new();
        let (color, depth) = scene_with_document();
        for i in 0..REQUIRED_BACKGROUND_SAMPLES - 1 {
            assert!(
                detector.detect(&color, CW, CH, &depth, DW, DH).is_none(),
                "no result expected on sample {i}"
            );
            assert!(!detector.background_ready());
        }
    }

    #[test]
    fn detects_raised_quadrilateral() {
        let mut detector = DocumentDetector::new();
        learn(&mut detector);
        assert!(detector.background_ready());

        let (color, depth) = scene_with_document();
        let candidate = detector
            .detect(&color, CW, CH, &depth, DW, DH)
            .expect("document detected");

        assert!(candidate.score > 0.0);
        // The crop is in full colour resolution and roughly the card size.
        assert!(candidate.width >= 50 && candidate.width <= 90);
        assert!(candidate.height >= 40 && candidate.height <= 70);
        assert_eq!(
            candidate.pixels.len(),
            (candidate.width * candidate.height) as usize
        );
    }

    #[test]
    fn static_scene_yields_nothing() {
        let mut detector = DocumentDetector::new();
        learn(&mut detector);
        let color = vec![Rgb::new(20, 20, 20); (CW * CH) as usize];
        assert!(detector.detect(&color, CW, CH, &flat_depth(1000), DW, DH).is_none());
    }

    #[test]
    fn zero_depth_is_excluded_from_background() {
        let mut detector = DocumentDetector::new();
        let color = vec![Rgb::new(20, 20, 20); (CW * CH) as usize];
        // Alternate valid and invalid samples; invalid must not drag the
        // average down.
        for i in 0..REQUIRED_BACKGROUND_SAMPLES {
            let d = if i % 2 == 0 { flat_depth(1000) } else { flat_depth(0) };
            detector.detect(&color, CW, CH, &d, DW, DH);
        }
        assert!(detector.background_ready());
        let bg = detector.background.as_ref().unwrap();
        assert!(bg.iter().all(|&v| v == 1000));
    }

    #[test]
    fn reset_forgets_background() {
        let mut detector = DocumentDetector::new();
        learn(&mut detector);
        detector.reset();
        assert!(!detector.background_ready());
    }
}
