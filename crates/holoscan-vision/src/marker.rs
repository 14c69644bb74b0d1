//! Coded fiducial marker detection.
//!
//! Markers are planar pentagons: four square corners plus one concave
//! "tab" vertex that fixes rotational ambiguity. The interior carries a
//! 3×3 cell grid encoding a 4-bit id, its bitwise complement and a parity
//! cell.

use holoscan_core::Point3f;
use image::GrayImage;
use log::trace;

use crate::contour::{
    approx_polygon, contour_area, convex_hull_indices, find_contours, is_convex, PointI,
};
use crate::homography::{dlt_homography, warp_perspective};
use crate::raster::{grayscale, threshold, IntegralImage};

/// Number of corners of the marker shape.
pub const NUM_MARKER_CORNERS: usize = 5;

/// Threshold used to binarise the colour frame.
const BIT_THRESHOLD: u8 = 120;
/// Contour area limits for a candidate marker.
const MIN_AREA: f64 = 100.0;
const MAX_AREA: f64 = 1e9;
/// Polygon approximation tolerance: `sqrt(area) · COEFF`.
const APPROX_POLY_COEFF: f64 = 0.12;

/// Side of the canonical marker square in normalised units.
const NORM_SIZE: f64 = 2.0;
/// Border width in normalised units (not part of the code area).
const NORM_BORDER: f64 = 0.4;
/// Pixel resolution per normalised unit of the warped patch.
const RES_PER_UNIT: f64 = 50.0;
/// Cells per side of the code grid.
const BIT_GRID: usize = 3;
/// Threshold deciding whether a warped cell is set.
const CODE_THRESHOLD: u64 = 128;

/// Marker corner geometry in canonical image space. The concave tab is
/// index 0.
const CANONICAL_CORNERS: [[f64; 2]; NUM_MARKER_CORNERS] = [
    [0.0, 1.0],
    [-1.0, 1.6667],
    [-1.0, -1.0],
    [1.0, -1.0],
    [1.0, 1.6667],
];

/// The same corners in marker-local metric space (metres per unit).
const CANONICAL_POINTS_3D: [[f32; 3]; NUM_MARKER_CORNERS] = [
    [0.0, -1.0, 0.0],
    [-1.0, -1.6667, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, 1.0, 0.0],
    [1.0, -1.6667, 0.0],
];

/// A detected marker: decoded id, the ordered image corners (concave tab
/// first) and the marker-local corner positions.
#[derive(Debug, Clone)]
pub struct MarkerInfo {
    pub id: i32,
    pub corners: [[f32; 2]; NUM_MARKER_CORNERS],
    pub points: [Point3f; NUM_MARKER_CORNERS],
}

/// Detector over BGR colour frames.
#[derive(Debug, Default, Clone)]
pub struct MarkerDetector;

impl MarkerDetector {
    pub fn new() -> Self {
        Self
    }

    /// Find all markers in the frame and return the one with the largest
    /// convex-hull area.
    pub fn detect(
        &self,
        pixels: &[holoscan_core::Rgb],
        width: u32,
        height: u32,
    ) -> Option<MarkerInfo> {
        let gray = grayscale(pixels, width, height);
        let binary = threshold(&gray, BIT_THRESHOLD);
        self.detect_in_binary(&binary)
    }

    /// Detection over an already-binarised frame.
    pub fn detect_in_binary(&self, binary: &GrayImage) -> Option<MarkerInfo> {
        let mut best: Option<(f64, MarkerInfo)> = None;

        for contour in find_contours(binary) {
            let area = contour_area(&contour.points);
            if !(MIN_AREA..=MAX_AREA).contains(&area) {
                continue;
            }

            let poly = approx_polygon(&contour.points, area.sqrt() * APPROX_POLY_COEFF);
            if poly.len() != NUM_MARKER_CORNERS || is_convex(&poly) {
                continue;
            }

            let Some(mut corners) = order_corners(&poly) else {
                continue;
            };

            let code = match read_code(binary, &corners) {
                Some(code) => code,
                None => {
                    // The trace direction may be reversed; retry once with
                    // the tail flipped, keeping the concave tab first.
                    corners[1..].reverse();
                    match read_code(binary, &corners) {
                        Some(code) => code,
                        None => continue,
                    }
                }
            };

            let hull_area = hull_area(&corners);
            trace!("marker candidate id {code}, hull area {hull_area:.1}");
            if best.as_ref().map_or(true, |(a, _)| hull_area > *a) {
                best = Some((hull_area, make_info(code, &corners)));
            }
        }

        best.map(|(_, info)| info)
    }
}

/// Rotate the polygon so the single concave corner (the vertex absent
/// from the convex hull) is index 0. Rejects shapes whose hull does not
/// have exactly one fewer point.
fn order_corners(poly: &[PointI]) -> Option<Vec<PointI>> {
    let hull = convex_hull_indices(poly);
    if hull.len() != poly.len() - 1 {
        return None;
    }

    let concave = (0..poly.len()).find(|i| !hull.contains(i))?;
    Some(
        (0..poly.len())
            .map(|i| poly[(concave + i) % poly.len()])
            .collect(),
    )
}

/// Warp the marker interior to the canonical patch and decode the cell
/// grid: four data bits, their bitwise complement, one parity cell
/// (even number of set data bits → parity cell clear).
fn read_code(binary: &GrayImage, corners: &[PointI]) -> Option<i32> {
    let src: Vec<[f64; 2]> = corners.iter().map(|p| [p.0 as f64, p.1 as f64]).collect();
    let dst: Vec<[f64; 2]> = CANONICAL_CORNERS
        .iter()
        .map(|p| {
            [
                (p[0] - NORM_BORDER + 1.0) * RES_PER_UNIT,
                (p[1] - NORM_BORDER + 1.0) * RES_PER_UNIT,
            ]
        })
        .collect();

    let h = dlt_homography(&src, &dst).ok()?;

    let interior = NORM_SIZE - 2.0 * NORM_BORDER;
    let patch_side = (RES_PER_UNIT * interior) as u32;
    let patch = warp_perspective(binary, &h, patch_side, patch_side).ok()?;

    let integral = IntegralImage::new(&patch);
    let cell = patch_side as usize / BIT_GRID;
    let cell_area = (cell * cell) as u64;

    let mut vals = [false; BIT_GRID * BIT_GRID];
    for row in 0..BIT_GRID {
        for col in 0..BIT_GRID {
            let sum = integral.rect_sum(col * cell, row * cell, (col + 1) * cell, (row + 1) * cell);
            vals[row * BIT_GRID + col] = sum / cell_area >= CODE_THRESHOLD;
        }
    }

    let mut code = 0i32;
    let mut ones = 0;
    for i in 0..4 {
        // The second row of cells must be the exact inverse of the first.
        if vals[i] == vals[i + 4] {
            return None;
        }
        if vals[i] {
            code |= 1 << (3 - i);
            ones += 1;
        }
    }

    let expected_parity = ones % 2 == 1;
    if vals[8] != expected_parity {
        return None;
    }

    Some(code)
}

fn hull_area(corners: &[PointI]) -> f64 {
    let hull = convex_hull_indices(corners);
    let hull_points: Vec<PointI> = hull.iter().map(|&i| corners[i]).collect();
    contour_area(&hull_points)
}

fn make_info(code: i32, corners: &[PointI]) -> MarkerInfo {
    let mut image_corners = [[0.0f32; 2]; NUM_MARKER_CORNERS];
    for (dst, src) in image_corners.iter_mut().zip(corners.iter()) {
        *dst = [src.0 as f32, src.1 as f32];
    }
    let mut points = [Point3f::default(); NUM_MARKER_CORNERS];
    for (dst, src) in points.iter_mut().zip(CANONICAL_POINTS_3D.iter()) {
        *dst = Point3f::new(src[0], src[1], src[2]);
    }
    MarkerInfo {
        id: code,
        corners: image_corners,
        points,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Rasterise a marker with the given id into a white image.
    ///
    /// The pentagon is drawn black with its code cells painted per the
    /// encoding; `scale` is pixels per canonical unit and `(cx, cy)` the
    /// pixel position of the canonical origin.
    pub fn render_marker(id: i32, width: u32, height: u32, scale: f64, cx: f64, cy: f64) -> GrayImage {
        assert!((0..16).contains(&id));

        let corners: Vec<[f64; 2]> = CANONICAL_CORNERS
            .iter()
            .map(|p| [cx + p[0] * scale, cy + p[1] * scale])
            .collect();

        let mut img = GrayImage::from_pixel(width, height, image::Luma([255]));

        // Even-odd fill of the pentagon.
        for y in 0..height {
            for x in 0..width {
                if point_in_polygon(x as f64 + 0.5, y as f64 + 0.5, &corners) {
                    img.put_pixel(x, y, image::Luma([0]));
                }
            }
        }

        // Paint the code cells. Data bits, complement row, parity cell.
        let mut cells = [false; 9];
        let mut ones = 0;
        for i in 0..4 {
            let set = (id >> (3 - i)) & 1 == 1;
            cells[i] = set;
            cells[i + 4] = !set;
            if set {
                ones += 1;
            }
        }
        cells[8] = ones % 2 == 1;

        let code_half = (NORM_SIZE - 2.0 * NORM_BORDER) / 2.0; // 0.6
        let cell_side = 2.0 * code_half / BIT_GRID as f64; // 0.4
        for row in 0..BIT_GRID {
            for col in 0..BIT_GRID {
                if !cells[row * BIT_GRID + col] {
                    continue;
                }
                let x0 = cx + (-code_half + col as f64 * cell_side) * scale;
                let y0 = cy + (-code_half + row as f64 * cell_side) * scale;
                let side = cell_side * scale;
                for y in y0 as u32..(y0 + side) as u32 {
                    for x in x0 as u32..(x0 + side) as u32 {
                        if x < width && y < height {
                            img.put_pixel(x, y, image::Luma([255]));
                        }
                    }
                }
            }
        }

        img
    }

    fn point_in_polygon(px: f64, py: f64, poly: &[[f64; 2]]) -> bool {
        let mut inside = false;
        let n = poly.len();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (poly[i][0], poly[i][1]);
            let (xj, yj) = (poly[j][0], poly[j][1]);
            if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::render_marker;
    use super::*;

    fn rotate_90(img: &GrayImage) -> GrayImage {
        let (w, h) = (img.width(), img.height());
        let mut out = GrayImage::new(h, w);
        for y in 0..h {
            for x in 0..w {
                out.put_pixel(h - 1 - y, x, *img.get_pixel(x, y));
            }
        }
        out
    }

    #[test]
    fn decodes_rendered_marker_id() {
        let detector = MarkerDetector::new();
        for id in [0, 3, 5, 10, 15] {
            let img = render_marker(id, 240, 240, 50.0, 120.0, 110.0);
            let marker = detector
                .detect_in_binary(&img)
                .unwrap_or_else(|| panic!("marker {id} not detected"));
            assert_eq!(marker.id, id, "wrong id for marker {id}");
        }
    }

    #[test]
    fn detection_is_rotation_invariant() {
        let detector = MarkerDetector::new();
        let mut img = render_marker(6, 240, 240, 50.0, 120.0, 110.0);
        for _ in 0..3 {
            img = rotate_90(&img);
            let marker = detector.detect_in_binary(&img).expect("rotated marker");
            assert_eq!(marker.id, 6);
        }
    }

    #[test]
    fn concave_corner_is_first() {
        let detector = MarkerDetector::new();
        let img = render_marker(9, 240, 240, 50.0, 120.0, 110.0);
        let marker = detector.detect_in_binary(&img).unwrap();

        // The tab vertex sits at canonical (0, 1) -> pixel (120, 160).
        let c0 = marker.corners[0];
        assert!((c0[0] - 120.0).abs() < 5.0, "tab x at {}", c0[0]);
        assert!((c0[1] - 160.0).abs() < 5.0, "tab y at {}", c0[1]);
    }

    #[test]
    fn empty_image_yields_nothing() {
        let detector = MarkerDetector::new();
        let img = GrayImage::from_pixel(64, 64, image::Luma([255]));
        assert!(detector.detect_in_binary(&img).is_none());
    }

    #[test]
    fn largest_marker_wins() {
        let detector = MarkerDetector::new();
        let mut img = render_marker(2, 400, 240, 40.0, 100.0, 100.0);
        let small = render_marker(11, 400, 240, 22.0, 300.0, 100.0);
        // Composite the smaller marker into the right half.
        for y in 0..240 {
            for x in 230..400 {
                img.put_pixel(x, y, *small.get_pixel(x, y));
            }
        }
        let marker = detector.detect_in_binary(&img).unwrap();
        assert_eq!(marker.id, 2);
    }
}
