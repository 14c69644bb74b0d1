//! Byte quantisation for the point-cloud wire format.
//!
//! Each transmitted frame carries a per-frame scale `S` chosen from the
//! point count; positions inside the capture volume are encoded as one
//! byte per axis relative to the volume centre. The decoder inverts with
//! `float(b) = b / S − half_range + centre`.

use std::collections::HashSet;

use crate::cloud::{Point3f, Rgb};
use crate::volume::CaptureVolume;

/// Lower clamp of the dynamic scale.
pub const MIN_SCALE: f32 = 400.0;

/// Per-frame quantisation scale from the fused point count:
/// `S = clamp(round(6700 − 500·ln N), 400, min(255/minPrecision, i16::MAX))`.
///
/// The upper clamp includes `i16::MAX` because the field travels as two
/// bytes on the wire.
pub fn dynamic_scale(point_count: usize, volume: &CaptureVolume) -> i16 {
    let n = point_count.max(1) as f32;
    let raw = (6700.0 - 500.0 * n.ln()).round();
    let max = volume.max_scale().min(i16::MAX as f32);
    raw.clamp(MIN_SCALE, max) as i16
}

/// Per-axis byte encoder/decoder for a fixed scale and volume.
#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    scale: f32,
    half_range: f32,
    center: [f32; 3],
}

impl Quantizer {
    pub fn new(scale: i16, volume: &CaptureVolume) -> Self {
        Self {
            scale: scale as f32,
            half_range: volume.half_range,
            center: [volume.center.x, volume.center.y, volume.center.z],
        }
    }

    /// Encode a point in metres. Returns `None` when any axis lies outside
    /// `±half_range` around its axis centre.
    pub fn encode(&self, p: &Point3f) -> Option<[u8; 3]> {
        let axes = [p.x, p.y, p.z];
        let mut out = [0u8; 3];
        for (i, v) in axes.iter().enumerate() {
            let c = self.center[i];
            if (v - c).abs() > self.half_range {
                return None;
            }
            let q = ((v + self.half_range - c) * self.scale).round();
            out[i] = q.clamp(0.0, 255.0) as u8;
        }
        Some(out)
    }

    /// Decode one axis sample back to metres.
    #[inline]
    pub fn decode_axis(&self, b: u8, axis: usize) -> f32 {
        b as f32 / self.scale - self.half_range + self.center[axis]
    }

    /// Decode a full position sample.
    pub fn decode(&self, b: [u8; 3]) -> Point3f {
        Point3f::new(
            self.decode_axis(b[0], 0),
            self.decode_axis(b[1], 1),
            self.decode_axis(b[2], 2),
        )
    }
}

/// Quantise a fused cloud for transmission.
///
/// Points outside the volume are discarded; points that quantise to the
/// same `(bx, by, bz)` cell are dropped after the first, which keeps its
/// colour. Returns parallel position and colour byte buffers (positions in
/// BXYZ order, colours in stored BGR order).
pub fn encode_cloud(
    vertices: &[Point3f],
    colors: &[Rgb],
    quantizer: &Quantizer,
) -> (Vec<u8>, Vec<u8>) {
    let count = vertices.len().min(colors.len());
    let mut seen: HashSet<[u8; 3]> = HashSet::with_capacity(count);
    let mut positions = Vec::with_capacity(count * 3);
    let mut out_colors = Vec::with_capacity(count * 3);

    for i in 0..count {
        let Some(cell) = quantizer.encode(&vertices[i]) else {
            continue;
        };
        if !seen.insert(cell) {
            continue;
        }
        positions.extend_from_slice(&cell);
        out_colors.extend_from_slice(&colors[i].to_bytes());
    }

    (positions, out_colors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scale_formula_matches_reference_value() {
        // N = 100: round(6700 - 500·ln 100) = 4397, inside both clamps.
        let volume = CaptureVolume::default();
        assert_eq!(dynamic_scale(100, &volume), 4397);
    }

    #[test]
    fn scale_is_clamped() {
        let volume = CaptureVolume::default();
        // Huge clouds floor at 400.
        assert_eq!(dynamic_scale(10_000_000, &volume), 400);
        // A single point leaves the formula unclamped for the default
        // volume.
        assert_eq!(dynamic_scale(1, &volume), 6700);
        // A coarse volume caps the scale at its own maximum.
        let coarse = CaptureVolume::new(30.0);
        let max = coarse.max_scale().min(i16::MAX as f32) as i16;
        assert_eq!(dynamic_scale(1, &coarse), max);
    }

    #[test]
    fn volume_centre_encodes_mid_range() {
        let volume = CaptureVolume::default();
        let s = dynamic_scale(100, &volume);
        let q = Quantizer::new(s, &volume);
        let enc = q.encode(&Point3f::new(0.0, 0.0, 0.15)).unwrap();
        let expected = (0.15 * s as f32).round().clamp(0.0, 255.0) as u8;
        assert_eq!(enc, [expected; 3]);
    }

    #[test]
    fn round_trip_error_is_within_one_step() {
        // At the minimum scale one byte step spans the whole volume, so
        // every in-volume point is representable.
        let volume = CaptureVolume::default();
        let s = 400;
        let q = Quantizer::new(s, &volume);
        let step = 1.0 / s as f32;

        for &(x, y, z) in &[
            (0.0, 0.0, 0.15),
            (0.01, -0.02, 0.2),
            (-0.1, 0.1, 0.05),
            (0.02, 0.0, 0.28),
        ] {
            let p = Point3f::new(x, y, z);
            let dec = q.decode(q.encode(&p).unwrap());
            assert_relative_eq!(dec.x, p.x, epsilon = step);
            assert_relative_eq!(dec.y, p.y, epsilon = step);
            assert_relative_eq!(dec.z, p.z, epsilon = step);
        }
    }

    #[test]
    fn high_scales_resolve_the_near_corner_finely() {
        // A large scale zooms the byte range into the low corner of each
        // axis; points there round-trip within one step.
        let volume = CaptureVolume::default();
        let s = 4397;
        let q = Quantizer::new(s, &volume);
        let step = 1.0 / s as f32;

        for &(x, y, z) in &[(-0.12, -0.13, 0.01), (-0.1, -0.145, 0.05), (-0.14, -0.1, 0.02)]
        {
            let p = Point3f::new(x, y, z);
            let dec = q.decode(q.encode(&p).unwrap());
            assert_relative_eq!(dec.x, p.x, epsilon = step);
            assert_relative_eq!(dec.y, p.y, epsilon = step);
            assert_relative_eq!(dec.z, p.z, epsilon = step);
        }
    }

    #[test]
    fn out_of_volume_points_are_discarded() {
        let volume = CaptureVolume::default();
        let q = Quantizer::new(4397, &volume);
        assert!(q.encode(&Point3f::new(0.2, 0.0, 0.15)).is_none());
        assert!(q.encode(&Point3f::new(0.0, 0.0, 0.31)).is_none());
        assert!(q.encode(&Point3f::new(0.0, 0.0, -0.01)).is_none());
    }

    #[test]
    fn duplicate_cells_keep_first_colour() {
        let volume = CaptureVolume::default();
        let q = Quantizer::new(400, &volume);
        let vertices = vec![
            Point3f::new(0.0, 0.0, 0.15),
            // Quantises to the same cell as the first point.
            Point3f::new(0.0005, 0.0005, 0.1505),
            Point3f::new(0.05, 0.0, 0.15),
        ];
        let colors = vec![Rgb::new(1, 1, 1), Rgb::new(2, 2, 2), Rgb::new(3, 3, 3)];

        let (pos, col) = encode_cloud(&vertices, &colors, &q);
        assert_eq!(pos.len(), 6);
        assert_eq!(col, vec![1, 1, 1, 3, 3, 3]);
    }
}
