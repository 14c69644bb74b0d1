//! The bounded capture volume covered by all cameras.

use crate::math::Vec3;

/// Geometry of the capture volume and the derived quantisation limits.
///
/// The volume is a cube of side `range` whose centre sits half a range in
/// front of the world origin along Z. `min_precision` is the finest cell
/// size representable by one byte per axis over the range, and doubles as
/// the voxel de-duplication cell size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureVolume {
    pub range: f32,
    pub half_range: f32,
    pub min_precision: f32,
    pub center: Vec3,
}

impl CaptureVolume {
    pub fn new(range: f32) -> Self {
        let half_range = range / 2.0;
        Self {
            range,
            half_range,
            min_precision: range / 255.0,
            center: Vec3::new(0.0, 0.0, half_range),
        }
    }

    /// Largest usable quantisation scale for this volume.
    pub fn max_scale(&self) -> f32 {
        255.0 / self.min_precision
    }
}

impl Default for CaptureVolume {
    fn default() -> Self {
        Self::new(0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_volume_constants() {
        let v = CaptureVolume::default();
        assert_relative_eq!(v.half_range, 0.15);
        assert_relative_eq!(v.min_precision, 0.3 / 255.0);
        assert_relative_eq!(v.center.z, 0.15);
    }
}
