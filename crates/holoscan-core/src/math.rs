//! Mathematical type definitions and rigid-transform helpers.
//!
//! Cloud data is single precision throughout; algorithms that accumulate
//! cross-covariances (Procrustes, ICP) promote to `f64` internally.

use nalgebra::{Matrix3, Vector3};

/// Scalar type used for point-cloud data (currently `f32`).
pub type Real = f32;

/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;

/// 3D vector used for double-precision accumulation.
pub type Vec3d = Vector3<f64>;
/// 3×3 matrix used for double-precision accumulation.
pub type Mat3d = Matrix3<f64>;

/// Rotate a point: `R · p`.
#[inline]
pub fn rotate_point(p: &Vec3, r: &Mat3) -> Vec3 {
    r * p
}

/// Apply the inverse rotation: `Rᵀ · p` (for rotation matrices the
/// inverse is the transpose).
#[inline]
pub fn inverse_rotate_point(p: &Vec3, r: &Mat3) -> Vec3 {
    r.transpose() * p
}

/// A rigid transform stored as a rotation and a translation.
///
/// The calibration convention applies translation before rotation:
/// `v' = R · (v + T)`. Both the per-camera world transform and the ICP
/// corrections produced by the refinement loop use this convention, so
/// they compose with [`AffineTransform::compose_correction`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub r: Mat3,
    pub t: Vec3,
}

impl AffineTransform {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            r: Mat3::identity(),
            t: Vec3::zeros(),
        }
    }

    pub fn new(r: Mat3, t: Vec3) -> Self {
        Self { r, t }
    }

    /// Apply the transform: `R · (v + T)`.
    #[inline]
    pub fn apply(&self, v: &Vec3) -> Vec3 {
        self.r * (v + self.t)
    }

    /// Compose a world-space correction into this transform.
    ///
    /// With `self` mapping camera to world and `corr` a correction applied
    /// in world space (both in the `R·(v + T)` convention), the combined
    /// map `corr ∘ self` is
    ///
    /// `R' = R_corr · R`, `T' = T + Rᵀ · T_corr`.
    pub fn compose_correction(&self, corr: &AffineTransform) -> Self {
        Self {
            r: corr.r * self.r,
            t: self.t + self.r.transpose() * corr.t,
        }
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_is_noop() {
        let t = AffineTransform::identity();
        let p = Vec3::new(0.1, -0.2, 0.3);
        assert_relative_eq!(t.apply(&p), p);
    }

    #[test]
    fn translation_applies_before_rotation() {
        // 90 deg about Z: x -> y.
        let r = Mat3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let t = AffineTransform::new(r, Vec3::new(1.0, 0.0, 0.0));
        let out = t.apply(&Vec3::zeros());
        assert_relative_eq!(out, Vec3::new(0.0, 1.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn correction_composition_matches_sequential_application() {
        let base = AffineTransform::new(
            Mat3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            Vec3::new(0.2, -0.1, 0.05),
        );
        let corr = AffineTransform::new(
            Mat3::new(1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0),
            Vec3::new(-0.03, 0.07, 0.01),
        );

        let combined = base.compose_correction(&corr);
        let p = Vec3::new(0.4, 0.2, -0.3);
        assert_relative_eq!(
            combined.apply(&p),
            corr.apply(&base.apply(&p)),
            epsilon = 1e-5
        );
    }

    #[test]
    fn inverse_rotate_undoes_rotate() {
        let r = Mat3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let p = Vec3::new(0.3, 0.1, -0.2);
        let back = inverse_rotate_point(&rotate_point(&p, &r), &r);
        assert_relative_eq!(back, p, epsilon = 1e-6);
    }
}
