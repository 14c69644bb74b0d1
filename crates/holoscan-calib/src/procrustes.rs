//! Least-squares rigid alignment of two point sets.

use holoscan_core::math::{Mat3, Mat3d, Vec3, Vec3d};
use holoscan_core::Point3f;

/// Result of a Procrustes fit, in the `v' = R·(v + T)` convention: `R`
/// maps the centred target (camera) set onto the centred source (local)
/// set, and `T` is the negated target centroid.
#[derive(Debug, Clone, Copy)]
pub struct RigidFit {
    pub rotation: Mat3,
    pub translation: Vec3,
}

/// Align `target` (camera-space points) to `source` (marker-local
/// points): centre both sets, form the cross-covariance `M = Aᵀ·B` with
/// rows as points, and take `R = U·Vᵀ` from its SVD, fixing a reflection
/// through `diag(1, 1, −1)` when the determinant is negative.
///
/// Applying the result as `R·(p + T)` maps a camera point into the
/// centred local frame.
pub fn procrustes(source_local: &[Point3f], target_camera: &[Point3f]) -> RigidFit {
    debug_assert_eq!(source_local.len(), target_camera.len());
    let n = source_local.len().max(1) as f64;

    let mut centroid_local = Vec3d::zeros();
    let mut centroid_camera = Vec3d::zeros();
    for (a, b) in source_local.iter().zip(target_camera.iter()) {
        centroid_local += Vec3d::new(a.x as f64, a.y as f64, a.z as f64);
        centroid_camera += Vec3d::new(b.x as f64, b.y as f64, b.z as f64);
    }
    centroid_local /= n;
    centroid_camera /= n;

    // Cross-covariance of the centred sets.
    let mut m = Mat3d::zeros();
    for (a, b) in source_local.iter().zip(target_camera.iter()) {
        let la = Vec3d::new(a.x as f64, a.y as f64, a.z as f64) - centroid_local;
        let cb = Vec3d::new(b.x as f64, b.y as f64, b.z as f64) - centroid_camera;
        m += la * cb.transpose();
    }

    let svd = m.svd(true, true);
    let u = svd.u.expect("3x3 svd always yields U");
    let v_t = svd.v_t.expect("3x3 svd always yields Vt");

    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let flip = Mat3d::from_diagonal(&Vec3d::new(1.0, 1.0, -1.0));
        r = u * flip * v_t;
    }

    RigidFit {
        rotation: r.cast::<f32>(),
        translation: -centroid_camera.cast::<f32>(),
    }
}
