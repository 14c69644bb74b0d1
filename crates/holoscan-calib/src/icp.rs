//! Iterative closest point alignment of two world-space clouds.

use holoscan_core::math::{Mat3, Mat3d, Vec3, Vec3d};
use holoscan_core::{KnnIndex, Point3f};
use log::trace;

/// Pairs whose squared distance exceeds this many standard deviations are
/// rejected before the rigid fit.
const OUTLIER_STDDEV: f32 = 2.5;

/// Accumulated rigid alignment and the final mean residual, in the
/// `v' = R·(v + T)` convention shared with the calibration engine.
#[derive(Debug, Clone, Copy)]
pub struct IcpResult {
    pub rotation: Mat3,
    pub translation: Vec3,
    pub residual: f32,
}

/// Align `source` onto `target`, updating `source` in place.
///
/// Each iteration matches every source point to its nearest target point,
/// keeps only the closest source per target index, rejects outlier pairs,
/// then applies a centroid shift followed by an SVD rotation fit. The
/// residual is the mean point distance over the iteration's matched
/// pairs.
pub fn icp(target: &[Point3f], source: &mut [Point3f], max_iter: usize) -> IcpResult {
    let mut rotation = Mat3d::identity();
    let mut translation = Vec3d::zeros();
    let mut residual = 1.0f32;

    if target.is_empty() || source.is_empty() {
        return IcpResult {
            rotation: rotation.cast::<f32>(),
            translation: translation.cast::<f32>(),
            residual,
        };
    }

    for iter in 0..max_iter {
        let index = KnnIndex::build(target);

        // One-to-one pairing in the target direction: each target index
        // keeps the closest source point claiming it.
        let mut match_of_target: Vec<Option<usize>> = vec![None; target.len()];
        let mut matched_target: Vec<Vec3d> = Vec::new();
        let mut matched_source: Vec<Vec3d> = Vec::new();
        let mut distances: Vec<f32> = Vec::new();

        for p in source.iter() {
            let (target_idx, dist) = index.nearest_one(p);
            let candidate = Vec3d::new(p.x as f64, p.y as f64, p.z as f64);

            match match_of_target[target_idx] {
                Some(slot) if distances[slot] <= dist => {}
                Some(slot) => {
                    matched_source[slot] = candidate;
                    distances[slot] = dist;
                }
                None => {
                    let t = target[target_idx];
                    matched_target.push(Vec3d::new(t.x as f64, t.y as f64, t.z as f64));
                    matched_source.push(candidate);
                    distances.push(dist);
                    match_of_target[target_idx] = Some(matched_source.len() - 1);
                }
            }
        }

        if matched_source.is_empty() {
            break;
        }

        // Reject pairs far outside the distance distribution.
        let stddev = standard_deviation(&distances);
        let threshold = OUTLIER_STDDEV * stddev;
        let survivors: Vec<usize> = (0..distances.len())
            .filter(|&i| distances[i] <= threshold)
            .collect();
        let survivors = if survivors.is_empty() {
            (0..distances.len()).collect()
        } else {
            survivors
        };

        // Centroid shift over the surviving pairs.
        let mut shift = Vec3d::zeros();
        for &i in &survivors {
            shift += matched_target[i] - matched_source[i];
        }
        shift /= survivors.len() as f64;

        for p in source.iter_mut() {
            p.x += shift.x as f32;
            p.y += shift.y as f32;
            p.z += shift.z as f32;
        }
        for &i in &survivors {
            matched_source[i] += shift;
        }

        // Rotation update from the cross-covariance of the shifted pairs.
        let mut m = Mat3d::zeros();
        for &i in &survivors {
            m += matched_source[i] * matched_target[i].transpose();
        }
        let svd = m.svd(true, true);
        let u = svd.u.expect("3x3 svd always yields U");
        let v_t = svd.v_t.expect("3x3 svd always yields Vt");
        let mut delta = u * v_t;
        if delta.determinant() < 0.0 {
            let flip = Mat3d::from_diagonal(&Vec3d::new(1.0, 1.0, -1.0));
            delta = u * flip * v_t;
        }

        // The fit maximises agreement for row-vector application, so the
        // column form applies the transpose.
        let delta_t = delta.transpose();
        for p in source.iter_mut() {
            let v = delta_t * Vec3d::new(p.x as f64, p.y as f64, p.z as f64);
            p.x = v.x as f32;
            p.y = v.y as f32;
            p.z = v.z as f32;
        }

        // Accumulate, translation first (it uses the pre-update rotation).
        translation += rotation.transpose() * shift;
        rotation = delta_t * rotation;

        residual = (distances.iter().map(|d| (*d as f64).sqrt()).sum::<f64>()
            / distances.len() as f64) as f32;
        trace!("icp iteration {iter}: residual {residual:.6}");
    }

    IcpResult {
        rotation: rotation.cast::<f32>(),
        translation: translation.cast::<f32>(),
        residual,
    }
}

fn standard_deviation(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use holoscan_core::math::rotate_point;

    fn structured_cloud() -> Vec<Point3f> {
        let mut cloud = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                for k in 0..4 {
                    cloud.push(Point3f::new(
                        i as f32 * 0.05 - 0.12,
                        j as f32 * 0.03 - 0.06,
                        k as f32 * 0.07 + 0.1,
                    ));
                }
            }
        }
        cloud
    }

    fn rot_y(angle: f32) -> Mat3 {
        let (s, c) = angle.sin_cos();
        Mat3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
    }

    fn rotation_angle_deg(r: &Mat3) -> f32 {
        let trace = r[(0, 0)] + r[(1, 1)] + r[(2, 2)];
        ((trace - 1.0) / 2.0).clamp(-1.0, 1.0).acos().to_degrees()
    }

    #[test]
    fn recovers_small_rotation() {
        let target = structured_cloud();
        let angle = 5.0f32.to_radians();
        let q = rot_y(angle);
        let mut source: Vec<Point3f> = target
            .iter()
            .map(|p| Point3f::from_vec(rotate_point(&p.to_vec(), &q)))
            .collect();

        let result = icp(&target, &mut source, 20);
        assert!(result.residual < 1e-4, "residual {}", result.residual);

        // The recovered transform must undo the 5 degree rotation.
        let recovered = result.rotation * q;
        assert!(
            rotation_angle_deg(&recovered) < 0.1,
            "rotation error {} deg",
            rotation_angle_deg(&recovered)
        );

        // And the moved cloud sits on the target.
        for (s, t) in source.iter().zip(target.iter()) {
            assert_relative_eq!(s.x, t.x, epsilon = 1e-3);
            assert_relative_eq!(s.y, t.y, epsilon = 1e-3);
            assert_relative_eq!(s.z, t.z, epsilon = 1e-3);
        }
    }

    #[test]
    fn residual_decreases_with_more_iterations() {
        let target = structured_cloud();
        let q = rot_y(4.0f32.to_radians());
        let source0: Vec<Point3f> = target
            .iter()
            .map(|p| Point3f::from_vec(rotate_point(&p.to_vec(), &q)))
            .collect();

        // The residual reported by iteration k is measured before that
        // iteration's correction, so two iterations see the effect of the
        // first correction.
        let mut one = source0.clone();
        let before_any_correction = icp(&target, &mut one, 1).residual;

        let mut two = source0.clone();
        let after_one_correction = icp(&target, &mut two, 2).residual;

        assert!(after_one_correction <= before_any_correction + 1e-6);
    }

    #[test]
    fn result_transform_maps_original_source_to_target() {
        let target = structured_cloud();
        let q = rot_y(3.0f32.to_radians());
        let offset = Vec3::new(0.01, -0.02, 0.015);
        let source0: Vec<Point3f> = target
            .iter()
            .map(|p| Point3f::from_vec(rotate_point(&p.to_vec(), &q) + offset))
            .collect();

        let mut source = source0.clone();
        let result = icp(&target, &mut source, 20);

        for (orig, t) in source0.iter().zip(target.iter()) {
            let mapped = result.rotation * (orig.to_vec() + result.translation);
            assert_relative_eq!(mapped.x, t.x, epsilon = 2e-3);
            assert_relative_eq!(mapped.y, t.y, epsilon = 2e-3);
            assert_relative_eq!(mapped.z, t.z, epsilon = 2e-3);
        }
    }

    #[test]
    fn empty_inputs_are_identity() {
        let mut source: Vec<Point3f> = Vec::new();
        let result = icp(&[], &mut source, 5);
        assert_relative_eq!(result.rotation, Mat3::identity());
        assert_relative_eq!(result.translation, Vec3::zeros());
    }
}
