//! Point-cloud filters: KNN outlier removal and voxel density pruning.

use std::collections::HashMap;

use log::debug;

use crate::cloud::{Point3f, Rgb};
use crate::knn::KnnIndex;

/// Remove points whose k-th nearest neighbour lies further than
/// `max_distance` metres.
///
/// `vertices` and `colors` are parallel and stay in lock-step. No-op if
/// `k <= 0` or `max_distance <= 0`.
pub fn remove_outliers(
    vertices: &mut Vec<Point3f>,
    colors: &mut Vec<Rgb>,
    k: i32,
    max_distance: f32,
) {
    if k <= 0 || max_distance <= 0.0 || vertices.is_empty() {
        return;
    }

    let k = k as usize;
    let index = KnnIndex::build(vertices);
    let threshold_sq = max_distance * max_distance;

    // The query point is its own nearest neighbour, so ask for k
    // neighbours and score on the last one, as the capture client always
    // has.
    let keep: Vec<bool> = vertices
        .iter()
        .map(|p| {
            let (_, dists) = index.knn(p, k);
            match dists.last() {
                Some(&d) => d <= threshold_sq,
                None => false,
            }
        })
        .collect();

    compact(vertices, colors, &keep);
}

/// Drop points that land in sparsely-populated voxels.
///
/// Buckets every point into a grid of side `voxel_size` and removes those
/// whose bucket holds fewer than `min_points` members.
pub fn remove_sparse_voxels(
    vertices: &mut Vec<Point3f>,
    colors: &mut Vec<Rgb>,
    voxel_size: f32,
    min_points: usize,
) {
    if voxel_size <= 0.0 || min_points <= 1 || vertices.is_empty() {
        return;
    }

    let key = |p: &Point3f| -> (i32, i32, i32) {
        (
            (p.x / voxel_size).floor() as i32,
            (p.y / voxel_size).floor() as i32,
            (p.z / voxel_size).floor() as i32,
        )
    };

    let mut counts: HashMap<(i32, i32, i32), usize> = HashMap::new();
    for p in vertices.iter() {
        *counts.entry(key(p)).or_insert(0) += 1;
    }

    let keep: Vec<bool> = vertices
        .iter()
        .map(|p| counts[&key(p)] >= min_points)
        .collect();

    let before = vertices.len();
    compact(vertices, colors, &keep);
    if vertices.len() != before {
        debug!(
            "density filter dropped {} of {} points",
            before - vertices.len(),
            before
        );
    }
}

/// In-place compaction of both parallel vectors.
fn compact(vertices: &mut Vec<Point3f>, colors: &mut Vec<Rgb>, keep: &[bool]) {
    let mut write = 0;
    for i in 0..vertices.len() {
        if keep[i] {
            vertices[write] = vertices[i];
            colors[write] = colors[i];
            write += 1;
        }
    }
    vertices.truncate(write);
    colors.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outlier() -> (Vec<Point3f>, Vec<Rgb>) {
        let mut vertices = Vec::new();
        for i in 0..20 {
            for j in 0..20 {
                vertices.push(Point3f::new(i as f32 * 0.001, j as f32 * 0.001, 0.1));
            }
        }
        // Far outside the cluster.
        vertices.push(Point3f::new(1.0, 1.0, 1.0));
        let colors = vec![Rgb::new(10, 20, 30); vertices.len()];
        (vertices, colors)
    }

    #[test]
    fn outlier_filter_removes_isolated_point() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        let before = vertices.len();
        remove_outliers(&mut vertices, &mut colors, 4, 0.01);
        assert_eq!(vertices.len(), before - 1);
        assert_eq!(vertices.len(), colors.len());
        assert!(vertices.iter().all(|p| p.x < 0.5));
    }

    #[test]
    fn outlier_filter_is_noop_for_bad_parameters() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        let before = vertices.len();
        remove_outliers(&mut vertices, &mut colors, 0, 0.01);
        remove_outliers(&mut vertices, &mut colors, 4, 0.0);
        remove_outliers(&mut vertices, &mut colors, -3, -1.0);
        assert_eq!(vertices.len(), before);
    }

    #[test]
    fn outlier_filter_result_is_subset() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        let original = vertices.clone();
        remove_outliers(&mut vertices, &mut colors, 4, 0.01);
        assert!(vertices.iter().all(|p| original.contains(p)));
    }

    #[test]
    fn density_filter_drops_sparse_buckets() {
        // 15 points in one 6 mm voxel, a lone point in another.
        let mut vertices: Vec<Point3f> = (0..15)
            .map(|i| Point3f::new(0.001 + 0.0001 * i as f32, 0.001, 0.001))
            .collect();
        vertices.push(Point3f::new(0.1, 0.1, 0.1));
        let mut colors = vec![Rgb::black(); vertices.len()];

        remove_sparse_voxels(&mut vertices, &mut colors, 0.006, 12);
        assert_eq!(vertices.len(), 15);
        assert_eq!(colors.len(), 15);
    }

    #[test]
    fn compaction_keeps_colors_aligned() {
        let mut vertices = vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(2.0, 0.0, 0.0),
        ];
        let mut colors = vec![Rgb::new(0, 0, 0), Rgb::new(1, 1, 1), Rgb::new(2, 2, 2)];
        compact(&mut vertices, &mut colors, &[true, false, true]);
        assert_eq!(vertices.len(), 2);
        assert_eq!(colors[1], Rgb::new(2, 2, 2));
        assert_eq!(vertices[1].x, 2.0);
    }

    #[test]
    fn randomised_cloud_stays_in_lock_step() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        // A jittered cluster with each colour encoding its vertex index,
        // plus far outliers the filter is guaranteed to drop.
        let mut rng = StdRng::seed_from_u64(42);
        let mut vertices: Vec<Point3f> = (0..400)
            .map(|_| {
                Point3f::new(
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(0.09..0.11),
                )
            })
            .collect();
        for _ in 0..5 {
            vertices.push(Point3f::new(
                rng.gen_range(2.0..3.0),
                rng.gen_range(2.0..3.0),
                rng.gen_range(2.0..3.0),
            ));
        }
        let original = vertices.clone();
        let mut colors: Vec<Rgb> = (0..vertices.len())
            .map(|i| Rgb::new((i % 256) as u8, (i / 256) as u8, 7))
            .collect();

        remove_outliers(&mut vertices, &mut colors, 8, 0.05);

        assert_eq!(vertices.len(), colors.len());
        assert!(vertices.iter().all(|p| p.x < 1.0), "an outlier survived");
        // Every surviving colour still rides with the vertex it was
        // paired to.
        for (p, c) in vertices.iter().zip(colors.iter()) {
            let index = c.b as usize + 256 * c.g as usize;
            assert_eq!(*p, original[index]);
        }
    }
}
