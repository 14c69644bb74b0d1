//! Nearest-neighbour queries over a point buffer.
//!
//! Thin adaptor around a static 3-D KD-tree. Distances are
//! Euclidean-squared throughout to avoid square roots; the k-th squared
//! distance is the outlier score used by the KNN filter.

use kiddo::{KdTree, SquaredEuclidean};

use crate::cloud::Point3f;

/// A single-index, static KD-tree built over a point buffer.
pub struct KnnIndex {
    tree: KdTree<f32, 3>,
    len: usize,
}

impl KnnIndex {
    /// Build the index. O(N log N).
    pub fn build(points: &[Point3f]) -> Self {
        let mut tree: KdTree<f32, 3> = KdTree::new();
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `k` nearest neighbours of `query`, nearest first. A query point
    /// that is itself in the buffer is its own first neighbour at
    /// distance zero.
    pub fn knn(&self, query: &Point3f, k: usize) -> (Vec<usize>, Vec<f32>) {
        let found = self
            .tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k);

        let mut indices = Vec::with_capacity(found.len());
        let mut distances = Vec::with_capacity(found.len());
        for n in found {
            indices.push(n.item as usize);
            distances.push(n.distance);
        }
        (indices, distances)
    }

    /// Index and squared distance of the single nearest neighbour.
    pub fn nearest_one(&self, query: &Point3f) -> (usize, f32) {
        let n = self
            .tree
            .nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
        (n.item as usize, n.distance)
    }
}
