//! Camera settings and marker pose configuration.

use serde::{Deserialize, Serialize};

use crate::math::{AffineTransform, Mat3, Vec3};

/// World pose assigned to a physical calibration marker id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerPose {
    pub id: i32,
    /// 3×3 rotation, row-major.
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl MarkerPose {
    /// A marker at the world origin with identity orientation.
    pub fn at_origin(id: i32) -> Self {
        Self {
            id,
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0, 0.0, 0.0],
        }
    }

    pub fn transform(&self) -> AffineTransform {
        let r = Mat3::from_row_slice(&[
            self.rotation[0][0],
            self.rotation[0][1],
            self.rotation[0][2],
            self.rotation[1][0],
            self.rotation[1][1],
            self.rotation[1][2],
            self.rotation[2][0],
            self.rotation[2][1],
            self.rotation[2][2],
        ]);
        let t = Vec3::new(
            self.translation[0],
            self.translation[1],
            self.translation[2],
        );
        AffineTransform::new(r, t)
    }
}

/// Settings broadcast by the coordinator to every capture pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    /// World-space clip box, metres.
    pub min_bounds: [f32; 3],
    pub max_bounds: [f32; 3],

    /// Enable the KNN outlier filter.
    pub filter: bool,
    /// k for the outlier filter.
    pub filter_neighbours: i32,
    /// Maximum allowed k-th neighbour distance, metres.
    pub filter_threshold: f32,

    /// Recognised markers and their world poses.
    pub marker_poses: Vec<MarkerPose>,

    pub auto_exposure: bool,
    /// Manual exposure index, 1..300, used when auto exposure is off.
    pub exposure_step: i32,

    /// Inner ICP iterations of the refinement loop.
    pub icp_iterations: i32,
    /// Outer passes of the refinement loop.
    pub refine_iterations: i32,

    /// Save all cameras into one file instead of per-camera files.
    pub merge_scans: bool,
    /// Export PLY as little-endian binary instead of ASCII.
    pub save_binary_ply: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            min_bounds: [-0.5, -0.5, -0.5],
            max_bounds: [0.5, 0.5, 0.5],
            filter: false,
            filter_neighbours: 10,
            filter_threshold: 0.01,
            marker_poses: Vec::new(),
            auto_exposure: true,
            exposure_step: 150,
            icp_iterations: 10,
            refine_iterations: 2,
            merge_scans: false,
            save_binary_ply: false,
        }
    }
}

impl CameraSettings {
    /// True when the point lies inside the configured clip box.
    pub fn in_bounds(&self, x: f32, y: f32, z: f32) -> bool {
        x >= self.min_bounds[0]
            && x <= self.max_bounds[0]
            && y >= self.min_bounds[1]
            && y <= self.max_bounds[1]
            && z >= self.min_bounds[2]
            && z <= self.max_bounds[2]
    }

    /// The configured pose of a marker id, if recognised.
    pub fn marker_pose(&self, id: i32) -> Option<&MarkerPose> {
        self.marker_poses.iter().find(|m| m.id == id)
    }
}
