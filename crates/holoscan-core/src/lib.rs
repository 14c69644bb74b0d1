//! Core types and point-cloud primitives for `holoscan`.
//!
//! This crate contains:
//! - linear algebra type aliases and the rigid-transform conventions
//!   (`Real`, `Vec3`, `Mat3`, [`AffineTransform`]),
//! - point and colour types shared by every stage ([`Point3f`],
//!   [`Point3s`], [`Rgb`]),
//! - the capture-volume model ([`CaptureVolume`]),
//! - the voxel occupancy set and the point-cloud filters,
//! - the wire quantiser used by the streaming protocol,
//! - the camera settings model.
//!
//! Higher-level algorithms (marker detection, calibration, capture
//! pipelines, streaming) live in the `holoscan-vision`, `holoscan-calib`,
//! `holoscan-capture` and `holoscan-server` crates.

/// Point and colour types.
pub mod cloud;
/// KNN outlier filter and voxel density filter.
pub mod filter;
/// Nearest-neighbour index over a point buffer.
pub mod knn;
/// Linear algebra type aliases and rigid-transform helpers.
pub mod math;
/// Camera settings and marker pose configuration.
pub mod settings;
/// Capture-volume constants.
pub mod volume;
/// Voxel occupancy grid.
pub mod voxel;
/// Byte quantisation for the streaming wire format.
pub mod wire;

pub use cloud::{Point3f, Point3s, Rgb};
pub use filter::{remove_outliers, remove_sparse_voxels};
pub use knn::KnnIndex;
pub use math::{AffineTransform, Mat3, Real, Vec3};
pub use settings::{CameraSettings, MarkerPose};
pub use volume::CaptureVolume;
pub use voxel::VoxelSet;
pub use wire::{dynamic_scale, Quantizer};
