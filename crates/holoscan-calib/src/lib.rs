//! Extrinsic calibration for `holoscan`.
//!
//! The calibration engine turns marker detections into a world-from-camera
//! transform via Procrustes alignment; ICP refines the per-camera
//! transforms against each other once every camera is roughly calibrated.

/// Per-camera marker-based calibration.
pub mod engine;
/// Iterative closest point rigid alignment.
pub mod icp;
/// Least-squares rigid alignment of two point sets.
pub mod procrustes;

pub use engine::{CalibrationEngine, NUM_REQUIRED_SAMPLES};
pub use icp::{icp, IcpResult};
pub use procrustes::{procrustes, RigidFit};
