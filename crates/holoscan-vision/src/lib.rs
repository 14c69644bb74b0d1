//! 2-D vision for `holoscan`: the coded-marker detector used by extrinsic
//! calibration and the depth-assisted document proposal.
//!
//! The raster, contour and edge modules provide the small set of image
//! primitives both detectors are built from, operating on
//! [`image::GrayImage`] buffers and the shared BGR colour layout.

/// Contour extraction and polygon geometry.
pub mod contour;
/// Background-depth learning and quadrilateral document proposal.
pub mod document;
/// Gradient-based edge detection.
pub mod edge;
/// Homography estimation and perspective warping.
pub mod homography;
/// Coded fiducial marker detection.
pub mod marker;
/// Grayscale raster primitives.
pub mod raster;

pub use document::{DocumentCandidate, DocumentDetector};
pub use marker::{MarkerDetector, MarkerInfo};
