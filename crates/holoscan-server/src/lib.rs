//! Coordinator and streaming side of `holoscan`: owns the per-camera
//! pipelines, fuses their clouds, refines calibration across cameras and
//! pushes frames to pull-paced viewers.

/// Multi-camera coordinator.
pub mod coordinator;
/// Wire-format encoding for both stream channels.
pub mod protocol;
/// Pull-paced TCP stream servers.
pub mod stream;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use protocol::{DOCUMENT_PORT, POINT_CLOUD_PORT};
pub use stream::{FrameSource, StreamServer};
