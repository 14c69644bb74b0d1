//! Per-camera capture: the pluggable camera source boundary, the
//! depth→colour alignment step, the frame processing pipeline and its
//! side channels (recording, calibration, document detection).

/// Depth back-projection and colour alignment.
pub mod align;
/// Frame recording files and PLY import/export.
pub mod codec;
/// Asynchronous document detection worker and publish gating.
pub mod document_worker;
/// The per-camera capture pipeline.
pub mod pipeline;
/// The capture source abstraction (camera SDK boundary).
pub mod source;
/// Deterministic in-memory capture source for tests and demos.
pub mod synthetic;

pub use pipeline::{CapturePipeline, PipelineConfig, PipelineEvents};
pub use source::{CameraFrame, CaptureSource, SyncRole};
pub use synthetic::SyntheticSource;
