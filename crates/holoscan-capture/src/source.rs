//! The camera SDK boundary.
//!
//! A [`CaptureSource`] yields timestamped, registered colour+depth frames
//! together with per-sensor intrinsics and the depth→colour extrinsic.
//! The vendor SDK implementation lives outside this workspace; tests and
//! the CLI use [`crate::SyntheticSource`].

use std::time::Duration;

use anyhow::Result;
use holoscan_core::Rgb;

/// Hardware-sync role of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Subordinate,
    Master,
    Standalone,
}

/// Vendor-specified per-subordinate trigger delay unit, microseconds.
pub const SYNC_DELAY_US: i64 = 160;

/// Pinhole intrinsics of one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

/// Depth→colour extrinsic from the camera SDK: row-major rotation and a
/// translation in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthToColorExtrinsics {
    pub rotation: [f32; 9],
    pub translation_mm: [f32; 3],
}

impl DepthToColorExtrinsics {
    pub fn identity() -> Self {
        Self {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation_mm: [0.0; 3],
        }
    }
}

/// Format codes reported with each frame. Anything else is forwarded with
/// a warning.
pub const FORMAT_RGB888: u32 = 1;
pub const FORMAT_Y16: u32 = 2;

/// One captured frameset.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub color: Vec<Rgb>,
    pub color_width: u32,
    pub color_height: u32,
    pub color_format: u32,
    pub color_timestamp_us: u64,

    /// Depth in millimetres, zero meaning no measurement.
    pub depth: Vec<u16>,
    pub depth_width: u32,
    pub depth_height: u32,
    pub depth_format: u32,
    pub depth_timestamp_us: u64,

    pub depth_intrinsics: SensorIntrinsics,
    pub color_intrinsics: SensorIntrinsics,
    pub extrinsics: DepthToColorExtrinsics,
}

/// A pluggable capture device.
///
/// `acquire_frame` returns `Ok(None)` on a timeout or a dropped frame;
/// hard failures (device gone, open failed) are errors.
pub trait CaptureSource: Send {
    /// Open (or re-open) the device in the given sync role.
    fn open(&mut self, role: SyncRole, sync_offset_units: i32) -> Result<()>;

    /// Stop streaming and release the device.
    fn close(&mut self) -> Result<()>;

    /// Serial number of the opened device; empty when unknown.
    fn serial_number(&self) -> String;

    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<CameraFrame>>;

    /// Toggle auto exposure or set the manual exposure index (1..300).
    fn set_exposure(&mut self, auto: bool, step: i32) -> Result<()>;
}
