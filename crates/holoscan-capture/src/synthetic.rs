//! Deterministic capture source for tests and demos.
//!
//! Renders a flat wall with a raised box in depth and a colour gradient,
//! so the downstream pipeline produces a stable, non-empty cloud without
//! any camera hardware.

use std::time::Duration;

use anyhow::{bail, Result};
use holoscan_core::Rgb;

use crate::source::{
    CameraFrame, CaptureSource, DepthToColorExtrinsics, SensorIntrinsics, SyncRole, FORMAT_RGB888,
    FORMAT_Y16,
};

/// An in-memory camera producing the same scene every frame.
pub struct SyntheticSource {
    serial: String,
    depth_width: u32,
    depth_height: u32,
    color_width: u32,
    color_height: u32,
    wall_depth_mm: u16,
    open: bool,
    role: SyncRole,
    frame_counter: u64,
    /// When set, `open` fails; exercises the SDK-fatal path.
    fail_open: bool,
}

impl SyntheticSource {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            depth_width: 64,
            depth_height: 48,
            color_width: 128,
            color_height: 96,
            wall_depth_mm: 400,
            open: false,
            role: SyncRole::Standalone,
            frame_counter: 0,
            fail_open: false,
        }
    }

    /// A source with explicit sensor resolutions (pipeline tests use a
    /// denser grid so the density filter has something to keep).
    pub fn with_resolution(
        serial: &str,
        depth_width: u32,
        depth_height: u32,
        color_width: u32,
        color_height: u32,
    ) -> Self {
        Self {
            depth_width,
            depth_height,
            color_width,
            color_height,
            ..Self::new(serial)
        }
    }

    pub fn failing(serial: &str) -> Self {
        Self {
            fail_open: true,
            ..Self::new(serial)
        }
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    fn render(&self) -> CameraFrame {
        let (dw, dh) = (self.depth_width, self.depth_height);
        let mut depth = vec![self.wall_depth_mm; (dw * dh) as usize];
        // A box lifted off the wall in the middle of the frame.
        for y in dh / 4..dh * 3 / 4 {
            for x in dw / 4..dw * 3 / 4 {
                depth[(y * dw + x) as usize] = self.wall_depth_mm - 150;
            }
        }

        let (cw, ch) = (self.color_width, self.color_height);
        let mut color = Vec::with_capacity((cw * ch) as usize);
        for y in 0..ch {
            for x in 0..cw {
                color.push(Rgb::new(
                    (x * 255 / cw) as u8,
                    (y * 255 / ch) as u8,
                    128,
                ));
            }
        }

        let timestamp = self.frame_counter * 33_333;
        CameraFrame {
            color,
            color_width: cw,
            color_height: ch,
            color_format: FORMAT_RGB888,
            color_timestamp_us: timestamp,
            depth,
            depth_width: dw,
            depth_height: dh,
            depth_format: FORMAT_Y16,
            depth_timestamp_us: timestamp,
            depth_intrinsics: SensorIntrinsics {
                fx: dw as f32,
                fy: dw as f32,
                cx: dw as f32 / 2.0,
                cy: dh as f32 / 2.0,
            },
            color_intrinsics: SensorIntrinsics {
                fx: cw as f32,
                fy: cw as f32,
                cx: cw as f32 / 2.0,
                cy: ch as f32 / 2.0,
            },
            extrinsics: DepthToColorExtrinsics::identity(),
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn open(&mut self, role: SyncRole, _sync_offset_units: i32) -> Result<()> {
        if self.fail_open {
            bail!("synthetic device configured to fail");
        }
        self.open = true;
        self.role = role;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn serial_number(&self) -> String {
        self.serial.clone()
    }

    fn acquire_frame(&mut self, _timeout: Duration) -> Result<Option<CameraFrame>> {
        if !self.open {
            return Ok(None);
        }
        // A subordinate only captures once the master triggers; the
        // synthetic rig has no trigger line.
        if self.role == SyncRole::Subordinate {
            return Ok(None);
        }
        self.frame_counter += 1;
        Ok(Some(self.render()))
    }

    fn set_exposure(&mut self, _auto: bool, _step: i32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_frames_once_open() {
        let mut src = SyntheticSource::new("S1");
        assert!(src
            .acquire_frame(Duration::from_millis(10))
            .unwrap()
            .is_none());
        src.open(SyncRole::Standalone, 0).unwrap();
        let frame = src
            .acquire_frame(Duration::from_millis(10))
            .unwrap()
            .expect("frame");
        assert_eq!(frame.depth.len(), 64 * 48);
        assert_eq!(frame.color_timestamp_us, frame.depth_timestamp_us);
    }

    #[test]
    fn subordinate_waits_for_trigger() {
        let mut src = SyntheticSource::new("S2");
        src.open(SyncRole::Subordinate, 1).unwrap();
        assert!(src
            .acquire_frame(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn failing_source_reports_open_error() {
        let mut src = SyntheticSource::failing("S3");
        assert!(src.open(SyncRole::Standalone, 0).is_err());
    }
}
