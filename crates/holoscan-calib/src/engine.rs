//! Marker-based extrinsic calibration for one camera.
//!
//! Each submitted frame contributes one 5-vertex marker sample; once
//! enough samples agree the componentwise mean is aligned to the marker's
//! local pentagon and composed with the configured marker world pose.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use holoscan_core::math::{inverse_rotate_point, AffineTransform, Mat3, Vec3};
use holoscan_core::{MarkerPose, Point3f, Rgb};
use holoscan_vision::{MarkerDetector, MarkerInfo};

use crate::procrustes::procrustes;

/// Marker samples required before the calibration is finalised.
pub const NUM_REQUIRED_SAMPLES: usize = 20;

/// Per-camera calibration state and the procedure that fills it.
pub struct CalibrationEngine {
    detector: MarkerDetector,
    marker_poses: Vec<MarkerPose>,
    samples: Vec<Vec<Point3f>>,
    world: AffineTransform,
    used_marker_id: i32,
    calibrated: bool,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationEngine {
    pub fn new() -> Self {
        Self {
            detector: MarkerDetector::new(),
            marker_poses: Vec::new(),
            samples: Vec::new(),
            world: AffineTransform::identity(),
            used_marker_id: -1,
            calibrated: false,
        }
    }

    /// Replace the set of recognised markers.
    pub fn set_marker_poses(&mut self, poses: Vec<MarkerPose>) {
        self.marker_poses = poses;
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn world_transform(&self) -> AffineTransform {
        self.world
    }

    /// Overwrite the world transform (refinement path).
    pub fn set_world_transform(&mut self, transform: AffineTransform) {
        self.world = transform;
    }

    pub fn used_marker_id(&self) -> i32 {
        self.used_marker_id
    }

    /// Drop all samples and the calibration itself.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.world = AffineTransform::identity();
        self.used_marker_id = -1;
        self.calibrated = false;
    }

    /// Submit one frame: the colour image plus the camera-space point for
    /// every depth pixel (same dimensions). Returns true iff this call
    /// finalised the calibration. Frames without a recognised marker or
    /// with unusable corner depth leave earlier samples untouched.
    pub fn submit_frame(
        &mut self,
        color: &[Rgb],
        depth_points: &[Point3f],
        width: u32,
        height: u32,
    ) -> bool {
        let Some(marker) = self.detector.detect(color, width, height) else {
            return false;
        };

        let Some(pose) = self
            .marker_poses
            .iter()
            .find(|p| p.id == marker.id)
            .cloned()
        else {
            debug!("marker {} detected but not configured", marker.id);
            return false;
        };

        let Some(corners) = corner_points_3d(&marker, depth_points, width, height) else {
            debug!("marker {} corners had invalid depth", marker.id);
            return false;
        };

        self.ingest_sample(&marker, &pose, corners)
    }

    /// Record one corner sample and finalise once enough have been seen.
    fn ingest_sample(
        &mut self,
        marker: &MarkerInfo,
        pose: &MarkerPose,
        corners: Vec<Point3f>,
    ) -> bool {
        self.samples.push(corners);
        if self.samples.len() < NUM_REQUIRED_SAMPLES {
            return false;
        }

        // Componentwise mean across the collected samples.
        let n = self.samples.len() as f32;
        let vertex_count = marker.points.len();
        let mut mean = vec![Point3f::default(); vertex_count];
        for sample in &self.samples {
            for (m, p) in mean.iter_mut().zip(sample.iter()) {
                m.x += p.x / n;
                m.y += p.y / n;
                m.z += p.z / n;
            }
        }

        let fit = procrustes(&marker.points, &mean);

        // Post-multiply by the configured marker world pose.
        let pose_t = pose.transform();
        let r_world: Mat3 = pose_t.r * fit.rotation;
        let t_world: Vec3 = fit.translation + inverse_rotate_point(&pose_t.t, &r_world);

        self.world = AffineTransform::new(r_world, t_world);
        self.used_marker_id = pose.id;
        self.calibrated = true;
        self.samples.clear();

        info!(
            "calibration finalised against marker {} (t = [{:.4}, {:.4}, {:.4}])",
            pose.id, t_world.x, t_world.y, t_world.z
        );
        true
    }

    /// Load persisted calibration for a camera serial. Returns true when
    /// a file was found and parsed.
    pub fn load(&mut self, dir: &Path, serial: &str) -> bool {
        let path = calibration_file(dir, serial);
        let Ok(text) = fs::read_to_string(&path) else {
            return false;
        };

        match parse_calibration(&text) {
            Ok((world, marker_id, calibrated)) => {
                self.world = world;
                self.used_marker_id = marker_id;
                self.calibrated = calibrated;
                info!("loaded calibration from {}", path.display());
                true
            }
            Err(err) => {
                warn!("failed to parse {}: {err}", path.display());
                false
            }
        }
    }

    /// Persist the current calibration for a camera serial.
    pub fn save(&self, dir: &Path, serial: &str) -> Result<()> {
        let path = calibration_file(dir, serial);
        let mut out = String::new();
        let t = self.world.t;
        out.push_str(&format!("{} {} {}\n", t.x, t.y, t.z));
        for row in 0..3 {
            let r = self.world.r;
            out.push_str(&format!(
                "{} {} {}\n",
                r[(row, 0)],
                r[(row, 1)],
                r[(row, 2)]
            ));
        }
        out.push_str(&format!("{}\n", self.used_marker_id));
        out.push_str(&format!("{}\n", i32::from(self.calibrated)));

        fs::write(&path, out).with_context(|| format!("writing {}", path.display()))
    }
}

fn calibration_file(dir: &Path, serial: &str) -> PathBuf {
    dir.join(format!("calibration_{serial}.txt"))
}

fn parse_calibration(text: &str) -> Result<(AffineTransform, i32, bool)> {
    let mut tokens = text.split_whitespace();
    let mut next = || -> Result<f32> {
        tokens
            .next()
            .context("calibration file truncated")?
            .parse::<f32>()
            .context("bad float in calibration file")
    };

    let t = Vec3::new(next()?, next()?, next()?);
    let mut r = Mat3::zeros();
    for row in 0..3 {
        for col in 0..3 {
            r[(row, col)] = next()?;
        }
    }
    let marker_id = next()? as i32;
    let calibrated = next()? != 0.0;
    Ok((AffineTransform::new(r, t), marker_id, calibrated))
}

/// Camera-space positions of the marker corners, bilinearly interpolated
/// from the four depth-space points around each image coordinate. Fails
/// when any of the four neighbours has non-positive Z.
fn corner_points_3d(
    marker: &MarkerInfo,
    depth_points: &[Point3f],
    width: u32,
    height: u32,
) -> Option<Vec<Point3f>> {
    let mut out = Vec::with_capacity(marker.corners.len());
    for corner in &marker.corners {
        let min_x = corner[0].floor() as i64;
        let min_y = corner[1].floor() as i64;
        if min_x < 0 || min_y < 0 || min_x + 1 >= width as i64 || min_y + 1 >= height as i64 {
            return None;
        }

        let dx = corner[0] - min_x as f32;
        let dy = corner[1] - min_y as f32;
        let idx = |x: i64, y: i64| depth_points[(y * width as i64 + x) as usize];

        let p00 = idx(min_x, min_y);
        let p10 = idx(min_x + 1, min_y);
        let p01 = idx(min_x, min_y + 1);
        let p11 = idx(min_x + 1, min_y + 1);

        if p00.z <= 0.0 || p10.z <= 0.0 || p01.z <= 0.0 || p11.z <= 0.0 {
            return None;
        }

        let lerp = |a: f32, b: f32, c: f32, d: f32| {
            (1.0 - dx) * (1.0 - dy) * a + dx * (1.0 - dy) * b + (1.0 - dx) * dy * c + dx * dy * d
        };

        out.push(Point3f::new(
            lerp(p00.x, p10.x, p01.x, p11.x),
            lerp(p00.y, p10.y, p01.y, p11.y),
            lerp(p00.z, p10.z, p01.z, p11.z),
        ));
    }
    Some(out)
}
