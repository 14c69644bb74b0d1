//! Depth back-projection and colour alignment.
//!
//! For every depth pixel: back-project through the depth intrinsics,
//! transform into the colour camera with the SDK extrinsic, project into
//! the colour image, and sample the colour bilinearly. The aligned depth
//! map (depth resolution, nearest value wins on collisions) feeds the
//! document detector.

use holoscan_core::{Point3f, Rgb};

use crate::source::CameraFrame;

/// Output of the alignment step, one entry per depth pixel.
pub struct AlignedFrame {
    /// Camera-space points in metres (colour camera frame). Pixels with
    /// no depth or a projection behind the camera hold a zero vertex.
    pub vertices: Vec<Point3f>,
    /// Bilinearly sampled colours; black where no vertex exists.
    pub colors: Vec<Rgb>,
    /// The depth map re-projected onto the (depth-resolution scaled)
    /// colour image.
    pub aligned_depth: Vec<u16>,
}

pub fn back_project(frame: &CameraFrame) -> AlignedFrame {
    let dw = frame.depth_width as usize;
    let dh = frame.depth_height as usize;
    let cw = frame.color_width as usize;
    let ch = frame.color_height as usize;

    let di = frame.depth_intrinsics;
    let ci = frame.color_intrinsics;
    let rot = frame.extrinsics.rotation;
    let trans = frame.extrinsics.translation_mm;

    let mut vertices = Vec::with_capacity(dw * dh);
    let mut colors = Vec::with_capacity(dw * dh);
    let mut aligned_depth = vec![0u16; dw * dh];

    for v in 0..dh {
        for u in 0..dw {
            let d = frame.depth[v * dw + u];
            if d == 0 {
                vertices.push(Point3f::default());
                colors.push(Rgb::black());
                continue;
            }

            // Depth pixel to depth-camera space, metres.
            let z = d as f32 / 1000.0;
            let x = (u as f32 - di.cx) * z / di.fx;
            let y = (v as f32 - di.cy) * z / di.fy;

            // Into the colour camera; the SDK translation is millimetres.
            let cx3 = rot[0] * x + rot[1] * y + rot[2] * z + trans[0] / 1000.0;
            let cy3 = rot[3] * x + rot[4] * y + rot[5] * z + trans[1] / 1000.0;
            let cz3 = rot[6] * x + rot[7] * y + rot[8] * z + trans[2] / 1000.0;

            if cz3 <= 0.0 {
                vertices.push(Point3f::default());
                colors.push(Rgb::black());
                continue;
            }

            // Project into the colour image.
            let proj_u = ci.fx * cx3 / cz3 + ci.cx;
            let proj_v = ci.fy * cy3 / cz3 + ci.cy;

            // Write the nearest depth into the scaled-down aligned map.
            let au = (proj_u * dw as f32 / cw as f32).round() as i64;
            let av = (proj_v * dh as f32 / ch as f32).round() as i64;
            if au >= 0 && av >= 0 && (au as usize) < dw && (av as usize) < dh {
                let cell = &mut aligned_depth[av as usize * dw + au as usize];
                if *cell == 0 || d < *cell {
                    *cell = d;
                }
            }

            // Bilinear colour sample; black outside the colour frame.
            let u0 = proj_u.floor() as i64;
            let v0 = proj_v.floor() as i64;
            let mut sample = Rgb::black();
            if u0 >= 0 && v0 >= 0 && u0 + 1 < cw as i64 && v0 + 1 < ch as i64 {
                let fu = proj_u - u0 as f32;
                let fv = proj_v - v0 as f32;
                let at = |x: i64, y: i64| frame.color[y as usize * cw + x as usize];
                let c00 = at(u0, v0);
                let c10 = at(u0 + 1, v0);
                let c01 = at(u0, v0 + 1);
                let c11 = at(u0 + 1, v0 + 1);
                let lerp = |a: u8, b: u8, c: u8, d: u8| -> u8 {
                    ((1.0 - fu) * (1.0 - fv) * a as f32
                        + fu * (1.0 - fv) * b as f32
                        + (1.0 - fu) * fv * c as f32
                        + fu * fv * d as f32) as u8
                };
                sample = Rgb::new(
                    lerp(c00.b, c10.b, c01.b, c11.b),
                    lerp(c00.g, c10.g, c01.g, c11.g),
                    lerp(c00.r, c10.r, c01.r, c11.r),
                );
            }

            vertices.push(Point3f::new(cx3, cy3, cz3));
            colors.push(sample);
        }
    }

    AlignedFrame {
        vertices,
        colors,
        aligned_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyncRole;
    use crate::source::CaptureSource;
    use crate::synthetic::SyntheticSource;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn synthetic_frame() -> CameraFrame {
        let mut src = SyntheticSource::new("A");
        src.open(SyncRole::Standalone, 0).unwrap();
        src.acquire_frame(Duration::from_millis(10)).unwrap().unwrap()
    }

    #[test]
    fn output_length_matches_depth_resolution() {
        let frame = synthetic_frame();
        let aligned = back_project(&frame);
        let n = (frame.depth_width * frame.depth_height) as usize;
        assert_eq!(aligned.vertices.len(), n);
        assert_eq!(aligned.colors.len(), n);
        assert_eq!(aligned.aligned_depth.len(), n);
    }

    #[test]
    fn principal_point_back_projects_on_axis() {
        let frame = synthetic_frame();
        let aligned = back_project(&frame);

        let u = frame.depth_intrinsics.cx as usize;
        let v = frame.depth_intrinsics.cy as usize;
        let idx = v * frame.depth_width as usize + u;
        let p = aligned.vertices[idx];

        // With identity extrinsics the centre pixel lies on the Z axis at
        // the measured depth.
        let d = frame.depth[idx] as f32 / 1000.0;
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, d, epsilon = 1e-6);
    }

    #[test]
    fn zero_depth_yields_zero_vertex_and_black() {
        let mut frame = synthetic_frame();
        frame.depth[0] = 0;
        let aligned = back_project(&frame);
        assert_eq!(aligned.vertices[0], Point3f::default());
        assert_eq!(aligned.colors[0], Rgb::black());
    }

    #[test]
    fn aligned_depth_keeps_nearest_on_collision() {
        let frame = synthetic_frame();
        let aligned = back_project(&frame);
        // Every written cell must hold some observed depth value.
        for &d in aligned.aligned_depth.iter().filter(|&&d| d != 0) {
            assert!(frame.depth.contains(&d));
        }
    }
}
