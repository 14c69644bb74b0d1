//! Homography estimation and perspective warping.

use image::GrayImage;
use nalgebra::{DMatrix, Matrix3, Vector3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HomographyError {
    #[error("homography needs 4 correspondences, got {0}")]
    Underdetermined(usize),
    #[error("homography estimation did not converge")]
    NumericalFailure,
    #[error("homography is not invertible")]
    NotInvertible,
}

/// Estimate the projective map `H` with `dst ~ H · src` from point
/// correspondences.
///
/// Each pair `(p, q)` contributes the two independent rows of the
/// cross-product constraint `q × (H·p) = 0`; the stacked constraints are
/// condensed into their 9×9 normal matrix, whose weakest singular
/// direction is the homography. Five-point marker pentagons and exact
/// four-point quads both go through the same least-squares path.
pub fn dlt_homography(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    let pairs = src.len().min(dst.len());
    if pairs < 4 {
        return Err(HomographyError::Underdetermined(pairs));
    }

    let mut rows: Vec<[f64; 9]> = Vec::with_capacity(2 * pairs);
    for (p, q) in src.iter().zip(dst.iter()) {
        let [px, py] = *p;
        let [qx, qy] = *q;
        rows.push([px, py, 1.0, 0.0, 0.0, 0.0, -qx * px, -qx * py, -qx]);
        rows.push([0.0, 0.0, 0.0, px, py, 1.0, -qy * px, -qy * py, -qy]);
    }

    let constraints = DMatrix::from_fn(rows.len(), 9, |r, c| rows[r][c]);
    let normal = constraints.transpose() * &constraints;

    let svd = normal.svd(false, true);
    let basis = svd.v_t.ok_or(HomographyError::NumericalFailure)?;
    let weakest = basis.row(basis.nrows() - 1);

    let mut h = Matrix3::from_iterator(weakest.iter().copied()).transpose();
    let pivot = h[(2, 2)];
    if pivot.abs() > f64::EPSILON {
        h /= pivot;
    }
    Ok(h)
}

/// Project a 2-D point through a homography.
pub fn project(h: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    let v = h * Vector3::new(p[0], p[1], 1.0);
    [v.x / v.z, v.y / v.z]
}

/// Warp `src` through `h` (src pixel → dst pixel) into a `dst_w × dst_h`
/// patch, sampling bilinearly. Pixels mapping outside the source are
/// black.
pub fn warp_perspective(
    src: &GrayImage,
    h: &Matrix3<f64>,
    dst_w: u32,
    dst_h: u32,
) -> Result<GrayImage, HomographyError> {
    let h_inv = h.try_inverse().ok_or(HomographyError::NotInvertible)?;
    let (sw, sh) = (src.width() as i64, src.height() as i64);
    let raw = src.as_raw();

    let mut out = GrayImage::new(dst_w, dst_h);
    for y in 0..dst_h {
        for x in 0..dst_w {
            let p = project(&h_inv, [x as f64, y as f64]);
            let (sx, sy) = (p[0], p[1]);
            let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
            if x0 < 0 || y0 < 0 || x0 + 1 >= sw || y0 + 1 >= sh {
                continue;
            }
            let (fx, fy) = (sx - x0 as f64, sy - y0 as f64);
            let idx = |xx: i64, yy: i64| raw[(yy * sw + xx) as usize] as f64;
            let value = (1.0 - fx) * (1.0 - fy) * idx(x0, y0)
                + fx * (1.0 - fy) * idx(x0 + 1, y0)
                + (1.0 - fx) * fy * idx(x0, y0 + 1)
                + fx * fy * idx(x0 + 1, y0 + 1);
            out.put_pixel(x, y, image::Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    Ok(out)
}
