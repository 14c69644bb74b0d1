//! The contract the receiving renderer must meet: every point expands
//! into a camera-facing billboard quad, sized from the transmitted
//! scale; document textures map onto a planar quad sized from their
//! pixel dimensions.

/// Metres per document pixel.
pub const PIXEL_TO_METER: f32 = 0.26 / 1000.0;

/// World size of a rendered point for a given frame scale:
/// `size = 170·p² + 0.8·p + 0.002` with `p = 1/S`.
pub fn point_size(scale: i16) -> f32 {
    let precision = 1.0 / scale as f32;
    170.0 * precision * precision + 0.8 * precision + 0.002
}

/// One vertex of an expanded point billboard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillboardVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [u8; 3],
}

/// Expand a point into a 6-vertex (two-triangle) camera-facing quad.
/// `right` and `up` are the camera basis vectors, unit length.
pub fn billboard(
    center: [f32; 3],
    size: f32,
    right: [f32; 3],
    up: [f32; 3],
    color: [u8; 3],
) -> [BillboardVertex; 6] {
    let half = size / 2.0;
    let offset = |sx: f32, sy: f32| -> [f32; 3] {
        [
            center[0] + (right[0] * sx + up[0] * sy) * half,
            center[1] + (right[1] * sx + up[1] * sy) * half,
            center[2] + (right[2] * sx + up[2] * sy) * half,
        ]
    };
    let vertex = |sx: f32, sy: f32, u: f32, v: f32| BillboardVertex {
        position: offset(sx, sy),
        uv: [u, v],
        color,
    };

    let bl = vertex(-1.0, -1.0, 0.0, 0.0);
    let br = vertex(1.0, -1.0, 1.0, 0.0);
    let tl = vertex(-1.0, 1.0, 0.0, 1.0);
    let tr = vertex(1.0, 1.0, 1.0, 1.0);

    [bl, br, tl, tl, br, tr]
}

/// Size of the planar quad a document texture is mapped onto, metres.
/// Pixel dimensions scale by [`PIXEL_TO_METER`]; the larger side is then
/// clamped into `[min_size, max_size]`, preserving aspect.
pub fn document_quad_size(
    width_px: u32,
    height_px: u32,
    min_size: f32,
    max_size: f32,
) -> (f32, f32) {
    let mut w = width_px as f32 * PIXEL_TO_METER;
    let mut h = height_px as f32 * PIXEL_TO_METER;
    let larger = w.max(h);
    if larger <= 0.0 {
        return (0.0, 0.0);
    }
    let clamped = larger.clamp(min_size, max_size);
    let factor = clamped / larger;
    w *= factor;
    h *= factor;
    (w, h)
}
