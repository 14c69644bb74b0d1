//! Wire-format encoding for the two stream channels.
//!
//! Point-cloud frames: scale `S` (2 bytes LE), surviving count `M`
//! (4 bytes LE), `M·3` position bytes in BXYZ order, `M·3` colour bytes
//! as stored (BGR). Document frames: width, height and payload size
//! (4 bytes LE each) followed by a quality-90 JPEG of the raw crop.
//! Viewers pace the stream by writing a single `0x00` per frame.

use anyhow::{Context, Result};
use holoscan_core::wire::{dynamic_scale, encode_cloud, Quantizer};
use holoscan_core::{CaptureVolume, Point3s, Rgb};
use holoscan_vision::DocumentCandidate;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Fused point-cloud stream port.
pub const POINT_CLOUD_PORT: u16 = 48002;
/// Document stream port.
pub const DOCUMENT_PORT: u16 = 48003;
/// The pull-request byte a viewer sends per frame.
pub const PULL_REQUEST: u8 = 0x00;

/// JPEG quality for document crops.
const JPEG_QUALITY: u8 = 90;

/// Encode one fused cloud frame. The dynamic scale is chosen from the
/// fused point count before volume filtering.
pub fn encode_point_cloud_frame(
    vertices: &[Point3s],
    colors: &[Rgb],
    volume: &CaptureVolume,
) -> Vec<u8> {
    let scale = dynamic_scale(vertices.len(), volume);
    let quantizer = Quantizer::new(scale, volume);

    let metres: Vec<holoscan_core::Point3f> = vertices.iter().map(|p| p.to_metres()).collect();
    let (positions, out_colors) = encode_cloud(&metres, colors, &quantizer);
    let count = (positions.len() / 3) as u32;

    let mut frame = Vec::with_capacity(6 + positions.len() + out_colors.len());
    frame.extend_from_slice(&scale.to_le_bytes());
    frame.extend_from_slice(&count.to_le_bytes());
    frame.extend_from_slice(&positions);
    frame.extend_from_slice(&out_colors);
    frame
}

/// Encode one document frame.
pub fn encode_document_frame(document: &DocumentCandidate) -> Result<Vec<u8>> {
    // The crop is stored BGR; the JPEG encoder wants RGB.
    let mut rgb = Vec::with_capacity(document.pixels.len() * 3);
    for px in &document.pixels {
        rgb.extend_from_slice(&[px.r, px.g, px.b]);
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(&rgb, document.width, document.height, ExtendedColorType::Rgb8)
        .context("encoding document jpeg")?;

    let mut frame = Vec::with_capacity(12 + jpeg.len());
    frame.extend_from_slice(&document.width.to_le_bytes());
    frame.extend_from_slice(&document.height.to_le_bytes());
    frame.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
    frame.extend_from_slice(&jpeg);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_cloud_frame_layout() {
        let volume = CaptureVolume::default();
        // 100 distinct in-volume points.
        let vertices: Vec<Point3s> = (0..100)
            .map(|i| Point3s::new(i as i16 - 50, 0, 150))
            .collect();
        let colors = vec![Rgb::new(1, 2, 3); vertices.len()];

        let frame = encode_point_cloud_frame(&vertices, &colors, &volume);

        // N = 100 fixes the scale at 4397.
        let scale = i16::from_le_bytes([frame[0], frame[1]]);
        assert_eq!(scale, 4397);

        let count = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        assert!(count > 0 && count <= 100);
        assert_eq!(frame.len(), 6 + count * 3 + count * 3);

        // Colour block preserves the stored BGR order.
        let colors_off = 6 + count * 3;
        assert_eq!(&frame[colors_off..colors_off + 3], &[1, 2, 3]);
    }

    #[test]
    fn out_of_volume_points_are_filtered_from_the_frame() {
        let volume = CaptureVolume::default();
        let vertices = vec![
            Point3s::new(0, 0, 150),
            Point3s::new(500, 0, 150), // outside ±150 mm around centre x
        ];
        let colors = vec![Rgb::black(); 2];
        let frame = encode_point_cloud_frame(&vertices, &colors, &volume);
        let count = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
        assert_eq!(count, 1);
    }

    #[test]
    fn document_frame_carries_jpeg() {
        let document = DocumentCandidate {
            pixels: vec![Rgb::new(10, 200, 30); 64 * 32],
            width: 64,
            height: 32,
            score: 0.5,
        };
        let frame = encode_document_frame(&document).unwrap();

        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 64);
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 32);
        let size = u32::from_le_bytes(frame[8..12].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 12 + size);
        // JPEG magic.
        assert_eq!(&frame[12..14], &[0xFF, 0xD8]);
    }
}
