//! Pull-paced stream clients.
//!
//! A client writes a single `0x00` to request a frame, then reads the
//! response off the socket. The scale field is exactly two bytes on the
//! wire; positions decode with `float(b) = b/S − half_range + centre`,
//! and the Y axis is flipped to match the receiver's world-up
//! convention. Colour bytes arrive in the server's BGR layout and are
//! surfaced as (R, G, B).

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use holoscan_core::{CaptureVolume, Quantizer};
use log::debug;

/// The pull-request byte.
const PULL_REQUEST: u8 = 0x00;

/// A decoded point-cloud frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub scale: i16,
    /// World positions, metres, receiver axis convention (Y flipped).
    pub positions: Vec<[f32; 3]>,
    /// Colours in (R, G, B) order.
    pub colors: Vec<[u8; 3]>,
}

/// A decoded document frame.
#[derive(Debug, Clone)]
pub struct DocumentFrame {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Decode one point-cloud frame payload.
pub fn decode_cloud_frame(bytes: &[u8], volume: &CaptureVolume) -> Result<DecodedFrame> {
    if bytes.len() < 6 {
        bail!("frame too short: {} bytes", bytes.len());
    }
    // The field is two bytes on the wire; read exactly two.
    let scale = i16::from_le_bytes([bytes[0], bytes[1]]);
    if scale <= 0 {
        bail!("non-positive scale {scale}");
    }
    let count = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;

    let expected = 6 + count * 3 + count * 3;
    if bytes.len() < expected {
        bail!("frame truncated: {} of {expected} bytes", bytes.len());
    }

    let quantizer = Quantizer::new(scale, volume);
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);

    let pos = &bytes[6..6 + count * 3];
    let col = &bytes[6 + count * 3..expected];
    for i in 0..count {
        let p = quantizer.decode([pos[i * 3], pos[i * 3 + 1], pos[i * 3 + 2]]);
        positions.push([p.x, -p.y, p.z]);
        // Stored BGR on the wire.
        colors.push([col[i * 3 + 2], col[i * 3 + 1], col[i * 3]]);
    }

    Ok(DecodedFrame {
        scale,
        positions,
        colors,
    })
}

/// A connected pull-paced client for either stream channel.
pub struct StreamClient {
    stream: TcpStream,
    volume: CaptureVolume,
}

impl StreamClient {
    pub fn connect<A: ToSocketAddrs>(addr: A, volume: CaptureVolume) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("connecting to stream server")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("setting read timeout")?;
        Ok(Self { stream, volume })
    }

    /// Request and decode the next point-cloud frame.
    pub fn request_cloud_frame(&mut self) -> Result<DecodedFrame> {
        self.stream.write_all(&[PULL_REQUEST])?;

        let mut header = [0u8; 6];
        self.stream.read_exact(&mut header)?;
        let count = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;

        let mut body = vec![0u8; count * 6];
        self.stream.read_exact(&mut body)?;

        let mut frame = header.to_vec();
        frame.extend_from_slice(&body);
        debug!("received cloud frame with {count} points");
        decode_cloud_frame(&frame, &self.volume)
    }

    /// Request the next document frame, if the server has a new one.
    pub fn request_document_frame(&mut self) -> Result<DocumentFrame> {
        self.stream.write_all(&[PULL_REQUEST])?;

        let mut header = [0u8; 12];
        self.stream.read_exact(&mut header)?;
        let width = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let height = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        let size = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;

        let mut jpeg = vec![0u8; size];
        self.stream.read_exact(&mut jpeg)?;
        Ok(DocumentFrame {
            width,
            height,
            jpeg,
        })
    }
}
