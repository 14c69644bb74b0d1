//! Viewer side of the `holoscan` wire protocol: frame decoding and the
//! contract the renderer must meet.

/// Pull-paced stream clients and frame decoding.
pub mod client;
/// Billboard and document-quad geometry.
pub mod render;

pub use client::{decode_cloud_frame, DecodedFrame, DocumentFrame, StreamClient};
pub use render::{billboard, document_quad_size, point_size, BillboardVertex};
