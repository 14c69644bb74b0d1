//! Frame recording files and PLY import/export.
//!
//! A recording is a sequence of frames, each an ASCII header followed by
//! the raw little-endian point and colour blocks:
//!
//! ```text
//! n_points= <N>\n
//! frame_timestamp= <T_us>\n
//! <N × Point3s><N × Rgb>\n
//! ```
//!
//! Readers loop: at end of file the reader reopens and starts over.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use holoscan_core::{Point3f, Point3s, Rgb};
use log::warn;

/// Writes frames to one recording file per camera per session.
pub struct FrameWriter {
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    dir: PathBuf,
    device_index: usize,
}

impl FrameWriter {
    pub fn new(dir: &Path, device_index: usize) -> Self {
        Self {
            file: None,
            path: None,
            dir: dir.to_path_buf(),
            device_index,
        }
    }

    /// Path of the currently open recording, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one frame, opening a fresh file on first use.
    pub fn write_frame(
        &mut self,
        points: &[Point3s],
        colors: &[Rgb],
        timestamp_us: u64,
    ) -> Result<()> {
        if self.file.is_none() {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let path = self
                .dir
                .join(format!("recording_{}_{stamp}.bin", self.device_index));
            let file = File::create(&path)
                .with_context(|| format!("creating recording {}", path.display()))?;
            self.file = Some(BufWriter::new(file));
            self.path = Some(path);
        }

        let out = self.file.as_mut().expect("recording file just opened");
        write!(out, "n_points= {}\nframe_timestamp= {}\n", points.len(), timestamp_us)?;
        for p in points {
            out.write_all(&p.to_le_bytes())?;
        }
        for c in colors {
            out.write_all(&c.to_bytes())?;
        }
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    /// Close and forget the current file; the next write starts a new one.
    pub fn close(&mut self) {
        self.file = None;
        self.path = None;
    }
}

/// A recorded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub points: Vec<Point3s>,
    pub colors: Vec<Rgb>,
    pub timestamp_us: u64,
}

/// Sequential reader over a recording; loops at end of file.
pub struct FrameReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl FrameReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
        }
    }

    /// Read the next frame, reopening the file at EOF so playback loops.
    /// Returns `None` when the file cannot be opened or holds no frames.
    pub fn read_frame(&mut self) -> Option<RecordedFrame> {
        for attempt in 0..2 {
            if self.reader.is_none() {
                match File::open(&self.path) {
                    Ok(f) => self.reader = Some(BufReader::new(f)),
                    Err(err) => {
                        warn!("cannot open recording {}: {err}", self.path.display());
                        return None;
                    }
                }
            }

            match read_one_frame(self.reader.as_mut().expect("reader just opened")) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {
                    // End of file: reopen and try once more.
                    self.reader = None;
                    if attempt == 1 {
                        return None;
                    }
                }
                Err(err) => {
                    warn!("recording {} unreadable: {err}", self.path.display());
                    self.reader = None;
                    return None;
                }
            }
        }
        None
    }
}

fn read_one_frame(reader: &mut BufReader<File>) -> Result<Option<RecordedFrame>> {
    let Some(n_points) = read_header_value(reader, "n_points=")? else {
        return Ok(None);
    };
    let Some(timestamp) = read_header_value(reader, "frame_timestamp=")? else {
        bail!("frame truncated after point count");
    };

    let n = n_points as usize;
    let mut points = Vec::with_capacity(n);
    let mut colors = Vec::with_capacity(n);

    let mut buf = [0u8; Point3s::SIZE];
    for _ in 0..n {
        reader.read_exact(&mut buf)?;
        points.push(Point3s::from_le_bytes(&buf));
    }
    let mut cbuf = [0u8; Rgb::SIZE];
    for _ in 0..n {
        reader.read_exact(&mut cbuf)?;
        colors.push(Rgb::from_bytes(&cbuf));
    }

    // Trailing newline after the binary block.
    let mut nl = [0u8; 1];
    let _ = reader.read(&mut nl)?;

    Ok(Some(RecordedFrame {
        points,
        colors,
        timestamp_us: timestamp,
    }))
}

/// Read a `label value` header line. `Ok(None)` signals a clean EOF.
fn read_header_value(reader: &mut BufReader<File>, label: &str) -> Result<Option<u64>> {
    let mut line = String::new();
    let read = reader.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value = line
        .strip_prefix(label)
        .with_context(|| format!("expected `{label}`, got `{line}`"))?
        .trim()
        .parse::<u64>()
        .context("bad header value")?;
    Ok(Some(value))
}

/// A point cloud loaded from a PLY file.
#[derive(Debug, Clone, Default)]
pub struct PlyCloud {
    pub points: Vec<Point3s>,
    pub colors: Vec<Rgb>,
}

/// Write a coloured cloud as PLY; positions are float metres, colours
/// `uchar red/green/blue`.
pub fn write_ply(path: &Path, points: &[Point3s], colors: &[Rgb], binary: bool) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("creating ply {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let format = if binary { "binary_little_endian" } else { "ascii" };
    write!(
        out,
        "ply\nformat {format} 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         property uchar red\nproperty uchar green\nproperty uchar blue\n\
         end_header\n",
        points.len()
    )?;

    for (p, c) in points.iter().zip(colors.iter()) {
        let m = p.to_metres();
        if binary {
            out.write_all(&m.x.to_le_bytes())?;
            out.write_all(&m.y.to_le_bytes())?;
            out.write_all(&m.z.to_le_bytes())?;
            out.write_all(&[c.r, c.g, c.b])?;
        } else {
            writeln!(out, "{} {} {} {} {} {}", m.x, m.y, m.z, c.r, c.g, c.b)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Read a PLY cloud written by [`write_ply`] or a compatible fixture
/// (optional `uchar alpha` is accepted and ignored).
pub fn read_ply(path: &Path) -> Result<PlyCloud> {
    let file = File::open(path).with_context(|| format!("opening ply {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut binary = false;
    let mut vertex_count = 0usize;
    let mut has_alpha = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            bail!("ply header truncated");
        }
        let line = line.trim();
        if line.starts_with("format binary_little_endian") {
            binary = true;
        } else if let Some(rest) = line.strip_prefix("element vertex ") {
            vertex_count = rest.trim().parse().context("bad vertex count")?;
        } else if line == "property uchar alpha" {
            has_alpha = true;
        } else if line == "end_header" {
            break;
        }
    }

    let mut cloud = PlyCloud::default();
    if binary {
        for _ in 0..vertex_count {
            let mut f = [0u8; 4];
            let mut xyz = [0.0f32; 3];
            for v in xyz.iter_mut() {
                reader.read_exact(&mut f)?;
                *v = f32::from_le_bytes(f);
            }
            let mut rgb = [0u8; 3];
            reader.read_exact(&mut rgb)?;
            if has_alpha {
                let mut a = [0u8; 1];
                reader.read_exact(&mut a)?;
            }
            cloud
                .points
                .push(Point3s::from_metres(&Point3f::new(xyz[0], xyz[1], xyz[2])));
            cloud.colors.push(Rgb::new(rgb[2], rgb[1], rgb[0]));
        }
    } else {
        for _ in 0..vertex_count {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                bail!("ply data truncated");
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                bail!("ply vertex line has {} fields", fields.len());
            }
            let x: f32 = fields[0].parse()?;
            let y: f32 = fields[1].parse()?;
            let z: f32 = fields[2].parse()?;
            let r: u8 = fields[3].parse()?;
            let g: u8 = fields[4].parse()?;
            let b: u8 = fields[5].parse()?;
            cloud
                .points
                .push(Point3s::from_metres(&Point3f::new(x, y, z)));
            cloud.colors.push(Rgb::new(b, g, r));
        }
    }

    Ok(cloud)
}
