use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use holoscan_capture::{CaptureSource, SyntheticSource};
use holoscan_core::{CameraSettings, CaptureVolume};
use holoscan_server::{Coordinator, CoordinatorConfig, StreamServer, DOCUMENT_PORT, POINT_CLOUD_PORT};
use holoscan_viewer::StreamClient;

/// Volumetric capture coordinator and stream inspection tools.
#[derive(Debug, Parser)]
#[command(author, version, about = "Volumetric capture coordinator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the coordinator with synthetic cameras and both stream
    /// servers.
    Serve {
        /// Number of synthetic cameras.
        #[arg(long, default_value_t = 2)]
        cameras: usize,

        /// Optional JSON file with `CameraSettings`.
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Directory for calibration files and recordings.
        #[arg(long, default_value = ".")]
        storage: PathBuf,

        /// Point-cloud stream port.
        #[arg(long, default_value_t = POINT_CLOUD_PORT)]
        cloud_port: u16,

        /// Document stream port.
        #[arg(long, default_value_t = DOCUMENT_PORT)]
        document_port: u16,

        /// Fusion tick interval in milliseconds.
        #[arg(long, default_value_t = 33)]
        fusion_interval_ms: u64,

        /// Enable hardware sync once all cameras are up.
        #[arg(long)]
        sync: bool,

        /// Stop after this many seconds (0 = run until killed).
        #[arg(long, default_value_t = 0)]
        duration_secs: u64,
    },

    /// Connect to a point-cloud stream and print frame statistics.
    View {
        /// Server address.
        #[arg(long, default_value = "127.0.0.1:48002")]
        address: String,

        /// Frames to pull before exiting.
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

fn load_settings(path: Option<&Path>) -> Result<CameraSettings> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings {}", path.display()))?;
            serde_json::from_str(&data).context("parsing settings JSON")
        }
        None => Ok(CameraSettings::default()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_serve(
    cameras: usize,
    settings: Option<&Path>,
    storage: &Path,
    cloud_port: u16,
    document_port: u16,
    fusion_interval_ms: u64,
    sync: bool,
    duration_secs: u64,
) -> Result<()> {
    let settings = load_settings(settings)?;

    let sources: Vec<Box<dyn CaptureSource>> = (0..cameras)
        .map(|i| {
            Box::new(SyntheticSource::with_resolution(
                &format!("SYN{i:03}"),
                256,
                192,
                256,
                192,
            )) as Box<dyn CaptureSource>
        })
        .collect();

    let config = CoordinatorConfig {
        pipeline: holoscan_capture::PipelineConfig {
            storage_dir: storage.to_path_buf(),
            ..Default::default()
        },
        settings,
    };

    let coordinator = Arc::new(Coordinator::new(sources, config));
    coordinator.start_fusion(Duration::from_millis(fusion_interval_ms));

    let cloud_server = StreamServer::start(
        "point-cloud",
        cloud_port,
        Duration::from_millis(10),
        coordinator.cloud_source(),
    )?;
    let document_server = StreamServer::start(
        "document",
        document_port,
        Duration::from_millis(100),
        coordinator.document_source(),
    )?;

    info!(
        "serving {cameras} camera(s): point cloud on {}, documents on {}",
        cloud_server.local_addr(),
        document_server.local_addr()
    );

    if sync {
        // Give the cameras a moment to announce their serials.
        std::thread::sleep(Duration::from_millis(500));
        coordinator.enable_hardware_sync()?;
    }

    if duration_secs == 0 {
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
    std::thread::sleep(Duration::from_secs(duration_secs));

    cloud_server.shutdown();
    document_server.shutdown();
    coordinator.shutdown();
    Ok(())
}

fn run_view(address: &str, frames: usize) -> Result<()> {
    let mut client = StreamClient::connect(address, CaptureVolume::default())?;
    for i in 0..frames {
        let frame = client.request_cloud_frame()?;
        println!(
            "frame {i}: scale {}, {} points, point size {:.4} m",
            frame.scale,
            frame.positions.len(),
            holoscan_viewer::point_size(frame.scale)
        );
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Serve {
            cameras,
            settings,
            storage,
            cloud_port,
            document_port,
            fusion_interval_ms,
            sync,
            duration_secs,
        } => run_serve(
            cameras,
            settings.as_deref(),
            &storage,
            cloud_port,
            document_port,
            fusion_interval_ms,
            sync,
            duration_secs,
        ),
        Command::View { address, frames } => run_view(&address, frames),
    }
}
