//! The per-camera capture pipeline.
//!
//! One worker thread per camera ingests framesets from the capture
//! source, assembles the processed cloud and serves control requests
//! raised through one-shot flags. A companion confirmations thread polls
//! the flags and fires the outbound event callbacks, mirroring the
//! control flow the coordinator expects.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use holoscan_calib::CalibrationEngine;
use holoscan_core::math::AffineTransform;
use holoscan_core::{
    remove_outliers, remove_sparse_voxels, CameraSettings, CaptureVolume, Point3f, Point3s, Rgb,
    VoxelSet,
};
use holoscan_vision::DocumentCandidate;
use log::{error, warn};

use crate::align::back_project;
use crate::codec::{FrameReader, FrameWriter};
use crate::document_worker::{DocumentGate, DocumentWorker, PendingFrame, SUBMIT_INTERVAL};
use crate::source::{CaptureSource, SyncRole, FORMAT_RGB888, FORMAT_Y16};

/// Frameset acquisition timeout.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(1000);
/// A fresh camera must produce a frame within this window to count as
/// alive (subordinates excepted, they wait for the master trigger).
pub const STARTUP_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);
/// Confirmations thread poll interval.
const CONFIRMATION_POLL: Duration = Duration::from_millis(1);
/// Density filter bucket size and minimum occupancy.
const DENSITY_VOXEL_SIZE: f32 = 0.006;
const DENSITY_MIN_POINTS: usize = 12;

/// Outbound callbacks from a pipeline to its coordinator. Supplied at
/// construction; no global registry.
pub trait PipelineEvents: Send + Sync {
    fn serial_number(&self, camera: usize, serial: &str);
    fn latest_frame(&self, camera: usize, vertices: Vec<Point3s>, colors: Vec<Rgb>);
    fn recorded_frame(
        &self,
        camera: usize,
        vertices: Vec<Point3s>,
        colors: Vec<Rgb>,
        end_of_stream: bool,
    );
    fn frame_recorded(&self, camera: usize);
    fn calibrated(&self, camera: usize, marker_id: i32, transform: AffineTransform);
    fn sync_state_changed(&self, camera: usize, role: SyncRole);
    fn master_restarted(&self, camera: usize);
    fn document(&self, camera: usize, document: DocumentCandidate);
}

/// Static pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub volume: CaptureVolume,
    /// Directory for calibration files and recordings.
    pub storage_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            volume: CaptureVolume::default(),
            storage_dir: PathBuf::from("."),
        }
    }
}

/// One camera's capture pipeline. All control operations are
/// non-blocking flag flips unless noted; `run` is the blocking worker
/// loop.
pub struct CapturePipeline {
    camera_index: usize,
    config: PipelineConfig,
    events: Arc<dyn PipelineEvents>,

    source: Mutex<Box<dyn CaptureSource>>,
    settings: Mutex<CameraSettings>,
    calibration: Mutex<CalibrationEngine>,
    last_frame: Mutex<(Vec<Point3s>, Vec<Rgb>)>,
    recorder: Mutex<FrameWriter>,
    player: Mutex<Option<FrameReader>>,
    current_role: Mutex<SyncRole>,
    serial: Mutex<String>,
    document_gate: Mutex<DocumentGate>,
    pending_document: Mutex<Option<DocumentCandidate>>,

    exit_requested: AtomicBool,
    calibrate_requested: AtomicBool,
    record_requested: AtomicBool,
    restarting: AtomicBool,
    initialized: AtomicBool,

    confirm_recorded: AtomicBool,
    confirm_calibrated: AtomicBool,
    confirm_sync_state: AtomicBool,
    confirm_master_restart: AtomicBool,
    send_document: AtomicBool,
}

impl CapturePipeline {
    pub fn new(
        camera_index: usize,
        source: Box<dyn CaptureSource>,
        events: Arc<dyn PipelineEvents>,
        config: PipelineConfig,
    ) -> Self {
        let recorder = FrameWriter::new(&config.storage_dir, camera_index);
        Self {
            camera_index,
            config,
            events,
            source: Mutex::new(source),
            settings: Mutex::new(CameraSettings::default()),
            calibration: Mutex::new(CalibrationEngine::new()),
            last_frame: Mutex::new((Vec::new(), Vec::new())),
            recorder: Mutex::new(recorder),
            player: Mutex::new(None),
            current_role: Mutex::new(SyncRole::Standalone),
            serial: Mutex::new(String::new()),
            document_gate: Mutex::new(DocumentGate::new()),
            pending_document: Mutex::new(None),
            exit_requested: AtomicBool::new(false),
            calibrate_requested: AtomicBool::new(false),
            record_requested: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            confirm_recorded: AtomicBool::new(false),
            confirm_calibrated: AtomicBool::new(false),
            confirm_sync_state: AtomicBool::new(false),
            confirm_master_restart: AtomicBool::new(false),
            send_document: AtomicBool::new(false),
        }
    }

    pub fn camera_index(&self) -> usize {
        self.camera_index
    }

    pub fn serial_number(&self) -> String {
        self.lock(&self.serial).clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// The blocking worker loop; returns once [`Self::request_exit`] is
    /// called.
    pub fn run(self: &Arc<Self>) {
        let confirmations = {
            let pipeline = Arc::clone(self);
            thread::spawn(move || pipeline.confirmation_loop())
        };

        let worker = {
            let pipeline = Arc::clone(self);
            DocumentWorker::spawn(move |candidate| pipeline.on_document(candidate))
        };

        self.initialize();

        let mut last_document_submit: Option<Instant> = None;
        let mut warned_color_format = false;
        let mut warned_depth_format = false;

        while !self.exit_requested.load(Ordering::SeqCst) {
            if !self.initialized.load(Ordering::SeqCst) || self.restarting.load(Ordering::SeqCst)
            {
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            let frame = {
                let mut source = self.lock(&self.source);
                source.acquire_frame(FRAME_TIMEOUT)
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // Timeout or dropped frame; retry next tick.
                    thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(err) => {
                    warn!("camera {}: frame acquisition failed: {err}", self.camera_index);
                    continue;
                }
            };

            if frame.color_timestamp_us != frame.depth_timestamp_us {
                continue;
            }
            if frame.color_format != FORMAT_RGB888 && !warned_color_format {
                warn!(
                    "camera {}: unexpected colour format {}",
                    self.camera_index, frame.color_format
                );
                warned_color_format = true;
            }
            if frame.depth_format != FORMAT_Y16 && !warned_depth_format {
                warn!(
                    "camera {}: unexpected depth format {}",
                    self.camera_index, frame.depth_format
                );
                warned_depth_format = true;
            }

            let aligned = back_project(&frame);

            // Throttled handoff to the document detector.
            if last_document_submit.map_or(true, |at| at.elapsed() >= SUBMIT_INTERVAL) {
                worker.submit(PendingFrame {
                    color: frame.color.clone(),
                    color_width: frame.color_width,
                    color_height: frame.color_height,
                    depth: aligned.aligned_depth.clone(),
                    depth_width: frame.depth_width,
                    depth_height: frame.depth_height,
                });
                last_document_submit = Some(Instant::now());
            }

            // Assemble the processed cloud.
            let (points, colors) = {
                let settings = self.lock(&self.settings).clone();
                let calibration = {
                    let engine = self.lock(&self.calibration);
                    engine.is_calibrated().then(|| engine.world_transform())
                };
                let mut voxel = self.volume_voxel_set();
                process_cloud(
                    &aligned.vertices,
                    &aligned.colors,
                    &settings,
                    calibration.as_ref(),
                    &mut voxel,
                )
            };
            {
                let mut last = self.lock(&self.last_frame);
                *last = (points.clone(), colors.clone());
            }

            if self.record_requested.swap(false, Ordering::SeqCst) {
                let mut recorder = self.lock(&self.recorder);
                if let Err(err) =
                    recorder.write_frame(&points, &colors, frame.color_timestamp_us)
                {
                    warn!("camera {}: recording failed: {err}", self.camera_index);
                }
                self.confirm_recorded.store(true, Ordering::SeqCst);
            }

            if self.calibrate_requested.load(Ordering::SeqCst) {
                // The full-resolution depth-space cloud, before clipping
                // or calibration, feeds the marker procedure.
                let finalised = {
                    let mut engine = self.lock(&self.calibration);
                    engine.submit_frame(
                        &aligned.colors,
                        &aligned.vertices,
                        frame.depth_width,
                        frame.depth_height,
                    )
                };
                if finalised {
                    let serial = self.serial_number();
                    let engine = self.lock(&self.calibration);
                    if let Err(err) = engine.save(&self.config.storage_dir, &serial) {
                        warn!("camera {}: saving calibration failed: {err}", self.camera_index);
                    }
                    drop(engine);
                    self.confirm_calibrated.store(true, Ordering::SeqCst);
                    self.calibrate_requested.store(false, Ordering::SeqCst);
                }
            }
        }

        drop(worker);
        let _ = confirmations.join();
    }

    /// Open standalone, announce the serial, restore persisted
    /// calibration and verify the camera produces frames.
    fn initialize(&self) {
        let opened = {
            let mut source = self.lock(&self.source);
            source.open(SyncRole::Standalone, 0)
        };
        if let Err(err) = opened {
            error!("camera {}: failed to open capture device: {err}", self.camera_index);
            self.initialized.store(false, Ordering::SeqCst);
            return;
        }

        let serial = self.lock(&self.source).serial_number();
        *self.lock(&self.serial) = serial.clone();
        self.events.serial_number(self.camera_index, &serial);

        {
            let mut engine = self.lock(&self.calibration);
            if engine.load(&self.config.storage_dir, &serial) && engine.is_calibrated() {
                self.confirm_calibrated.store(true, Ordering::SeqCst);
            }
        }

        self.apply_exposure();
        self.initialized.store(true, Ordering::SeqCst);

        // Liveness: a standalone camera must produce a frame quickly.
        let deadline = Instant::now() + STARTUP_LIVENESS_TIMEOUT;
        while !self.exit_requested.load(Ordering::SeqCst) {
            let got = {
                let mut source = self.lock(&self.source);
                source.acquire_frame(Duration::from_millis(100))
            };
            match got {
                Ok(Some(_)) => break,
                _ if Instant::now() > deadline => {
                    error!(
                        "camera {}: no frame within startup window, marking uninitialised",
                        self.camera_index
                    );
                    self.initialized.store(false, Ordering::SeqCst);
                    break;
                }
                _ => {}
            }
        }
    }

    fn confirmation_loop(&self) {
        while !self.exit_requested.load(Ordering::SeqCst) {
            if self.confirm_recorded.swap(false, Ordering::SeqCst) {
                self.events.frame_recorded(self.camera_index);
            }
            if self.confirm_calibrated.swap(false, Ordering::SeqCst) {
                let (marker_id, transform) = {
                    let engine = self.lock(&self.calibration);
                    (engine.used_marker_id(), engine.world_transform())
                };
                self.events.calibrated(self.camera_index, marker_id, transform);
            }
            if self.confirm_sync_state.swap(false, Ordering::SeqCst) {
                let role = *self.lock(&self.current_role);
                self.events.sync_state_changed(self.camera_index, role);
            }
            if self.confirm_master_restart.swap(false, Ordering::SeqCst) {
                self.events.master_restarted(self.camera_index);
            }
            if self.send_document.swap(false, Ordering::SeqCst) {
                if let Some(document) = self.lock(&self.pending_document).take() {
                    self.events.document(self.camera_index, document);
                }
            }
            thread::sleep(CONFIRMATION_POLL);
        }
    }

    fn on_document(&self, candidate: DocumentCandidate) {
        let publish = self
            .lock(&self.document_gate)
            .should_publish(&candidate, Instant::now());
        if publish {
            *self.lock(&self.pending_document) = Some(candidate);
            self.send_document.store(true, Ordering::SeqCst);
        }
    }

    /// Ask the worker loop to stop.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    /// Record the next processed frame.
    pub fn start_recording(&self) {
        self.record_requested.store(true, Ordering::SeqCst);
    }

    /// Run the marker calibration procedure on upcoming frames.
    pub fn calibrate(&self) {
        self.calibrate_requested.store(true, Ordering::SeqCst);
    }

    /// Replace the active settings; forwards marker poses to the
    /// calibration engine and exposure to the device.
    pub fn set_settings(&self, settings: CameraSettings) {
        self.lock(&self.calibration)
            .set_marker_poses(settings.marker_poses.clone());
        *self.lock(&self.settings) = settings;
        self.apply_exposure();
    }

    fn apply_exposure(&self) {
        let (auto, step) = {
            let settings = self.lock(&self.settings);
            (settings.auto_exposure, settings.exposure_step)
        };
        if let Err(err) = self.lock(&self.source).set_exposure(auto, step) {
            warn!("camera {}: setting exposure failed: {err}", self.camera_index);
        }
    }

    /// Publish the latest processed cloud through the event sink. Counts
    /// are clamped to the smaller of the two buffers.
    pub fn request_latest(&self) {
        let (mut vertices, mut colors) = self.lock(&self.last_frame).clone();
        if vertices.len() != colors.len() {
            warn!(
                "camera {}: size mismatch, {} vertices vs {} colours, sending the smaller",
                self.camera_index,
                vertices.len(),
                colors.len()
            );
            let n = vertices.len().min(colors.len());
            vertices.truncate(n);
            colors.truncate(n);
        }
        self.events.latest_frame(self.camera_index, vertices, colors);
    }

    /// Stream back the next recorded frame; flags end-of-stream when
    /// nothing can be read.
    pub fn request_recorded(&self) {
        let mut player = self.lock(&self.player);
        if player.is_none() {
            let recorder = self.lock(&self.recorder);
            if let Some(path) = recorder.path() {
                *player = Some(FrameReader::new(path));
            }
        }

        let frame = player.as_mut().and_then(|p| p.read_frame());
        match frame {
            Some(frame) => {
                self.events
                    .recorded_frame(self.camera_index, frame.points, frame.colors, false)
            }
            None => self
                .events
                .recorded_frame(self.camera_index, Vec::new(), Vec::new(), true),
        }
    }

    /// Adopt a refined world transform from the coordinator.
    pub fn receive_calibration(&self, transform: AffineTransform) {
        self.lock(&self.calibration).set_world_transform(transform);
    }

    /// Close the current recording; the next recording starts fresh.
    pub fn clear_recordings(&self) {
        self.lock(&self.recorder).close();
        *self.lock(&self.player) = None;
    }

    /// Transition the camera into a hardware-sync role. Runs on the
    /// caller's thread; the ACK is delivered through the event sink.
    pub fn enable_sync(&self, role: SyncRole, sync_offset_units: i32) {
        self.restarting.store(true, Ordering::SeqCst);

        let result = match role {
            SyncRole::Subordinate => self.reopen(SyncRole::Subordinate, sync_offset_units),
            // Close only; the coordinator calls `start_master` once every
            // subordinate has acknowledged.
            SyncRole::Master => self.lock(&self.source).close(),
            SyncRole::Standalone => self.reopen(SyncRole::Standalone, 0),
        };

        match result {
            Ok(()) => {
                if role != SyncRole::Master {
                    self.restarting.store(false, Ordering::SeqCst);
                }
                *self.lock(&self.current_role) = role;
                self.confirm_sync_state.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                error!(
                    "camera {}: sync restart failed ({err}); restart the application",
                    self.camera_index
                );
            }
        }
    }

    /// Back to standalone capture.
    pub fn disable_sync(&self) {
        self.enable_sync(SyncRole::Standalone, 0);
    }

    /// Reopen the master once all subordinates are up.
    pub fn start_master(&self) {
        if *self.lock(&self.current_role) != SyncRole::Master {
            return;
        }
        let reopened = self.lock(&self.source).open(SyncRole::Master, 0);
        match reopened {
            Ok(()) => {
                self.restarting.store(false, Ordering::SeqCst);
                self.confirm_master_restart.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                error!(
                    "camera {}: master restart failed ({err}); restart the application",
                    self.camera_index
                );
            }
        }
    }

    fn reopen(&self, role: SyncRole, offset: i32) -> anyhow::Result<()> {
        let mut source = self.lock(&self.source);
        source.close()?;
        source.open(role, offset)
    }

    fn volume_voxel_set(&self) -> VoxelSet {
        let v = self.config.volume;
        VoxelSet::new(
            v.min_precision,
            v.center.x,
            v.center.y,
            v.center.z,
            v.half_range,
        )
        .expect("capture volume voxel size is positive")
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-frame cloud assembly: calibrate, clip, voxel de-duplicate,
/// density-filter, optionally KNN-filter, quantise to millimetres.
/// Uncalibrated cameras skip calibration, clipping and de-duplication.
pub(crate) fn process_cloud(
    vertices: &[Point3f],
    colors: &[Rgb],
    settings: &CameraSettings,
    calibration: Option<&AffineTransform>,
    voxel: &mut VoxelSet,
) -> (Vec<Point3s>, Vec<Rgb>) {
    voxel.reset();

    let mut kept: Vec<Point3f> = Vec::with_capacity(vertices.len());
    let mut kept_colors: Vec<Rgb> = Vec::with_capacity(vertices.len());

    for (p, c) in vertices.iter().zip(colors.iter()) {
        if p.invalid {
            continue;
        }
        match calibration {
            Some(transform) => {
                let w = transform.apply(&p.to_vec());
                if !settings.in_bounds(w.x, w.y, w.z) {
                    continue;
                }
                if !voxel.insert(w.x, w.y, w.z) {
                    continue;
                }
                kept.push(Point3f::from_vec(w));
                kept_colors.push(*c);
            }
            None => {
                kept.push(*p);
                kept_colors.push(*c);
            }
        }
    }

    remove_sparse_voxels(
        &mut kept,
        &mut kept_colors,
        DENSITY_VOXEL_SIZE,
        DENSITY_MIN_POINTS,
    );

    if settings.filter {
        remove_outliers(
            &mut kept,
            &mut kept_colors,
            settings.filter_neighbours,
            settings.filter_threshold,
        );
    }

    let shorts = kept.iter().map(Point3s::from_metres).collect();
    (shorts, kept_colors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticSource;

    fn volume_voxel() -> VoxelSet {
        let v = CaptureVolume::default();
        VoxelSet::new(v.min_precision, v.center.x, v.center.y, v.center.z, v.half_range).unwrap()
    }

    /// A dense clump large enough to survive the density filter.
    fn clump_at(x: f32, y: f32, z: f32) -> (Vec<Point3f>, Vec<Rgb>) {
        let mut vertices = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                vertices.push(Point3f::new(
                    x + i as f32 * 0.0013,
                    y + j as f32 * 0.0013,
                    z,
                ));
            }
        }
        let colors = vec![Rgb::new(5, 6, 7); vertices.len()];
        (vertices, colors)
    }

    fn clip_settings() -> CameraSettings {
        CameraSettings {
            min_bounds: [-0.1, -0.1, 0.0],
            max_bounds: [0.1, 0.1, 0.3],
            ..Default::default()
        }
    }

    #[test]
    fn bounds_clipping_drops_outside_points() {
        let settings = clip_settings();
        let identity = AffineTransform::identity();
        let mut voxel = volume_voxel();

        let (mut vertices, mut colors) = clump_at(0.0, 0.0, 0.1);
        let inside = vertices.len();
        let (more_v, more_c) = clump_at(0.2, 0.0, 0.1);
        vertices.extend(more_v);
        colors.extend(more_c);

        let (points, out_colors) =
            process_cloud(&vertices, &colors, &settings, Some(&identity), &mut voxel);
        assert_eq!(points.len(), inside);
        assert_eq!(out_colors.len(), inside);
        assert!(points.iter().all(|p| p.x <= 100));
    }

    #[test]
    fn voxel_dedup_keeps_first_point_per_cell() {
        let settings = clip_settings();
        let identity = AffineTransform::identity();
        let mut voxel = volume_voxel();

        // A clump plus a duplicate of its first point shifted by less
        // than one precision cell.
        let (mut vertices, mut colors) = clump_at(0.0, 0.0, 0.15);
        vertices.push(Point3f::new(0.0004, 0.0004, 0.1504));
        colors.push(Rgb::new(99, 99, 99));
        let expected = vertices.len() - 1;

        let (points, _) =
            process_cloud(&vertices, &colors, &settings, Some(&identity), &mut voxel);
        assert_eq!(points.len(), expected);
    }

    #[test]
    fn uncalibrated_camera_skips_clip_and_dedup() {
        let settings = clip_settings();
        let mut voxel = volume_voxel();
        let (vertices, colors) = clump_at(0.2, 0.0, 0.1); // outside bounds
        let n = vertices.len();
        let (points, _) = process_cloud(&vertices, &colors, &settings, None, &mut voxel);
        assert_eq!(points.len(), n);
    }

    #[test]
    fn calibration_transform_is_applied_before_clipping() {
        let settings = clip_settings();
        let mut voxel = volume_voxel();
        // The transform shifts the clump from outside the box to inside.
        let transform =
            AffineTransform::new(holoscan_core::Mat3::identity(), holoscan_core::Vec3::new(-0.2, 0.0, 0.0));
        let (vertices, colors) = clump_at(0.2, 0.0, 0.1);
        let n = vertices.len();
        let (points, _) =
            process_cloud(&vertices, &colors, &settings, Some(&transform), &mut voxel);
        assert_eq!(points.len(), n);
    }

    // Integration over the worker loop with a synthetic camera.

    #[derive(Default)]
    struct EventLog {
        serial: Mutex<Option<String>>,
        latest: Mutex<Option<(Vec<Point3s>, Vec<Rgb>)>>,
        recorded_frames: Mutex<Vec<(usize, bool)>>,
        record_acks: Mutex<usize>,
        sync_states: Mutex<Vec<SyncRole>>,
        master_restarts: Mutex<usize>,
    }

    impl PipelineEvents for EventLog {
        fn serial_number(&self, _camera: usize, serial: &str) {
            *self.serial.lock().unwrap() = Some(serial.to_string());
        }
        fn latest_frame(&self, _camera: usize, vertices: Vec<Point3s>, colors: Vec<Rgb>) {
            *self.latest.lock().unwrap() = Some((vertices, colors));
        }
        fn recorded_frame(
            &self,
            _camera: usize,
            vertices: Vec<Point3s>,
            _colors: Vec<Rgb>,
            end_of_stream: bool,
        ) {
            self.recorded_frames
                .lock()
                .unwrap()
                .push((vertices.len(), end_of_stream));
        }
        fn frame_recorded(&self, _camera: usize) {
            *self.record_acks.lock().unwrap() += 1;
        }
        fn calibrated(&self, _camera: usize, _marker_id: i32, _transform: AffineTransform) {}
        fn sync_state_changed(&self, _camera: usize, role: SyncRole) {
            self.sync_states.lock().unwrap().push(role);
        }
        fn master_restarted(&self, _camera: usize) {
            *self.master_restarts.lock().unwrap() += 1;
        }
        fn document(&self, _camera: usize, _document: DocumentCandidate) {}
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn start_pipeline(events: Arc<EventLog>, dir: &std::path::Path) -> (Arc<CapturePipeline>, thread::JoinHandle<()>) {
        let source = SyntheticSource::with_resolution("CAM0", 256, 192, 256, 192);
        let config = PipelineConfig {
            storage_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let pipeline = Arc::new(CapturePipeline::new(
            0,
            Box::new(source),
            events,
            config,
        ));
        let runner = {
            let p = Arc::clone(&pipeline);
            thread::spawn(move || p.run())
        };
        (pipeline, runner)
    }

    #[test]
    fn worker_announces_serial_and_serves_frames() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::default());
        let (pipeline, runner) = start_pipeline(Arc::clone(&events), dir.path());

        assert!(wait_for(
            || events.serial.lock().unwrap().as_deref() == Some("CAM0"),
            Duration::from_secs(2)
        ));

        assert!(wait_for(
            || {
                pipeline.request_latest();
                events
                    .latest
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map_or(false, |(v, c)| !v.is_empty() && v.len() == c.len())
            },
            Duration::from_secs(3)
        ));

        pipeline.request_exit();
        runner.join().unwrap();
    }

    #[test]
    fn recording_acks_and_plays_back() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::default());
        let (pipeline, runner) = start_pipeline(Arc::clone(&events), dir.path());

        pipeline.start_recording();
        assert!(wait_for(
            || *events.record_acks.lock().unwrap() >= 1,
            Duration::from_secs(3)
        ));

        pipeline.request_recorded();
        {
            let recorded = events.recorded_frames.lock().unwrap();
            assert_eq!(recorded.len(), 1);
            let (count, end) = recorded[0];
            assert!(count > 0);
            assert!(!end);
        }

        pipeline.request_exit();
        runner.join().unwrap();
    }

    #[test]
    fn sync_transitions_ack_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::default());
        let (pipeline, runner) = start_pipeline(Arc::clone(&events), dir.path());

        assert!(wait_for(
            || events.serial.lock().unwrap().is_some(),
            Duration::from_secs(2)
        ));

        pipeline.enable_sync(SyncRole::Master, 0);
        assert!(wait_for(
            || events.sync_states.lock().unwrap().contains(&SyncRole::Master),
            Duration::from_secs(2)
        ));
        assert!(pipeline.is_restarting());
        assert_eq!(*events.master_restarts.lock().unwrap(), 0);

        pipeline.start_master();
        assert!(wait_for(
            || *events.master_restarts.lock().unwrap() == 1,
            Duration::from_secs(2)
        ));
        assert!(!pipeline.is_restarting());

        pipeline.disable_sync();
        assert!(wait_for(
            || events
                .sync_states
                .lock()
                .unwrap()
                .contains(&SyncRole::Standalone),
            Duration::from_secs(2)
        ));

        pipeline.request_exit();
        runner.join().unwrap();
    }

    #[test]
    fn failed_device_marks_pipeline_uninitialised() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::default());
        let config = PipelineConfig {
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = Arc::new(CapturePipeline::new(
            1,
            Box::new(SyntheticSource::failing("DEAD")),
            events,
            config,
        ));
        let runner = {
            let p = Arc::clone(&pipeline);
            thread::spawn(move || p.run())
        };

        assert!(wait_for(
            || !pipeline.is_initialized(),
            Duration::from_secs(2)
        ));

        pipeline.request_exit();
        runner.join().unwrap();
    }
}
