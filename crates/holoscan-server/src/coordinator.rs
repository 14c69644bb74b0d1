//! The multi-camera coordinator.
//!
//! Owns every capture pipeline, receives their events, maintains the
//! fused cloud the stream servers read, sequences hardware-sync role
//! changes and refines calibration across cameras with ICP.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use holoscan_calib::icp;
use holoscan_capture::codec::write_ply;
use holoscan_capture::{CapturePipeline, CaptureSource, PipelineEvents, SyncRole};
use holoscan_core::math::AffineTransform;
use holoscan_core::{CameraSettings, CaptureVolume, Point3f, Point3s, Rgb};
use holoscan_vision::DocumentCandidate;

use crate::protocol::{encode_document_frame, encode_point_cloud_frame};
use crate::stream::FrameSource;

/// Coordinator construction parameters.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub pipeline: holoscan_capture::PipelineConfig,
    pub settings: CameraSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Idle,
    Enabling,
    Disabling,
}

struct SyncPlan {
    mode: SyncMode,
    master: Option<usize>,
    pending_subordinates: HashSet<usize>,
    pending_all: HashSet<usize>,
    master_closed: bool,
    master_started: bool,
}

impl Default for SyncPlan {
    fn default() -> Self {
        Self {
            mode: SyncMode::Idle,
            master: None,
            pending_subordinates: HashSet::new(),
            pending_all: HashSet::new(),
            master_closed: false,
            master_started: false,
        }
    }
}

/// Event-sink state shared between the coordinator and its pipelines.
pub struct CoordinatorShared {
    serials: Mutex<HashMap<usize, String>>,
    latest: Mutex<HashMap<usize, (Vec<Point3s>, Vec<Rgb>)>>,
    recorded: Mutex<HashMap<usize, (Vec<Point3s>, Vec<Rgb>, bool)>>,
    calibrations: Mutex<HashMap<usize, AffineTransform>>,
    record_acks: Mutex<HashSet<usize>>,
    fused: Mutex<(Vec<Point3s>, Vec<Rgb>)>,
    document: Mutex<Option<(u64, Vec<u8>)>>,
    document_seq: AtomicU64,
    all_devices_initialized: AtomicBool,
    master_start_count: AtomicUsize,
    sync: Mutex<SyncPlan>,
    pipelines: Mutex<Vec<Arc<CapturePipeline>>>,
}

impl CoordinatorShared {
    fn new() -> Self {
        Self {
            serials: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            recorded: Mutex::new(HashMap::new()),
            calibrations: Mutex::new(HashMap::new()),
            record_acks: Mutex::new(HashSet::new()),
            fused: Mutex::new((Vec::new(), Vec::new())),
            document: Mutex::new(None),
            document_seq: AtomicU64::new(0),
            all_devices_initialized: AtomicBool::new(true),
            master_start_count: AtomicUsize::new(0),
            sync: Mutex::new(SyncPlan::default()),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatch `start_master` once every subordinate has acknowledged
    /// and the master has closed. Exactly once per enable cycle.
    fn maybe_start_master(&self, plan: &mut SyncPlan) {
        if plan.mode != SyncMode::Enabling
            || plan.master_started
            || !plan.master_closed
            || !plan.pending_subordinates.is_empty()
        {
            return;
        }
        let Some(master) = plan.master else {
            return;
        };
        plan.master_started = true;
        self.master_start_count.fetch_add(1, Ordering::SeqCst);

        let pipeline = self
            .lock(&self.pipelines)
            .iter()
            .find(|p| p.camera_index() == master)
            .cloned();
        match pipeline {
            Some(pipeline) => {
                info!("all subordinates up, restarting master camera {master}");
                pipeline.start_master();
            }
            None => error!("sync plan refers to unknown camera {master}"),
        }
    }
}

impl PipelineEvents for CoordinatorShared {
    fn serial_number(&self, camera: usize, serial: &str) {
        debug!("camera {camera} announced serial {serial}");
        self.lock(&self.serials).insert(camera, serial.to_string());
    }

    fn latest_frame(&self, camera: usize, vertices: Vec<Point3s>, colors: Vec<Rgb>) {
        self.lock(&self.latest).insert(camera, (vertices, colors));
    }

    fn recorded_frame(
        &self,
        camera: usize,
        vertices: Vec<Point3s>,
        colors: Vec<Rgb>,
        end_of_stream: bool,
    ) {
        self.lock(&self.recorded)
            .insert(camera, (vertices, colors, end_of_stream));
    }

    fn frame_recorded(&self, camera: usize) {
        self.lock(&self.record_acks).insert(camera);
    }

    fn calibrated(&self, camera: usize, marker_id: i32, transform: AffineTransform) {
        info!("camera {camera} calibrated against marker {marker_id}");
        self.lock(&self.calibrations).insert(camera, transform);
    }

    fn sync_state_changed(&self, camera: usize, role: SyncRole) {
        let mut plan = self.lock(&self.sync);
        plan.pending_all.remove(&camera);
        match role {
            SyncRole::Master => plan.master_closed = true,
            SyncRole::Subordinate => {
                plan.pending_subordinates.remove(&camera);
            }
            SyncRole::Standalone => {}
        }

        match plan.mode {
            SyncMode::Enabling => self.maybe_start_master(&mut plan),
            SyncMode::Disabling => {
                if plan.pending_all.is_empty() {
                    plan.mode = SyncMode::Idle;
                    self.all_devices_initialized.store(true, Ordering::SeqCst);
                    info!("hardware sync disabled, all cameras standalone");
                }
            }
            SyncMode::Idle => {}
        }
    }

    fn master_restarted(&self, camera: usize) {
        let mut plan = self.lock(&self.sync);
        if plan.mode == SyncMode::Enabling && plan.master == Some(camera) {
            plan.mode = SyncMode::Idle;
            self.all_devices_initialized.store(true, Ordering::SeqCst);
            info!("hardware sync live, master camera {camera} restarted");
        }
    }

    fn document(&self, camera: usize, document: DocumentCandidate) {
        match encode_document_frame(&document) {
            Ok(payload) => {
                let seq = self.document_seq.fetch_add(1, Ordering::SeqCst) + 1;
                *self.lock(&self.document) = Some((seq, payload));
                debug!(
                    "camera {camera} published document {}x{} (score {:.3})",
                    document.width, document.height, document.score
                );
            }
            Err(err) => warn!("camera {camera} document encoding failed: {err}"),
        }
    }
}

/// Role assignment for hardware sync: serials sorted lexicographically,
/// first becomes master, the rest subordinates with increasing trigger
/// offsets; cameras without a serial stay standalone.
fn plan_sync_roles(serials: &[(usize, String)]) -> Vec<(usize, SyncRole, i32)> {
    let mut named: Vec<&(usize, String)> =
        serials.iter().filter(|(_, s)| !s.is_empty()).collect();
    named.sort_by(|a, b| a.1.cmp(&b.1));

    let mut roles = Vec::with_capacity(serials.len());
    for (rank, (camera, _)) in named.iter().enumerate() {
        if rank == 0 {
            roles.push((*camera, SyncRole::Master, 0));
        } else {
            roles.push((*camera, SyncRole::Subordinate, rank as i32));
        }
    }
    for (camera, serial) in serials {
        if serial.is_empty() {
            roles.push((*camera, SyncRole::Standalone, 0));
        }
    }
    roles
}

/// The coordinator: one per application.
pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
    pipelines: Vec<Arc<CapturePipeline>>,
    settings: Mutex<CameraSettings>,
    volume: CaptureVolume,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create one pipeline per capture source and start their workers.
    pub fn new(sources: Vec<Box<dyn CaptureSource>>, config: CoordinatorConfig) -> Self {
        let shared = Arc::new(CoordinatorShared::new());
        let events: Arc<dyn PipelineEvents> = Arc::clone(&shared) as _;

        let pipelines: Vec<Arc<CapturePipeline>> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                Arc::new(CapturePipeline::new(
                    index,
                    source,
                    Arc::clone(&events),
                    config.pipeline.clone(),
                ))
            })
            .collect();
        *shared.lock(&shared.pipelines) = pipelines.clone();

        let mut workers = Vec::new();
        for pipeline in &pipelines {
            pipeline.set_settings(config.settings.clone());
            let p = Arc::clone(pipeline);
            workers.push(thread::spawn(move || p.run()));
        }

        Self {
            shared,
            pipelines,
            settings: Mutex::new(config.settings),
            volume: config.pipeline.volume,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(workers),
        }
    }

    pub fn camera_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Registered serial numbers, by camera index.
    pub fn serials(&self) -> HashMap<usize, String> {
        self.shared.lock(&self.shared.serials).clone()
    }

    pub fn sync_is_settled(&self) -> bool {
        self.shared.all_devices_initialized.load(Ordering::SeqCst)
    }

    /// Broadcast new settings to every pipeline.
    pub fn set_settings(&self, settings: CameraSettings) {
        *self.shared.lock(&self.settings) = settings.clone();
        for pipeline in &self.pipelines {
            pipeline.set_settings(settings.clone());
        }
    }

    /// Ask every camera to run the marker calibration procedure.
    pub fn calibrate_all(&self) {
        for pipeline in &self.pipelines {
            pipeline.calibrate();
        }
    }

    /// Record the next processed frame on every camera.
    pub fn record_frame_all(&self) {
        for pipeline in &self.pipelines {
            pipeline.start_recording();
        }
    }

    /// Close all recording files.
    pub fn clear_recordings_all(&self) {
        for pipeline in &self.pipelines {
            pipeline.clear_recordings();
        }
    }

    /// Pull the latest cloud from every pipeline and rebuild the fused
    /// buffer under the merge lock.
    pub fn fuse_latest(&self) {
        for pipeline in &self.pipelines {
            pipeline.request_latest();
        }

        let latest = self.shared.lock(&self.shared.latest);
        let mut fused = self.shared.lock(&self.shared.fused);
        fused.0.clear();
        fused.1.clear();
        for (vertices, colors) in latest.values() {
            fused.0.extend_from_slice(vertices);
            fused.1.extend_from_slice(colors);
        }
    }

    /// Spawn a periodic fusion tick.
    pub fn start_fusion(self: &Arc<Self>, period: Duration) {
        let coordinator = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                coordinator.fuse_latest();
                thread::sleep(period);
            }
        });
        self.shared_workers().push(handle);
    }

    fn shared_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stream source for the fused point cloud.
    pub fn cloud_source(&self) -> Arc<dyn FrameSource> {
        Arc::new(CloudFrameSource {
            shared: Arc::clone(&self.shared),
            volume: self.volume,
            seq: AtomicU64::new(0),
        })
    }

    /// Stream source for detected documents.
    pub fn document_source(&self) -> Arc<dyn FrameSource> {
        Arc::new(DocumentFrameSource {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Enable hardware sync: assign roles by serial, dispatch the role
    /// changes, and gate the master restart on the subordinate ACKs.
    pub fn enable_hardware_sync(&self) -> Result<()> {
        if !self.sync_is_settled() {
            bail!("sync transition already in progress");
        }

        let serials: Vec<(usize, String)> = self
            .pipelines
            .iter()
            .map(|p| (p.camera_index(), p.serial_number()))
            .collect();
        let roles = plan_sync_roles(&serials);
        if !roles.iter().any(|(_, role, _)| *role == SyncRole::Master) {
            bail!("no camera with a serial number, cannot pick a master");
        }

        {
            let mut plan = self.shared.lock(&self.shared.sync);
            *plan = SyncPlan {
                mode: SyncMode::Enabling,
                master: roles
                    .iter()
                    .find(|(_, role, _)| *role == SyncRole::Master)
                    .map(|(camera, _, _)| *camera),
                pending_subordinates: roles
                    .iter()
                    .filter(|(_, role, _)| *role == SyncRole::Subordinate)
                    .map(|(camera, _, _)| *camera)
                    .collect(),
                pending_all: roles.iter().map(|(camera, _, _)| *camera).collect(),
                master_closed: false,
                master_started: false,
            };
            self.shared
                .all_devices_initialized
                .store(false, Ordering::SeqCst);
        }

        for (camera, role, offset) in &roles {
            let pipeline = self
                .pipelines
                .iter()
                .find(|p| p.camera_index() == *camera)
                .expect("role plan covers known cameras");
            info!("camera {camera}: sync role {role:?}, offset {offset}");
            pipeline.enable_sync(*role, *offset);
        }
        Ok(())
    }

    /// Return every camera to standalone capture.
    pub fn disable_hardware_sync(&self) {
        {
            let mut plan = self.shared.lock(&self.shared.sync);
            *plan = SyncPlan {
                mode: SyncMode::Disabling,
                pending_all: self.pipelines.iter().map(|p| p.camera_index()).collect(),
                ..SyncPlan::default()
            };
            self.shared
                .all_devices_initialized
                .store(false, Ordering::SeqCst);
        }
        for pipeline in &self.pipelines {
            pipeline.disable_sync();
        }
    }

    /// Cross-camera ICP refinement. Each pass aligns every camera's
    /// cloud against the concatenation of all the others; the
    /// accumulated corrections are composed into the per-camera world
    /// transforms and pushed back to the pipelines. Returns the applied
    /// corrections.
    pub fn refine_calibration(&self) -> Result<HashMap<usize, AffineTransform>> {
        let (refine_iterations, icp_iterations) = {
            let settings = self.shared.lock(&self.settings);
            (
                settings.refine_iterations.max(0) as usize,
                settings.icp_iterations.max(1) as usize,
            )
        };

        self.fuse_latest();
        let mut clouds: HashMap<usize, Vec<Point3f>> = {
            let latest = self.shared.lock(&self.shared.latest);
            latest
                .iter()
                .map(|(&camera, (vertices, _))| {
                    (camera, vertices.iter().map(|p| p.to_metres()).collect())
                })
                .collect()
        };

        if clouds.len() < 2 {
            bail!("refinement needs at least two cameras with clouds");
        }

        let cameras: Vec<usize> = clouds.keys().copied().collect();
        let mut corrections: HashMap<usize, AffineTransform> = cameras
            .iter()
            .map(|&c| (c, AffineTransform::identity()))
            .collect();

        for pass in 0..refine_iterations {
            for &camera in &cameras {
                let target: Vec<Point3f> = cameras
                    .iter()
                    .filter(|&&other| other != camera)
                    .flat_map(|other| clouds[other].iter().copied())
                    .collect();
                if target.is_empty() {
                    continue;
                }

                let mut source = clouds.remove(&camera).unwrap_or_default();
                let result = icp(&target, &mut source, icp_iterations);
                clouds.insert(camera, source);

                let step = AffineTransform::new(result.rotation, result.translation);
                let entry = corrections
                    .get_mut(&camera)
                    .expect("correction entry exists");
                *entry = entry.compose_correction(&step);
                debug!(
                    "refine pass {pass}, camera {camera}: residual {:.6}",
                    result.residual
                );
            }
        }

        let mut calibrations = self.shared.lock(&self.shared.calibrations);
        for &camera in &cameras {
            let world = calibrations
                .get(&camera)
                .copied()
                .unwrap_or_else(AffineTransform::identity);
            let refined = world.compose_correction(&corrections[&camera]);
            calibrations.insert(camera, refined);

            if let Some(pipeline) = self.pipelines.iter().find(|p| p.camera_index() == camera) {
                pipeline.receive_calibration(refined);
            }
        }

        Ok(corrections)
    }

    /// Export the current clouds as PLY, merged or per camera.
    pub fn save_scans(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let (merge, binary) = {
            let settings = self.shared.lock(&self.settings);
            (settings.merge_scans, settings.save_binary_ply)
        };

        self.fuse_latest();
        let mut written = Vec::new();

        if merge {
            let fused = self.shared.lock(&self.shared.fused);
            let path = dir.join("scan_merged.ply");
            write_ply(&path, &fused.0, &fused.1, binary).context("writing merged scan")?;
            written.push(path);
        } else {
            let latest = self.shared.lock(&self.shared.latest);
            let serials = self.serials();
            for (camera, (vertices, colors)) in latest.iter() {
                let name = serials
                    .get(camera)
                    .cloned()
                    .unwrap_or_else(|| format!("camera{camera}"));
                let path = dir.join(format!("scan_{name}.ply"));
                write_ply(&path, vertices, colors, binary)
                    .with_context(|| format!("writing scan for camera {camera}"))?;
                written.push(path);
            }
        }
        Ok(written)
    }

    /// Stop every worker and wait for them.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for pipeline in &self.pipelines {
            pipeline.request_exit();
        }
        for handle in self.shared_workers().drain(..) {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    fn master_start_count(&self) -> usize {
        self.shared.master_start_count.load(Ordering::SeqCst)
    }
}

struct CloudFrameSource {
    shared: Arc<CoordinatorShared>,
    volume: CaptureVolume,
    seq: AtomicU64,
}

impl FrameSource for CloudFrameSource {
    fn next_payload(&self, _last_seq: u64) -> Option<(u64, Vec<u8>)> {
        let fused = self.shared.lock(&self.shared.fused);
        let payload = encode_point_cloud_frame(&fused.0, &fused.1, &self.volume);
        Some((self.seq.fetch_add(1, Ordering::SeqCst) + 1, payload))
    }
}

struct DocumentFrameSource {
    shared: Arc<CoordinatorShared>,
}

impl FrameSource for DocumentFrameSource {
    fn next_payload(&self, last_seq: u64) -> Option<(u64, Vec<u8>)> {
        let document = self.shared.lock(&self.shared.document);
        document
            .as_ref()
            .filter(|(seq, _)| *seq > last_seq)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holoscan_capture::SyntheticSource;
    use std::time::Instant;

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

    fn coordinator_with_serials(serials: &[&str], dir: &Path) -> Arc<Coordinator> {
        let sources: Vec<Box<dyn CaptureSource>> = serials
            .iter()
            .map(|s| {
                Box::new(SyntheticSource::with_resolution(s, 256, 192, 256, 192))
                    as Box<dyn CaptureSource>
            })
            .collect();
        let config = CoordinatorConfig {
            pipeline: holoscan_capture::PipelineConfig {
                storage_dir: dir.to_path_buf(),
                ..Default::default()
            },
            settings: CameraSettings::default(),
        };
        Arc::new(Coordinator::new(sources, config))
    }

    #[test]
    fn sync_roles_sort_by_serial() {
        let serials = vec![
            (0, "A001".to_string()),
            (1, "A000".to_string()),
            (2, "A002".to_string()),
        ];
        let roles = plan_sync_roles(&serials);
        assert_eq!(roles[0], (1, SyncRole::Master, 0));
        assert_eq!(roles[1], (0, SyncRole::Subordinate, 1));
        assert_eq!(roles[2], (2, SyncRole::Subordinate, 2));
    }

    #[test]
    fn empty_serial_becomes_standalone() {
        let serials = vec![(0, "B9".to_string()), (1, String::new())];
        let roles = plan_sync_roles(&serials);
        assert!(roles.contains(&(0, SyncRole::Master, 0)));
        assert!(roles.contains(&(1, SyncRole::Standalone, 0)));
    }

    #[test]
    fn sync_enable_restarts_master_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with_serials(&["A001", "A000", "A002"], dir.path());

        assert!(wait_for(
            || coordinator.serials().len() == 3,
            Duration::from_secs(3)
        ));

        coordinator.enable_hardware_sync().unwrap();
        assert!(wait_for(
            || coordinator.sync_is_settled(),
            Duration::from_secs(3)
        ));
        assert_eq!(coordinator.master_start_count(), 1);

        // The master is the lexicographically smallest serial.
        let plan_master = {
            let plan = coordinator.shared.lock(&coordinator.shared.sync);
            plan.master
        };
        let serials = coordinator.serials();
        assert_eq!(serials[&plan_master.unwrap()], "A000");

        coordinator.disable_hardware_sync();
        assert!(wait_for(
            || coordinator.sync_is_settled(),
            Duration::from_secs(3)
        ));

        coordinator.shutdown();
    }

    #[test]
    fn fusion_concatenates_camera_clouds() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with_serials(&["C0", "C1"], dir.path());

        assert!(wait_for(
            || coordinator.serials().len() == 2,
            Duration::from_secs(3)
        ));

        assert!(wait_for(
            || {
                coordinator.fuse_latest();
                let fused = coordinator.shared.lock(&coordinator.shared.fused);
                !fused.0.is_empty() && fused.0.len() == fused.1.len()
            },
            Duration::from_secs(3)
        ));

        // The cloud stream source always has a frame.
        let source = coordinator.cloud_source();
        let (seq, payload) = source.next_payload(0).unwrap();
        assert_eq!(seq, 1);
        assert!(payload.len() >= 6);

        coordinator.shutdown();
    }

    #[test]
    fn refinement_of_identical_clouds_is_near_identity() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with_serials(&["D0", "D1"], dir.path());

        assert!(wait_for(
            || {
                coordinator.fuse_latest();
                let latest = coordinator.shared.lock(&coordinator.shared.latest);
                latest.len() == 2 && latest.values().all(|(v, _)| !v.is_empty())
            },
            Duration::from_secs(3)
        ));

        let corrections = coordinator.refine_calibration().unwrap();
        assert_eq!(corrections.len(), 2);
        for correction in corrections.values() {
            // Identical synthetic scenes need no correction.
            assert!(correction.t.norm() < 0.01, "t = {:?}", correction.t);
            let trace =
                correction.r[(0, 0)] + correction.r[(1, 1)] + correction.r[(2, 2)];
            assert!(trace > 2.99, "r = {:?}", correction.r);
        }

        coordinator.shutdown();
    }

    #[test]
    fn save_scans_writes_per_camera_files() {
        let dir = tempfile::tempdir().unwrap();
        let scans = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with_serials(&["E0", "E1"], dir.path());

        assert!(wait_for(
            || {
                coordinator.fuse_latest();
                let latest = coordinator.shared.lock(&coordinator.shared.latest);
                latest.len() == 2 && latest.values().all(|(v, _)| !v.is_empty())
            },
            Duration::from_secs(3)
        ));

        let written = coordinator.save_scans(scans.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|p| p.exists()));

        coordinator.shutdown();
    }
}
