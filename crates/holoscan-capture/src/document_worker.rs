//! Asynchronous document detection.
//!
//! The capture worker posts at most one pending (colour, depth) pair; a
//! single detection thread services the latest one (newer submissions
//! overwrite older pending ones) and fires the result callback on the
//! worker thread. Publishing downstream is additionally gated by
//! [`DocumentGate`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use holoscan_core::Rgb;
use holoscan_vision::{DocumentCandidate, DocumentDetector};
use log::debug;

/// Minimum interval between frames handed to the detector.
pub const SUBMIT_INTERVAL: Duration = Duration::from_millis(1000);
/// A candidate older than this is always published.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Publish when the crop differs from the previous one by more than this
/// normalised mean absolute difference.
pub const PUBLISH_DIFF_THRESHOLD: f32 = 0.50;

/// One pending detection job.
pub struct PendingFrame {
    pub color: Vec<Rgb>,
    pub color_width: u32,
    pub color_height: u32,
    pub depth: Vec<u16>,
    pub depth_width: u32,
    pub depth_height: u32,
}

struct Slot {
    pending: Mutex<Option<PendingFrame>>,
    available: Condvar,
    stop: AtomicBool,
}

/// Owns the detection thread and the single-frame submission slot.
pub struct DocumentWorker {
    slot: Arc<Slot>,
    handle: Option<JoinHandle<()>>,
}

impl DocumentWorker {
    /// Spawn the worker; `on_result` runs on the worker thread for every
    /// successful detection.
    pub fn spawn<F>(on_result: F) -> Self
    where
        F: Fn(DocumentCandidate) + Send + 'static,
    {
        let slot = Arc::new(Slot {
            pending: Mutex::new(None),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let thread_slot = Arc::clone(&slot);
        let handle = std::thread::spawn(move || {
            let mut detector = DocumentDetector::new();
            loop {
                let frame = {
                    let mut pending = thread_slot
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    loop {
                        if thread_slot.stop.load(Ordering::SeqCst) {
                            return;
                        }
                        if let Some(frame) = pending.take() {
                            break frame;
                        }
                        pending = thread_slot
                            .available
                            .wait(pending)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                };

                if let Some(candidate) = detector.detect(
                    &frame.color,
                    frame.color_width,
                    frame.color_height,
                    &frame.depth,
                    frame.depth_width,
                    frame.depth_height,
                ) {
                    on_result(candidate);
                }
            }
        });

        Self {
            slot,
            handle: Some(handle),
        }
    }

    /// Post a frame, replacing any not-yet-processed one.
    pub fn submit(&self, frame: PendingFrame) {
        let mut pending = self.slot.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.is_some() {
            debug!("document worker busy, replacing pending frame");
        }
        *pending = Some(frame);
        self.slot.available.notify_one();
    }
}

impl Drop for DocumentWorker {
    fn drop(&mut self) {
        self.slot.stop.store(true, Ordering::SeqCst);
        self.slot.available.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Decides whether a detected candidate is worth pushing downstream.
///
/// A candidate is published when any of: no document was published
/// before; the crop differs from the previous publish by more than the
/// difference threshold; its score beats the previous one; or the last
/// publish is older than the timeout.
#[derive(Default)]
pub struct DocumentGate {
    last_pixels: Option<(Vec<Rgb>, u32, u32)>,
    last_score: f32,
    last_publish: Option<Instant>,
}

impl DocumentGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_publish(&mut self, candidate: &DocumentCandidate, now: Instant) -> bool {
        let publish = match (&self.last_pixels, self.last_publish) {
            (None, _) | (_, None) => true,
            (Some((pixels, w, h)), Some(at)) => {
                let diff = holoscan_vision::raster::mean_abs_diff(
                    &candidate.pixels,
                    candidate.width,
                    candidate.height,
                    pixels,
                    *w,
                    *h,
                );
                now.duration_since(at) >= PUBLISH_TIMEOUT
                    || diff > PUBLISH_DIFF_THRESHOLD
                    || candidate.score > self.last_score
            }
        };

        if publish {
            self.last_pixels = Some((
                candidate.pixels.clone(),
                candidate.width,
                candidate.height,
            ));
            self.last_score = candidate.score;
            self.last_publish = Some(now);
        }
        publish
    }
}
