//! Pull-paced TCP stream servers.
//!
//! Each server accepts any number of viewers. A viewer requests one
//! frame by writing a single `0x00`; the broadcaster answers with the
//! source's current payload. Viewers that hang up or stall are pruned by
//! a one-second health timer.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::protocol::PULL_REQUEST;

/// Accept-loop cadence.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);
/// Health-timer cadence.
const HEALTH_INTERVAL: Duration = Duration::from_millis(1000);
/// A viewer that cannot take a frame within this window is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Supplies encoded frames to a stream server.
///
/// `next_payload` receives the sequence number the viewer last saw and
/// returns the next payload with its sequence number, or `None` when
/// there is nothing new for that viewer.
pub trait FrameSource: Send + Sync {
    fn next_payload(&self, last_seq: u64) -> Option<(u64, Vec<u8>)>;
}

struct Viewer {
    stream: TcpStream,
    peer: SocketAddr,
    alive: bool,
    last_seq: u64,
}

/// One pull-paced TCP listener with its broadcaster and health timer.
pub struct StreamServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl StreamServer {
    /// Bind and start the accept, broadcast and health threads.
    pub fn start(
        name: &'static str,
        port: u16,
        broadcast_interval: Duration,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("binding {name} server on port {port}"))?;
        listener
            .set_nonblocking(true)
            .context("setting listener non-blocking")?;
        let local_addr = listener.local_addr()?;
        info!("{name} server listening on {local_addr}");

        let viewers: Arc<Mutex<Vec<Viewer>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        // Accept task.
        {
            let viewers = Arc::clone(&viewers);
            let stop = Arc::clone(&stop);
            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!("{name}: viewer connected from {peer}");
                            let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
                            lock(&viewers).push(Viewer {
                                stream,
                                peer,
                                alive: true,
                                last_seq: 0,
                            });
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_INTERVAL);
                        }
                        Err(err) => {
                            warn!("{name}: accept failed: {err}");
                            thread::sleep(ACCEPT_INTERVAL);
                        }
                    }
                }
            }));
        }

        // Broadcast task: answer pending pull requests.
        {
            let viewers = Arc::clone(&viewers);
            let stop = Arc::clone(&stop);
            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    {
                        let mut viewers = lock(&viewers);
                        for viewer in viewers.iter_mut().filter(|v| v.alive) {
                            serve_viewer(name, viewer, source.as_ref());
                        }
                    }
                    thread::sleep(broadcast_interval);
                }
            }));
        }

        // Health timer: prune dead viewers.
        {
            let viewers = Arc::clone(&viewers);
            let stop = Arc::clone(&stop);
            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    {
                        let mut viewers = lock(&viewers);
                        let before = viewers.len();
                        viewers.retain(|v| v.alive);
                        if viewers.len() != before {
                            debug!("{name}: pruned {} viewer(s)", before - viewers.len());
                        }
                    }
                    thread::sleep(HEALTH_INTERVAL);
                }
            }));
        }

        Ok(Self {
            local_addr,
            stop,
            threads,
        })
    }

    /// The bound address (useful when started with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop all tasks and join them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Answer one viewer's pending pull request, if any.
fn serve_viewer(name: &str, viewer: &mut Viewer, source: &dyn FrameSource) {
    let mut pull = [0u8; 1];
    if viewer.stream.set_nonblocking(true).is_err() {
        viewer.alive = false;
        return;
    }
    let request = viewer.stream.read(&mut pull);
    let _ = viewer.stream.set_nonblocking(false);

    match request {
        Ok(0) => {
            debug!("{name}: viewer {} hung up", viewer.peer);
            viewer.alive = false;
        }
        Ok(_) if pull[0] == PULL_REQUEST => {
            if let Some((seq, payload)) = source.next_payload(viewer.last_seq) {
                if let Err(err) = viewer.stream.write_all(&payload) {
                    debug!("{name}: dropping viewer {}: {err}", viewer.peer);
                    viewer.alive = false;
                } else {
                    viewer.last_seq = seq;
                }
            }
        }
        Ok(_) => {
            // Unknown request byte; ignore and keep pacing.
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => {
            debug!("{name}: viewer {} read failed: {err}", viewer.peer);
            viewer.alive = false;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
