//! Audio capture
//!
//! Capture runs on its own thread, reading fixed-size chunks from a
//! [`CaptureSource`] and queueing them for the send thread. The capability
//! gate is consulted for every chunk so a revoked microphone permission
//! stops audio leaving the device immediately.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{AudioChunk, SharedChunkQueue};
use crate::audio::pipeline::TalkSwitch;
use crate::capability::{CapabilityGate, OperationFamily};
use crate::error::{AudioError, TransportError};
use crate::session::Session;

/// Something that produces raw PCM.
///
/// `read` must return within roughly one poll interval even when no audio
/// is available (returning `Ok(0)`), so capture can be stopped promptly.
pub trait CaptureSource: Send + 'static {
    /// Fill `buf` with up to `buf.len()` bytes of audio
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Source that never produces audio
#[derive(Debug, Clone)]
pub struct SilentSource {
    poll_interval: Duration,
}

impl SilentSource {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl CaptureSource for SilentSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(self.poll_interval);
        Ok(0)
    }
}

/// Capture from any blocking reader (stdin, a file, a pipe).
///
/// A helper thread does the blocking reads and hands over whole chunks, so
/// `read` itself only ever waits for `poll_interval`.
pub struct ReaderSource {
    chunks: Receiver<Vec<u8>>,
    poll_interval: Duration,
    pending: Vec<u8>,
}

impl ReaderSource {
    pub fn spawn<R: Read + Send + 'static>(
        mut reader: R,
        chunk_size: usize,
        poll_interval: Duration,
    ) -> Result<Self, AudioError> {
        let (tx, rx) = bounded::<Vec<u8>>(8);
        thread::Builder::new()
            .name("capture-reader".to_string())
            .spawn(move || {
                loop {
                    let mut chunk = vec![0u8; chunk_size];
                    let mut filled = 0;
                    while filled < chunk_size {
                        match reader.read(&mut chunk[filled..]) {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => {
                                warn!("Capture reader failed: {}", e);
                                break;
                            }
                        }
                    }
                    if filled == 0 {
                        debug!("Capture input ended");
                        return;
                    }
                    chunk.truncate(filled);
                    if tx.send(chunk).is_err() {
                        return;
                    }
                    if filled < chunk_size {
                        return;
                    }
                }
            })
            .map_err(|e| AudioError::Thread(e.to_string()))?;

        Ok(Self {
            chunks: rx,
            poll_interval,
            pending: Vec::new(),
        })
    }
}

impl CaptureSource for ReaderSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.chunks.recv_timeout(self.poll_interval) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "capture input ended"))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Capture-side counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub chunks_captured: AtomicU64,
    /// Chunks discarded because the talk switch was off
    pub chunks_muted: AtomicU64,
}

/// Capture thread plus the send thread that drains its queue
pub struct CaptureLoop {
    running: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
}

/// Everything the capture loop needs from its surroundings
pub(crate) struct CaptureContext {
    pub source: Arc<parking_lot::Mutex<Box<dyn CaptureSource>>>,
    pub queue: SharedChunkQueue,
    pub session: Session,
    pub gate: Arc<CapabilityGate>,
    pub talk: Arc<TalkSwitch>,
    pub chunk_size: usize,
    pub poll_interval: Duration,
}

impl CaptureLoop {
    pub(crate) fn start(ctx: CaptureContext) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let session_id = ctx.session.id();

        let send_handle = {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&ctx.queue);
            let session = ctx.session.clone();
            let idle = (ctx.poll_interval / 20).max(Duration::from_micros(500));
            thread::Builder::new()
                .name(format!("send-{}", short_id(&session_id)))
                .spawn(move || send_loop(running, queue, session, idle))
                .map_err(|e| AudioError::Thread(e.to_string()))?
        };

        let capture_handle = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("capture-{}", short_id(&session_id)))
                .spawn(move || capture_loop(running, ctx, stats))
        };
        let capture_handle = match capture_handle {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = send_handle.join();
                return Err(AudioError::Thread(e.to_string()));
            }
        };

        Ok(Self {
            running,
            capture_handle: Some(capture_handle),
            send_handle: Some(send_handle),
            stats,
        })
    }

    /// Stop both threads and wait for them. After this returns nothing
    /// more is sent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        for handle in [self.send_handle.take(), self.capture_handle.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn chunks_captured(&self) -> u64 {
        self.stats.chunks_captured.load(Ordering::Relaxed)
    }

    pub fn chunks_muted(&self) -> u64 {
        self.stats.chunks_muted.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(running: Arc<AtomicBool>, ctx: CaptureContext, stats: Arc<CaptureStats>) {
    let kind = ctx.session.transport();
    let mut buf = vec![0u8; ctx.chunk_size];
    let mut source = ctx.source.lock();

    info!("Capture started for session {}", ctx.session.id());

    while running.load(Ordering::Relaxed) {
        let n = match source.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!("Capture stopped: {}", e);
                break;
            }
        };

        if let Err(denied) = ctx.gate.check(OperationFamily::Send, kind) {
            ctx.session.fail(TransportError::PermissionDenied(denied));
            break;
        }

        if !ctx.talk.should_transmit() {
            stats.chunks_muted.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let chunk = AudioChunk::new(Bytes::copy_from_slice(&buf[..n]));
        stats.chunks_captured.fetch_add(1, Ordering::Relaxed);

        // Full queue: drop rather than stall capture
        if !ctx.queue.push(chunk) {
            ctx.session.record_overflow();
        }
    }

    let dropped = ctx.queue.clear();
    debug!(
        "Capture stopped for session {} ({} queued chunks discarded)",
        ctx.session.id(),
        dropped
    );
}

fn send_loop(running: Arc<AtomicBool>, queue: SharedChunkQueue, session: Session, idle: Duration) {
    while running.load(Ordering::Relaxed) && !session.is_closed() {
        match queue.pop() {
            Some(chunk) => session.send(&chunk.data),
            None => thread::sleep(idle),
        }
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    #[test]
    fn test_reader_source_splits_chunks() {
        let input: Vec<u8> = (0..10u8).collect();
        let mut source = ReaderSource::spawn(Cursor::new(input), 4, Duration::from_millis(200)).unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match source.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => got.push(buf[..n].to_vec()),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
            }
        }
        assert_eq!(got, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn test_silent_source_returns_promptly() {
        let mut source = SilentSource::new(Duration::from_millis(5));
        let started = Instant::now();
        assert_eq!(source.read(&mut [0u8; 16]).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
