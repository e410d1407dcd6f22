//! Audio playback
//!
//! The receive thread pulls chunks off the session and hands them to a
//! [`PlaybackSink`] as they arrive. There is no jitter buffer: chunks are
//! played in arrival order.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::AudioError;
use crate::session::Session;

/// Something that plays raw PCM
pub trait PlaybackSink: Send + 'static {
    fn play(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn play(&mut self, _chunk: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Sink writing PCM to any writer (stdout, a file, a pipe to `aplay`)
pub struct WriterSink<W: Write + Send + 'static> {
    writer: W,
}

impl<W: Write + Send + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + 'static> PlaybackSink for WriterSink<W> {
    fn play(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub type SharedSink = Arc<Mutex<Box<dyn PlaybackSink>>>;

/// Receive thread feeding a playback sink
pub struct ReceiveLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    chunks_played: Arc<AtomicU64>,
}

impl ReceiveLoop {
    /// Start receiving. The loop ends on `stop` or when the session's
    /// channel fails; a quiet channel alone never ends it.
    pub fn start(session: Session, sink: SharedSink, poll_interval: Duration) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let chunks_played = Arc::new(AtomicU64::new(0));

        let handle = {
            let running = Arc::clone(&running);
            let chunks_played = Arc::clone(&chunks_played);
            thread::Builder::new()
                .name(format!("receive-{}", &session.id().simple().to_string()[..8]))
                .spawn(move || receive_loop(running, session, sink, poll_interval, chunks_played))
                .map_err(|e| AudioError::Thread(e.to_string()))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
            chunks_played,
        })
    }

    /// Stop and wait; returns within one poll interval
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Receive thread panicked");
            }
        }
    }

    pub fn chunks_played(&self) -> u64 {
        self.chunks_played.load(Ordering::Relaxed)
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    running: Arc<AtomicBool>,
    session: Session,
    sink: SharedSink,
    poll_interval: Duration,
    chunks_played: Arc<AtomicU64>,
) {
    info!("Playback started for session {}", session.id());
    let mut playback_failed = false;

    while running.load(Ordering::Relaxed) {
        match session.receive(poll_interval) {
            Ok(Some(chunk)) => {
                let mut sink = sink.lock();
                match sink.play(&chunk) {
                    Ok(()) => {
                        chunks_played.fetch_add(1, Ordering::Relaxed);
                        playback_failed = false;
                    }
                    Err(e) => {
                        // Keep receiving; a sink hiccup is not a channel failure
                        if !playback_failed {
                            warn!("Playback failed: {}", e);
                        }
                        playback_failed = true;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Receive loop for session {} ended: {}", session.id(), e);
                break;
            }
        }
    }

    if let Err(e) = sink.lock().flush() {
        debug!("Playback flush failed: {}", e);
    }
}
