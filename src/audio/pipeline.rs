//! Duplex audio pipeline for one session
//!
//! ```text
//!  CaptureSource ─► [capture] ─► ChunkQueue ─► [send] ─► Session::send
//!  Session::receive ─► [receive] ─► PlaybackSink
//! ```
//!
//! Three threads per session, all stopped and joined by
//! [`AudioPipeline::stop`]. Sources and sinks outlive pipelines so a
//! transport switchover can reuse them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::audio::buffer::ChunkQueue;
use crate::audio::capture::{CaptureContext, CaptureLoop, CaptureSource, SilentSource};
use crate::audio::playback::{NullSink, PlaybackSink, ReceiveLoop, SharedSink};
use crate::capability::{CapabilityGate, OperationFamily};
use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::session::Session;

/// Push-to-talk state. With push-to-talk off, audio always flows.
#[derive(Debug)]
pub struct TalkSwitch {
    push_to_talk: bool,
    talking: AtomicBool,
}

impl TalkSwitch {
    pub fn new(push_to_talk: bool) -> Self {
        Self {
            push_to_talk,
            talking: AtomicBool::new(false),
        }
    }

    pub fn set_talking(&self, talking: bool) {
        self.talking.store(talking, Ordering::SeqCst);
    }

    pub fn is_talking(&self) -> bool {
        self.talking.load(Ordering::SeqCst)
    }

    pub fn is_push_to_talk(&self) -> bool {
        self.push_to_talk
    }

    /// Whether captured audio should go out right now
    pub fn should_transmit(&self) -> bool {
        !self.push_to_talk || self.is_talking()
    }
}

/// Long-lived capture source and playback sink shared by every pipeline
#[derive(Clone)]
pub struct AudioEndpoints {
    source: Arc<Mutex<Box<dyn CaptureSource>>>,
    sink: SharedSink,
}

impl AudioEndpoints {
    pub fn new(source: impl CaptureSource, sink: impl PlaybackSink) -> Self {
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// No capture, playback discarded
    pub fn silent(poll_interval: Duration) -> Self {
        Self::new(SilentSource::new(poll_interval), NullSink)
    }
}

/// Running capture/send/receive threads for one session
pub struct AudioPipeline {
    session: Session,
    capture: CaptureLoop,
    receive: ReceiveLoop,
    stopped: bool,
}

impl AudioPipeline {
    /// Start streaming over `session`. Fails without starting anything if
    /// the send capability is missing.
    pub fn start(
        session: Session,
        endpoints: &AudioEndpoints,
        gate: Arc<CapabilityGate>,
        talk: Arc<TalkSwitch>,
        config: &AudioConfig,
        poll_interval: Duration,
    ) -> Result<Self, AudioError> {
        gate.check(OperationFamily::Send, session.transport())
            .map_err(AudioError::PermissionDenied)?;

        let receive = ReceiveLoop::start(session.clone(), Arc::clone(&endpoints.sink), poll_interval)?;
        let capture = CaptureLoop::start(CaptureContext {
            source: Arc::clone(&endpoints.source),
            queue: Arc::new(ChunkQueue::new(config.queue_capacity)),
            session: session.clone(),
            gate,
            talk,
            chunk_size: config.chunk_size,
            poll_interval,
        })?;

        info!(
            "Audio pipeline running for session {} over {}",
            session.id(),
            session.transport()
        );
        Ok(Self {
            session,
            capture,
            receive,
            stopped: false,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Stop all three threads. Idempotent; must not be called from a
    /// pipeline thread.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.capture.stop();
        self.receive.stop();
        info!("Audio pipeline stopped for session {}", self.session.id());
    }

    pub fn chunks_captured(&self) -> u64 {
        self.capture.chunks_captured()
    }

    pub fn chunks_muted(&self) -> u64 {
        self.capture.chunks_muted()
    }

    pub fn chunks_played(&self) -> u64 {
        self.receive.chunks_played()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
