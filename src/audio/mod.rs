//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod pipeline;
pub mod playback;

pub use buffer::{AudioChunk, ChunkQueue};
pub use capture::{CaptureSource, ReaderSource, SilentSource};
pub use pipeline::{AudioEndpoints, AudioPipeline, TalkSwitch};
pub use playback::{NullSink, PlaybackSink, WriterSink};
