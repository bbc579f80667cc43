//! Seams between the playback engines and whatever actually produces sound.
//!
//! Engines never block: hardware progress comes back as [`EngineEvent`]s
//! tagged with the generation of the engine that asked for it, and the
//! controller drops events whose generation is no longer live.

use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::AudioError;
use crate::protocol::StreamFormat;

/// Identity of one engine instance. Strictly increasing per process.
pub type Generation = u64;

/// Identity of one scheduled buffer inside a PCM graph.
pub type SourceId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Progressive sink finished its last append and accepts another.
    SinkReady { generation: Generation },
    /// A scheduled PCM buffer finished playing.
    SourceEnded {
        generation: Generation,
        source: SourceId,
    },
    /// Progressive element or one-shot clip played to the end.
    OutputEnded { generation: Generation },
    PlaybackFailed {
        generation: Generation,
        reason: String,
    },
    /// A delayed re-check requested through [`RetryScheduler`].
    Retry { generation: Generation },
}

impl EngineEvent {
    pub fn generation(&self) -> Generation {
        match self {
            EngineEvent::SinkReady { generation }
            | EngineEvent::SourceEnded { generation, .. }
            | EngineEvent::OutputEnded { generation }
            | EngineEvent::PlaybackFailed { generation, .. }
            | EngineEvent::Retry { generation } => *generation,
        }
    }
}

/// Non-output analysis point: reads the most recent waveform without
/// affecting what is heard.
pub trait AudioTap {
    /// Copy up to `out.len()` of the latest mono samples, oldest first.
    /// Returns how many were written.
    fn time_domain(&self, out: &mut [f32]) -> usize;
}

/// Sample-accurate processing graph at a fixed rate.
pub trait PcmGraph {
    /// Audible position of the graph clock in seconds.
    fn current_time(&self) -> f64;

    /// Schedule per-channel buffers to start at `start_time` on the graph
    /// clock. A start the output has already written past is moved to its
    /// write head; the start actually used is returned. Completion is
    /// reported with `EngineEvent::SourceEnded`.
    fn schedule(&mut self, source: SourceId, planes: Vec<Vec<f32>>, start_time: f64) -> Result<f64, AudioError>;

    fn stop_source(&mut self, source: SourceId);

    /// Tap on the gain node every source is connected to.
    fn tap(&self) -> Rc<dyn AudioTap>;

    /// Let whatever is scheduled play out, then release the device.
    /// Idempotent.
    fn close(&mut self);

    /// Cut output immediately and release the device. Idempotent.
    fn abort(&mut self);
}

/// Append-only buffer for encoded audio that plays as bytes arrive.
pub trait MediaSink {
    /// `true` while the previous append is still being consumed.
    fn is_updating(&self) -> bool;

    fn append(&mut self, chunk: Bytes) -> Result<(), AudioError>;

    /// No more data will follow; the element ends once drained.
    fn end_of_stream(&mut self);

    /// Drop everything buffered and release the output.
    fn abort(&mut self);

    /// Tap on the media element bound to this sink.
    fn tap(&self) -> Rc<dyn AudioTap>;
}

/// One-shot playback of a fully assembled clip.
pub trait MediaClip {
    fn stop(&mut self);

    fn tap(&self) -> Rc<dyn AudioTap>;
}

pub trait AudioBackend {
    /// Whether `mime` can be decoded incrementally from chunks.
    fn supports_progressive(&self, mime: &str) -> bool;

    fn open_graph(&self, sample_rate: u32, channels: u16, generation: Generation) -> Result<Box<dyn PcmGraph>, AudioError>;

    fn open_sink(&self, mime: &str, generation: Generation) -> Result<Box<dyn MediaSink>, AudioError>;

    fn play_clip(&self, format: &StreamFormat, data: Vec<u8>, generation: Generation) -> Result<Box<dyn MediaClip>, AudioError>;
}

/// Delayed, cancellable delivery of an [`EngineEvent`].
pub trait RetryScheduler {
    fn schedule(&self, delay: Duration, event: EngineEvent) -> RetryHandle;
}

/// Cancels the pending retry when cancelled or dropped.
#[derive(Debug)]
pub struct RetryHandle {
    token: CancellationToken,
}

impl RetryHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for RetryHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
