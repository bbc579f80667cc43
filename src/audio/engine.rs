//! The single active playback engine and the stage that owns it.

use std::rc::Rc;

use bytes::Bytes;

use super::amplitude::TapMode;
use super::backend::{AudioBackend, AudioTap, EngineEvent, Generation, RetryScheduler};
use super::compressed_engine::CompressedStreamEngine;
use super::fallback::BufferedFallbackPlayer;
use super::pcm_engine::PcmStreamEngine;
use crate::error::AudioError;
use crate::protocol::StreamFormat;
use crate::turn::TurnScoped;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    None,
    Compressed,
    Pcm,
    Fallback,
}

/// At most one engine plays at a time.
pub enum ActiveEngine {
    None,
    Compressed(CompressedStreamEngine),
    Pcm(PcmStreamEngine),
    Fallback(BufferedFallbackPlayer),
}

impl ActiveEngine {
    pub fn kind(&self) -> EngineKind {
        match self {
            ActiveEngine::None => EngineKind::None,
            ActiveEngine::Compressed(_) => EngineKind::Compressed,
            ActiveEngine::Pcm(_) => EngineKind::Pcm,
            ActiveEngine::Fallback(_) => EngineKind::Fallback,
        }
    }

    pub fn generation(&self) -> Option<Generation> {
        match self {
            ActiveEngine::None => None,
            ActiveEngine::Compressed(e) => Some(e.generation()),
            ActiveEngine::Pcm(e) => Some(e.generation()),
            ActiveEngine::Fallback(e) => Some(e.generation()),
        }
    }

    pub fn turn(&self) -> Option<u64> {
        match self {
            ActiveEngine::None => None,
            ActiveEngine::Compressed(e) => Some(e.turn()),
            ActiveEngine::Pcm(e) => Some(e.turn()),
            ActiveEngine::Fallback(e) => Some(e.turn()),
        }
    }

    fn phase(&self) -> Option<super::phase::PlaybackPhase> {
        match self {
            ActiveEngine::None => None,
            ActiveEngine::Compressed(e) => Some(e.phase()),
            ActiveEngine::Pcm(e) => Some(e.phase()),
            ActiveEngine::Fallback(e) => Some(e.phase()),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.phase().is_some_and(|p| p.is_playing())
    }

    /// Engine reached Finished or Cancelled and can be dropped.
    pub fn is_done(&self) -> bool {
        self.phase().is_some_and(|p| p.is_terminal())
    }

    fn append(&mut self, chunk: Bytes) -> Result<(), AudioError> {
        match self {
            ActiveEngine::None => Ok(()),
            ActiveEngine::Compressed(e) => e.append(chunk),
            ActiveEngine::Pcm(e) => e.append(&chunk),
            ActiveEngine::Fallback(e) => {
                e.append(chunk);
                Ok(())
            }
        }
    }

    fn end(&mut self, backend: &dyn AudioBackend) -> Result<(), AudioError> {
        match self {
            ActiveEngine::None => Ok(()),
            ActiveEngine::Compressed(e) => {
                e.end();
                Ok(())
            }
            ActiveEngine::Pcm(e) => {
                e.end();
                Ok(())
            }
            ActiveEngine::Fallback(e) => e.end(backend),
        }
    }

    fn cancel(&mut self) {
        match self {
            ActiveEngine::None => {}
            ActiveEngine::Compressed(e) => e.cancel(),
            ActiveEngine::Pcm(e) => e.cancel(),
            ActiveEngine::Fallback(e) => e.cancel(),
        }
    }

    /// Route an event already fenced to this engine's generation.
    fn handle_event(&mut self, event: &EngineEvent) -> Result<(), AudioError> {
        match (self, event) {
            (ActiveEngine::Compressed(e), EngineEvent::SinkReady { .. }) => e.on_sink_ready(),
            (ActiveEngine::Compressed(e), EngineEvent::Retry { .. }) => e.on_retry(),
            (ActiveEngine::Compressed(e), EngineEvent::OutputEnded { .. }) => {
                e.on_output_ended();
                Ok(())
            }
            (ActiveEngine::Pcm(e), EngineEvent::SourceEnded { source, .. }) => {
                e.on_source_ended(*source);
                Ok(())
            }
            (ActiveEngine::Pcm(e), EngineEvent::Retry { .. }) => {
                e.on_retry();
                Ok(())
            }
            (ActiveEngine::Fallback(e), EngineEvent::OutputEnded { .. }) => {
                e.on_output_ended();
                Ok(())
            }
            (_, EngineEvent::PlaybackFailed { reason, .. }) => Err(AudioError::Device(reason.clone())),
            (engine, other) => {
                log::debug!("{:?} engine ignores {:?}", engine.kind(), other);
                Ok(())
            }
        }
    }

    pub fn tap_target(&self) -> Option<(TapMode, Generation)> {
        match self {
            ActiveEngine::None => None,
            ActiveEngine::Pcm(e) => Some((TapMode::Node, e.generation())),
            ActiveEngine::Compressed(e) => Some((TapMode::Element, e.generation())),
            ActiveEngine::Fallback(e) => Some((TapMode::Element, e.generation())),
        }
    }

    pub fn tap(&self) -> Option<Rc<dyn AudioTap>> {
        match self {
            ActiveEngine::None => None,
            ActiveEngine::Compressed(e) => e.tap(),
            ActiveEngine::Pcm(e) => e.tap(),
            ActiveEngine::Fallback(e) => e.tap(),
        }
    }
}

/// Owns the backend, the retry scheduler and the active engine, and hands
/// out a fresh generation to every engine it creates.
pub struct AudioStage {
    backend: Rc<dyn AudioBackend>,
    scheduler: Rc<dyn RetryScheduler>,
    engine: ActiveEngine,
    next_generation: Generation,
    default_sample_rate: u32,
    default_channels: u16,
}

impl AudioStage {
    pub fn new(backend: Rc<dyn AudioBackend>, scheduler: Rc<dyn RetryScheduler>) -> Self {
        Self {
            backend,
            scheduler,
            engine: ActiveEngine::None,
            next_generation: 1,
            default_sample_rate: 24000,
            default_channels: 1,
        }
    }

    pub fn with_defaults(mut self, sample_rate: u32, channels: u16) -> Self {
        self.default_sample_rate = sample_rate;
        self.default_channels = channels;
        self
    }

    pub fn default_format(&self) -> (u32, u16) {
        (self.default_sample_rate, self.default_channels)
    }

    pub fn engine(&self) -> &ActiveEngine {
        &self.engine
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing()
    }

    pub fn active_turn(&self) -> Option<u64> {
        self.engine.turn()
    }

    fn allocate_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Stop whatever is playing and start the engine `format` calls for:
    /// PCM on the graph, encoded progressively when the backend can, and
    /// the buffered player otherwise.
    pub fn begin(&mut self, turn: u64, format: StreamFormat) -> EngineKind {
        self.stop("audio_begin");
        let generation = self.allocate_generation();

        match &format {
            StreamFormat::Pcm { sample_rate, channels } => {
                let mut pcm = PcmStreamEngine::new(generation, turn, self.scheduler.clone());
                if pcm.start(self.backend.as_ref(), *sample_rate, *channels) {
                    self.engine = ActiveEngine::Pcm(pcm);
                    return EngineKind::Pcm;
                }
                log::warn!("pcm engine unavailable, buffering turn {} instead", turn);
            }
            StreamFormat::Encoded { mime: Some(mime) } => {
                let mut compressed = CompressedStreamEngine::new(generation, turn, self.scheduler.clone());
                if compressed.start(self.backend.as_ref(), mime) {
                    self.engine = ActiveEngine::Compressed(compressed);
                    return EngineKind::Compressed;
                }
            }
            StreamFormat::Encoded { mime: None } => {}
        }

        self.engine = ActiveEngine::Fallback(BufferedFallbackPlayer::new(generation, turn, format));
        EngineKind::Fallback
    }

    /// Start buffering without a begin message; the clip format is sniffed
    /// by the backend once the stream ends.
    pub fn begin_implicit(&mut self, turn: u64) -> EngineKind {
        log::info!("chunk without audio_begin, buffering turn {}", turn);
        self.begin(turn, StreamFormat::Encoded { mime: None })
    }

    pub fn append(&mut self, chunk: Bytes) -> Result<(), AudioError> {
        let result = self.engine.append(chunk);
        self.settle();
        result
    }

    pub fn end(&mut self) -> Result<(), AudioError> {
        let result = self.engine.end(self.backend.as_ref());
        self.settle();
        result
    }

    /// Cancel the active engine, if any, and release it.
    pub fn stop(&mut self, reason: &str) {
        if let ActiveEngine::None = self.engine {
            return;
        }
        log::info!(
            "stopping {:?} engine for turn {:?} ({})",
            self.engine.kind(),
            self.engine.turn(),
            reason
        );
        self.engine.cancel();
        self.engine = ActiveEngine::None;
    }

    /// Dispatch a hardware event. Events from any generation other than the
    /// active engine's are dropped and reported as `Ok(false)`.
    pub fn handle_event(&mut self, event: &EngineEvent) -> Result<bool, AudioError> {
        if self.engine.generation() != Some(event.generation()) {
            log::trace!("dropping stale engine event {:?}", event);
            return Ok(false);
        }
        let result = self.engine.handle_event(event);
        self.settle();
        result.map(|_| true)
    }

    /// Release engines that reached a terminal phase.
    fn settle(&mut self) {
        if self.engine.is_done() {
            log::debug!("{:?} engine done for turn {:?}", self.engine.kind(), self.engine.turn());
            self.engine = ActiveEngine::None;
        }
    }
}

impl TurnScoped for AudioStage {
    fn retire_turn(&mut self, previous: u64, reason: &str) {
        if self.engine.turn().is_some_and(|t| t <= previous) {
            self.stop(reason);
        }
    }

    fn reset(&mut self) {
        self.stop("reset");
    }
}
