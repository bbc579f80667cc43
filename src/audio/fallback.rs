//! Buffer-everything playback for streams no progressive engine can take.

use std::rc::Rc;

use bytes::Bytes;

use super::backend::{AudioBackend, AudioTap, Generation, MediaClip};
use super::phase::{PhaseEvent, PlaybackPhase};
use crate::error::AudioError;
use crate::protocol::StreamFormat;

pub struct BufferedFallbackPlayer {
    generation: Generation,
    turn: u64,
    format: StreamFormat,
    chunks: Vec<Bytes>,
    clip: Option<Box<dyn MediaClip>>,
    phase: PlaybackPhase,
}

impl BufferedFallbackPlayer {
    pub fn new(generation: Generation, turn: u64, format: StreamFormat) -> Self {
        log::info!("fallback player buffering: gen={} turn={} format={:?}", generation, turn, format);
        Self {
            generation,
            turn,
            format,
            chunks: Vec::new(),
            clip: None,
            phase: PlaybackPhase::Idle,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn buffered_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn append(&mut self, chunk: Bytes) {
        if self.phase != PlaybackPhase::Idle {
            log::debug!("fallback player: chunk dropped in {:?}", self.phase);
            return;
        }
        self.chunks.push(chunk);
    }

    /// All buffered chunks, in arrival order, as one contiguous buffer.
    pub fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.buffered_bytes());
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        data
    }

    /// Hand the assembled clip to the backend. An empty buffer finishes
    /// without touching the output.
    pub fn end(&mut self, backend: &dyn AudioBackend) -> Result<(), AudioError> {
        if self.phase != PlaybackPhase::Idle {
            return Ok(());
        }
        if self.chunks.is_empty() {
            log::info!("fallback player: nothing buffered for turn {}", self.turn);
            self.phase = self.phase.on(PhaseEvent::Cancel);
            return Ok(());
        }

        let data = self.assemble();
        self.chunks.clear();
        self.phase = self.phase.on(PhaseEvent::Start);
        log::info!(
            "fallback player: playing {} bytes for turn {}",
            data.len(),
            self.turn
        );
        match backend.play_clip(&self.format, data, self.generation) {
            Ok(clip) => {
                self.clip = Some(clip);
                self.phase = self.phase.on(PhaseEvent::Started).on(PhaseEvent::EndRequested);
                Ok(())
            }
            Err(e) => {
                self.phase = self.phase.on(PhaseEvent::Failed);
                Err(e)
            }
        }
    }

    pub fn on_output_ended(&mut self) {
        self.clip = None;
        self.phase = self.phase.on(PhaseEvent::Drained);
    }

    pub fn cancel(&mut self) {
        self.chunks.clear();
        if let Some(mut clip) = self.clip.take() {
            clip.stop();
        }
        self.phase = self.phase.on(PhaseEvent::Cancel);
    }

    pub fn tap(&self) -> Option<Rc<dyn AudioTap>> {
        self.clip.as_ref().map(|c| c.tap())
    }
}
