//! Gapless playback of raw interleaved S16LE chunks on a [`PcmGraph`].
//!
//! Each chunk becomes one scheduled source starting exactly where the
//! previous one ends, so consecutive chunks play back-to-back with neither
//! gap nor overlap. When the clock has already passed that point (network
//! underrun) the chunk starts a small epsilon after "now" instead.

use std::rc::Rc;
use std::time::Duration;

use super::backend::{AudioBackend, AudioTap, EngineEvent, Generation, PcmGraph, RetryHandle, RetryScheduler, SourceId};
use super::pcm::deinterleave_s16le;
use super::phase::{PhaseEvent, PlaybackPhase};
use crate::error::AudioError;

/// Initial scheduling offset ahead of the graph clock.
pub const START_LOOKAHEAD: f64 = 0.05;
/// Minimum distance from "now" for a late chunk.
pub const SCHEDULE_EPSILON: f64 = 0.01;
/// Remaining scheduled audio below which the stream counts as finished.
pub const FINISH_THRESHOLD: f64 = 0.03;
pub const FINISH_POLL_DELAY: Duration = Duration::from_millis(50);
pub const MAX_FINISH_POLLS: u32 = 200;

#[derive(Debug, Clone, Copy)]
struct ActiveSource {
    id: SourceId,
    start: f64,
    end: f64,
}

pub struct PcmStreamEngine {
    generation: Generation,
    turn: u64,
    sample_rate: u32,
    channels: u16,
    graph: Option<Box<dyn PcmGraph>>,
    scheduler: Rc<dyn RetryScheduler>,
    phase: PlaybackPhase,
    next_start: f64,
    next_source: SourceId,
    sources: Vec<ActiveSource>,
    finish_retry: Option<RetryHandle>,
    polls: u32,
}

impl PcmStreamEngine {
    pub fn new(generation: Generation, turn: u64, scheduler: Rc<dyn RetryScheduler>) -> Self {
        Self {
            generation,
            turn,
            sample_rate: 0,
            channels: 0,
            graph: None,
            scheduler,
            phase: PlaybackPhase::Idle,
            next_start: 0.0,
            next_source: 0,
            sources: Vec::new(),
            finish_retry: None,
            polls: 0,
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

    /// Time on the graph clock at which the next chunk will start.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn scheduled_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn start(&mut self, backend: &dyn AudioBackend, sample_rate: u32, channels: u16) -> bool {
        self.phase = self.phase.on(PhaseEvent::Start);
        if sample_rate == 0 || channels == 0 {
            log::warn!("pcm engine: invalid format {}Hz/{}ch", sample_rate, channels);
            self.phase = self.phase.on(PhaseEvent::Failed);
            return false;
        }

        match backend.open_graph(sample_rate, channels, self.generation) {
            Ok(graph) => {
                self.sample_rate = sample_rate;
                self.channels = channels;
                self.next_start = graph.current_time() + START_LOOKAHEAD;
                self.graph = Some(graph);
                self.phase = self.phase.on(PhaseEvent::Started);
                log::info!(
                    "pcm engine started: gen={} turn={} {}Hz/{}ch",
                    self.generation,
                    self.turn,
                    sample_rate,
                    channels
                );
                true
            }
            Err(e) => {
                log::error!("pcm engine: failed to open graph: {}", e);
                self.phase = self.phase.on(PhaseEvent::Failed);
                false
            }
        }
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<(), AudioError> {
        if self.phase != PlaybackPhase::Playing {
            log::debug!("pcm engine: chunk dropped in {:?}", self.phase);
            return Ok(());
        }
        let Some(graph) = self.graph.as_mut() else {
            return Ok(());
        };
        let Some(planes) = deinterleave_s16le(chunk, usize::from(self.channels)) else {
            log::debug!(
                "pcm engine: dropping {} byte chunk (less than one {}ch frame)",
                chunk.len(),
                self.channels
            );
            return Ok(());
        };

        let frames = planes[0].len();
        let duration = frames as f64 / f64::from(self.sample_rate);
        let now = graph.current_time();
        let start = self.next_start.max(now + SCHEDULE_EPSILON);

        let id = self.next_source;
        self.next_source += 1;
        let start = graph.schedule(id, planes, start)?;

        self.sources.push(ActiveSource {
            id,
            start,
            end: start + duration,
        });
        self.next_start = start + duration;
        Ok(())
    }

    /// Completion callback of one scheduled source.
    pub fn on_source_ended(&mut self, source: SourceId) {
        self.sources.retain(|s| s.id != source);
        self.check_finish();
    }

    pub fn end(&mut self) {
        self.phase = self.phase.on(PhaseEvent::EndRequested);
        self.check_finish();
    }

    pub fn on_retry(&mut self) {
        self.finish_retry = None;
        self.check_finish();
    }

    /// Declares the stream finished once nothing meaningful is left to
    /// play; otherwise re-arms a bounded poll. Returns `true` on finish.
    fn check_finish(&mut self) -> bool {
        if self.phase != PlaybackPhase::Ending {
            return false;
        }
        let now = self.graph.as_ref().map(|g| g.current_time()).unwrap_or(self.next_start);
        let remaining = self.next_start - now;

        if self.sources.is_empty() || remaining < FINISH_THRESHOLD || self.polls >= MAX_FINISH_POLLS {
            if self.polls >= MAX_FINISH_POLLS {
                log::warn!("pcm engine: forcing finish after {} polls", self.polls);
            }
            self.finish();
            return true;
        }

        self.polls += 1;
        self.finish_retry = Some(self.scheduler.schedule(
            FINISH_POLL_DELAY,
            EngineEvent::Retry {
                generation: self.generation,
            },
        ));
        false
    }

    fn finish(&mut self) {
        self.finish_retry = None;
        self.sources.clear();
        if let Some(mut graph) = self.graph.take() {
            graph.close();
        }
        self.phase = self.phase.on(PhaseEvent::Drained);
        log::info!("pcm engine finished: gen={} turn={}", self.generation, self.turn);
    }

    /// Stop and disconnect every scheduled source and release the graph.
    pub fn cancel(&mut self) {
        self.finish_retry = None;
        if let Some(mut graph) = self.graph.take() {
            for source in self.sources.drain(..) {
                graph.stop_source(source.id);
            }
            graph.abort();
        }
        self.sources.clear();
        self.phase = self.phase.on(PhaseEvent::Cancel);
    }

    pub fn tap(&self) -> Option<Rc<dyn AudioTap>> {
        self.graph.as_ref().map(|g| g.tap())
    }

    /// `(start, end)` of every source still scheduled.
    pub fn schedule_windows(&self) -> Vec<(f64, f64)> {
        self.sources.iter().map(|s| (s.start, s.end)).collect()
    }
}
