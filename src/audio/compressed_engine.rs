//! Progressive playback of an encoded stream (mp3, opus) through a
//! [`MediaSink`]. Chunks queue while the sink is busy; each ready signal
//! pushes at most one more.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use super::backend::{AudioBackend, AudioTap, EngineEvent, Generation, MediaSink, RetryHandle, RetryScheduler};
use super::phase::{PhaseEvent, PlaybackPhase};
use crate::error::AudioError;

pub const END_POLL_DELAY: Duration = Duration::from_millis(50);
pub const MAX_END_POLLS: u32 = 200;

pub struct CompressedStreamEngine {
    generation: Generation,
    turn: u64,
    mime: String,
    sink: Option<Box<dyn MediaSink>>,
    queue: VecDeque<Bytes>,
    scheduler: Rc<dyn RetryScheduler>,
    phase: PlaybackPhase,
    end_retry: Option<RetryHandle>,
    polls: u32,
    eos_sent: bool,
}

impl CompressedStreamEngine {
    pub fn new(generation: Generation, turn: u64, scheduler: Rc<dyn RetryScheduler>) -> Self {
        Self {
            generation,
            turn,
            mime: String::new(),
            sink: None,
            queue: VecDeque::new(),
            scheduler,
            phase: PlaybackPhase::Idle,
            end_retry: None,
            polls: 0,
            eos_sent: false,
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

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Returns `false` if `mime` cannot be played progressively or the sink
    /// could not be opened; the caller then falls back to buffering.
    pub fn start(&mut self, backend: &dyn AudioBackend, mime: &str) -> bool {
        if !backend.supports_progressive(mime) {
            log::info!("compressed engine: {} not progressive", mime);
            return false;
        }
        self.phase = self.phase.on(PhaseEvent::Start);
        match backend.open_sink(mime, self.generation) {
            Ok(sink) => {
                self.mime = mime.to_string();
                self.sink = Some(sink);
                self.phase = self.phase.on(PhaseEvent::Started);
                log::info!(
                    "compressed engine started: gen={} turn={} mime={}",
                    self.generation,
                    self.turn,
                    mime
                );
                true
            }
            Err(e) => {
                log::error!("compressed engine: failed to open sink for {}: {}", mime, e);
                self.phase = self.phase.on(PhaseEvent::Failed);
                false
            }
        }
    }

    pub fn append(&mut self, chunk: Bytes) -> Result<(), AudioError> {
        if self.phase != PlaybackPhase::Playing {
            log::debug!("compressed engine: chunk dropped in {:?}", self.phase);
            return Ok(());
        }
        self.queue.push_back(chunk);
        self.drain()
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        if sink.is_updating() {
            return Ok(());
        }
        if let Some(chunk) = self.queue.pop_front() {
            sink.append(chunk)?;
        }
        Ok(())
    }

    pub fn on_sink_ready(&mut self) -> Result<(), AudioError> {
        self.drain()?;
        if self.phase == PlaybackPhase::Ending {
            self.try_end();
        }
        Ok(())
    }

    pub fn end(&mut self) {
        self.phase = self.phase.on(PhaseEvent::EndRequested);
        if self.phase == PlaybackPhase::Ending {
            self.try_end();
        }
    }

    pub fn on_retry(&mut self) -> Result<(), AudioError> {
        self.end_retry = None;
        self.on_sink_ready()
    }

    /// Signals end-of-stream once the queue is empty and the sink idle,
    /// otherwise retries after a short delay.
    fn try_end(&mut self) {
        if self.eos_sent {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        let quiescent = self.queue.is_empty() && !sink.is_updating();
        if quiescent || self.polls >= MAX_END_POLLS {
            if !quiescent {
                log::warn!(
                    "compressed engine: {} chunks still queued after {} polls, ending anyway",
                    self.queue.len(),
                    self.polls
                );
                self.queue.clear();
            }
            sink.end_of_stream();
            self.eos_sent = true;
            self.end_retry = None;
            return;
        }

        self.polls += 1;
        self.end_retry = Some(self.scheduler.schedule(
            END_POLL_DELAY,
            EngineEvent::Retry {
                generation: self.generation,
            },
        ));
    }

    /// The media element played its last sample.
    pub fn on_output_ended(&mut self) {
        if self.phase != PlaybackPhase::Ending || !self.eos_sent {
            log::debug!("compressed engine: early output end in {:?}", self.phase);
            return;
        }
        self.sink = None;
        self.phase = self.phase.on(PhaseEvent::Drained);
        log::info!("compressed engine finished: gen={} turn={}", self.generation, self.turn);
    }

    pub fn cancel(&mut self) {
        self.end_retry = None;
        self.queue.clear();
        if let Some(mut sink) = self.sink.take() {
            sink.abort();
        }
        self.phase = self.phase.on(PhaseEvent::Cancel);
    }

    pub fn tap(&self) -> Option<Rc<dyn AudioTap>> {
        self.sink.as_ref().map(|s| s.tap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{ManualScheduler, MockBackend};

    fn started(backend: &MockBackend, scheduler: &ManualScheduler) -> CompressedStreamEngine {
        let mut engine = CompressedStreamEngine::new(4, 2, Rc::new(scheduler.clone()));
        assert!(engine.start(backend, "audio/mpeg"));
        engine
    }

    #[test]
    fn test_one_append_per_ready_signal() {
        let backend = MockBackend::new();
        let scheduler = ManualScheduler::default();
        let mut engine = started(&backend, &scheduler);

        for i in 0..3u8 {
            engine.append(Bytes::from(vec![i; 4])).unwrap();
        }
        assert_eq!(backend.state.borrow().appended.len(), 1);
        assert_eq!(engine.queued(), 2);

        backend.state.borrow_mut().sink_updating = false;
        engine.on_sink_ready().unwrap();
        assert_eq!(backend.state.borrow().appended.len(), 2);

        backend.state.borrow_mut().sink_updating = false;
        engine.on_sink_ready().unwrap();
        let state = backend.state.borrow();
        assert_eq!(state.appended.len(), 3);
        assert_eq!(state.appended[2], Bytes::from(vec![2u8; 4]));
    }

    #[test]
    fn test_end_waits_for_queue_then_signals_eos() {
        let backend = MockBackend::new();
        let scheduler = ManualScheduler::default();
        let mut engine = started(&backend, &scheduler);
        engine.append(Bytes::from_static(b"aa")).unwrap();
        engine.append(Bytes::from_static(b"bb")).unwrap();

        engine.end();
        assert_eq!(backend.state.borrow().eos, 0);
        assert_eq!(scheduler.pending(), 1);

        backend.state.borrow_mut().sink_updating = false;
        engine.on_sink_ready().unwrap();
        // "bb" was just appended, sink busy again
        assert_eq!(backend.state.borrow().eos, 0);

        backend.state.borrow_mut().sink_updating = false;
        engine.on_sink_ready().unwrap();
        assert_eq!(backend.state.borrow().eos, 1);
        assert_eq!(scheduler.pending(), 0);

        engine.on_output_ended();
        assert_eq!(engine.phase(), PlaybackPhase::Finished);
    }

    #[test]
    fn test_end_polling_is_bounded() {
        let backend = MockBackend::new();
        let scheduler = ManualScheduler::default();
        let mut engine = started(&backend, &scheduler);
        engine.append(Bytes::from_static(b"stuck")).unwrap();
        engine.end();
        for _ in 0..MAX_END_POLLS {
            assert_eq!(scheduler.fire().len(), 1);
            engine.on_retry().unwrap();
        }
        assert_eq!(backend.state.borrow().eos, 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_aborts_and_ignores_late_data() {
        let backend = MockBackend::new();
        let scheduler = ManualScheduler::default();
        let mut engine = started(&backend, &scheduler);
        engine.append(Bytes::from_static(b"x")).unwrap();
        engine.append(Bytes::from_static(b"y")).unwrap();
        engine.cancel();
        assert_eq!(engine.phase(), PlaybackPhase::Cancelled);
        assert_eq!(engine.queued(), 0);
        assert_eq!(backend.state.borrow().aborted, 1);

        engine.append(Bytes::from_static(b"z")).unwrap();
        engine.on_sink_ready().unwrap();
        assert_eq!(backend.state.borrow().appended.len(), 1);
    }

    #[test]
    fn test_unsupported_mime_declines() {
        let backend = MockBackend::new();
        let mut engine = CompressedStreamEngine::new(1, 1, Rc::new(ManualScheduler::default()));
        assert!(!engine.start(&backend, "audio/aac"));
        assert_eq!(engine.phase(), PlaybackPhase::Idle);
        assert!(backend.state.borrow().sinks_opened.is_empty());
    }
}
