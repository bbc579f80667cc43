//! In-memory backend and scheduler for engine and controller tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::backend::{
    AudioBackend, AudioTap, EngineEvent, Generation, MediaClip, MediaSink, PcmGraph, RetryHandle,
    RetryScheduler, SourceId,
};
use crate::error::AudioError;
use crate::protocol::{StreamFormat, mime_essence};

#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub generation: Generation,
    pub source: SourceId,
    pub start: f64,
    pub frames: usize,
    pub channels: usize,
}

#[derive(Default)]
pub struct MockState {
    pub now: f64,
    pub progressive: Vec<String>,
    pub fail_graph: bool,
    pub fail_sink: bool,
    pub fail_clip: bool,
    pub graphs_opened: Vec<(Generation, u32, u16)>,
    pub graphs_closed: usize,
    pub graphs_aborted: usize,
    /// Earliest start a graph accepts; later starts pass through.
    pub write_head: f64,
    pub scheduled: Vec<Scheduled>,
    pub stopped: Vec<SourceId>,
    pub sinks_opened: Vec<(Generation, String)>,
    pub sink_updating: bool,
    pub appended: Vec<Bytes>,
    pub eos: usize,
    pub aborted: usize,
    pub clips: Vec<(Generation, StreamFormat, Vec<u8>)>,
    pub clips_stopped: usize,
    pub tap_samples: Vec<f32>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    pub state: Rc<RefCell<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state.borrow_mut().progressive = vec!["audio/mpeg".to_string(), "audio/opus".to_string()];
        backend
    }

    /// Sources still scheduled (not stopped) for `generation`.
    pub fn live_sources(&self, generation: Generation) -> usize {
        let state = self.state.borrow();
        state
            .scheduled
            .iter()
            .filter(|s| s.generation == generation && !state.stopped.contains(&s.source))
            .count()
    }
}

struct MockTap {
    state: Rc<RefCell<MockState>>,
}

impl AudioTap for MockTap {
    fn time_domain(&self, out: &mut [f32]) -> usize {
        let state = self.state.borrow();
        let n = out.len().min(state.tap_samples.len());
        out[..n].copy_from_slice(&state.tap_samples[..n]);
        n
    }
}

struct MockGraph {
    state: Rc<RefCell<MockState>>,
    generation: Generation,
    closed: bool,
}

impl PcmGraph for MockGraph {
    fn current_time(&self) -> f64 {
        self.state.borrow().now
    }

    fn schedule(&mut self, source: SourceId, planes: Vec<Vec<f32>>, start_time: f64) -> Result<f64, AudioError> {
        if self.closed {
            return Err(AudioError::Closed);
        }
        let mut state = self.state.borrow_mut();
        let start = start_time.max(state.write_head);
        state.scheduled.push(Scheduled {
            generation: self.generation,
            source,
            start,
            frames: planes.first().map(Vec::len).unwrap_or(0),
            channels: planes.len(),
        });
        Ok(start)
    }

    fn stop_source(&mut self, source: SourceId) {
        self.state.borrow_mut().stopped.push(source);
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(MockTap {
            state: self.state.clone(),
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.borrow_mut().graphs_closed += 1;
        }
    }

    fn abort(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.borrow_mut();
            state.graphs_closed += 1;
            state.graphs_aborted += 1;
        }
    }
}

struct MockSink {
    state: Rc<RefCell<MockState>>,
}

impl MediaSink for MockSink {
    fn is_updating(&self) -> bool {
        self.state.borrow().sink_updating
    }

    fn append(&mut self, chunk: Bytes) -> Result<(), AudioError> {
        let mut state = self.state.borrow_mut();
        state.appended.push(chunk);
        state.sink_updating = true;
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.state.borrow_mut().eos += 1;
    }

    fn abort(&mut self) {
        self.state.borrow_mut().aborted += 1;
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(MockTap {
            state: self.state.clone(),
        })
    }
}

struct MockClip {
    state: Rc<RefCell<MockState>>,
}

impl MediaClip for MockClip {
    fn stop(&mut self) {
        self.state.borrow_mut().clips_stopped += 1;
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(MockTap {
            state: self.state.clone(),
        })
    }
}

impl AudioBackend for MockBackend {
    fn supports_progressive(&self, mime: &str) -> bool {
        let essence = mime_essence(mime);
        self.state.borrow().progressive.iter().any(|m| *m == essence)
    }

    fn open_graph(&self, sample_rate: u32, channels: u16, generation: Generation) -> Result<Box<dyn PcmGraph>, AudioError> {
        let mut state = self.state.borrow_mut();
        if state.fail_graph {
            return Err(AudioError::Device("mock graph failure".to_string()));
        }
        state.graphs_opened.push((generation, sample_rate, channels));
        Ok(Box::new(MockGraph {
            state: self.state.clone(),
            generation,
            closed: false,
        }))
    }

    fn open_sink(&self, mime: &str, generation: Generation) -> Result<Box<dyn MediaSink>, AudioError> {
        let mut state = self.state.borrow_mut();
        if state.fail_sink {
            return Err(AudioError::Device("mock sink failure".to_string()));
        }
        state.sinks_opened.push((generation, mime.to_string()));
        state.sink_updating = false;
        Ok(Box::new(MockSink {
            state: self.state.clone(),
        }))
    }

    fn play_clip(&self, format: &StreamFormat, data: Vec<u8>, generation: Generation) -> Result<Box<dyn MediaClip>, AudioError> {
        let mut state = self.state.borrow_mut();
        if state.fail_clip {
            return Err(AudioError::Decode("mock clip failure".to_string()));
        }
        state.clips.push((generation, format.clone(), data));
        Ok(Box::new(MockClip {
            state: self.state.clone(),
        }))
    }
}

/// Collects retries; tests fire them by hand.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    pending: Rc<RefCell<Vec<(Duration, EngineEvent, CancellationToken)>>>,
}

impl ManualScheduler {
    pub fn pending(&self) -> usize {
        self.pending
            .borrow()
            .iter()
            .filter(|(_, _, token)| !token.is_cancelled())
            .count()
    }

    /// Take every retry that has not been cancelled.
    pub fn fire(&self) -> Vec<EngineEvent> {
        self.pending
            .borrow_mut()
            .drain(..)
            .filter(|(_, _, token)| !token.is_cancelled())
            .map(|(_, event, _)| event)
            .collect()
    }
}

impl RetryScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: EngineEvent) -> RetryHandle {
        let token = CancellationToken::new();
        self.pending.borrow_mut().push((delay, event, token.clone()));
        RetryHandle::new(token)
    }
}
