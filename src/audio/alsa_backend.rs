//! ALSA implementation of [`AudioBackend`].
//!
//! Every output (PCM graph, progressive sink, one-shot clip) owns its own
//! playback device on a dedicated OS thread, not a tokio task, so blocking
//! `writei` calls never stall the event loop. The thread opens the device
//! and decodes clips itself; the caller only spawns it. Progress and
//! failures are reported back as generation-tagged [`EngineEvent`]s.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use alsa::pcm::PCM;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::alsa_device::{self, AlsaParams, AlsaWriter, FrameWriter};
use super::backend::{AudioBackend, AudioTap, EngineEvent, Generation, MediaClip, MediaSink, PcmGraph, SourceId};
use super::clip::decode_clip;
use super::pcm::{ChunkPlacer, convert_channels, planes_from_interleaved, resample_to};
use super::stream_decoder::{ChunkReader, create_decoder, is_progressive};
use super::timeline::{Timeline, downmix, to_i16};
use crate::error::AudioError;
use crate::protocol::StreamFormat;

/// Element outputs (sinks and clips) always play stereo.
const ELEMENT_CHANNELS: u32 = 2;
const DEFAULT_PERIOD: usize = 1024;

#[derive(Debug, Clone)]
pub struct AlsaBackendConfig {
    /// ALSA playback device name (e.g. "default", "plughw:0,0")
    pub device: String,
    /// Desired period size in frames (0 = let ALSA decide)
    pub period_size: usize,
    /// Rate the element outputs are opened at
    pub element_sample_rate: u32,
    /// Samples kept for the amplitude tap
    pub tap_window: usize,
}

impl Default for AlsaBackendConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            period_size: DEFAULT_PERIOD,
            element_sample_rate: 48000,
            tap_window: 1024,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicked render thread leaves plain sample data behind, still usable
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ring of the most recent mono samples written to a device.
struct TapRing {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl TapRing {
    fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    fn push(&self, mono: impl Iterator<Item = f32>) {
        let mut samples = lock(&self.samples);
        for s in mono {
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(s);
        }
    }
}

struct SharedTap(Arc<TapRing>);

impl AudioTap for SharedTap {
    fn time_domain(&self, out: &mut [f32]) -> usize {
        let samples = lock(&self.0.samples);
        let n = out.len().min(samples.len());
        let skip = samples.len() - n;
        for (dst, src) in out.iter_mut().zip(samples.iter().skip(skip)) {
            *dst = *src;
        }
        n
    }
}

pub struct AlsaBackend {
    config: AlsaBackendConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl AlsaBackend {
    pub fn new(config: AlsaBackendConfig, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        log::info!(
            "ALSA backend: device={}, period={}, element_rate={}",
            config.device,
            config.period_size,
            config.element_sample_rate
        );
        Self { config, events }
    }

    fn target(&self, rate: u32, channels: u32) -> OutputTarget {
        OutputTarget {
            device: self.config.device.clone(),
            rate,
            channels,
            period: (self.config.period_size > 0).then_some(self.config.period_size),
        }
    }
}

/// Device settings an output thread opens its PCM with.
#[derive(Debug, Clone)]
struct OutputTarget {
    device: String,
    rate: u32,
    channels: u32,
    period: Option<usize>,
}

impl OutputTarget {
    fn open(&self) -> Result<(PCM, AlsaParams), AudioError> {
        alsa_device::open_playback(&self.device, self.rate, self.channels, self.period)
    }
}

/// Spawn a named output thread running `body`. Its result is reported as
/// `OutputEnded` (`Ok(true)`) or `PlaybackFailed`; returns as soon as the
/// thread is started.
fn spawn_output<F>(
    name: &str,
    events: mpsc::UnboundedSender<EngineEvent>,
    generation: Generation,
    body: F,
) -> Result<(), AudioError>
where
    F: FnOnce() -> Result<bool, AudioError> + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let result = body();
            report(&events, generation, result);
        })
        .map(|_| ())
        .map_err(|e| AudioError::Device(format!("failed to spawn {}: {}", name, e)))
}

fn report(events: &mpsc::UnboundedSender<EngineEvent>, generation: Generation, result: Result<bool, AudioError>) {
    let event = match result {
        Ok(true) => EngineEvent::OutputEnded { generation },
        Ok(false) => return,
        Err(e) => {
            log::error!("playback failed: gen={} {}", generation, e);
            EngineEvent::PlaybackFailed {
                generation,
                reason: e.to_string(),
            }
        }
    };
    let _ = events.send(event);
}

// ======================== PCM graph ========================

enum GraphCommand {
    Schedule {
        source: SourceId,
        planes: Vec<Vec<f32>>,
        start: f64,
    },
    Stop(SourceId),
    /// Play out what is scheduled, then drain the device.
    Close,
}

/// Clock state the render thread publishes for the graph handle.
#[derive(Default)]
struct GraphShared {
    aborted: AtomicBool,
    /// Audible position in seconds, as `f64` bits.
    clock: AtomicU64,
    /// Write head in seconds, as `f64` bits.
    head: AtomicU64,
}

impl GraphShared {
    fn clock(&self) -> f64 {
        f64::from_bits(self.clock.load(Ordering::Acquire))
    }

    fn head(&self) -> f64 {
        f64::from_bits(self.head.load(Ordering::Acquire))
    }

    fn publish(&self, written: u64, delay: u64, rate: u32) {
        let rate = f64::from(rate.max(1));
        self.head.store((written as f64 / rate).to_bits(), Ordering::Release);
        self.clock
            .store((written.saturating_sub(delay) as f64 / rate).to_bits(), Ordering::Release);
    }
}

/// Render side of an [`AlsaGraph`], owned by its output thread.
struct GraphRenderer {
    requested_rate: u32,
    shared: Arc<GraphShared>,
    commands: mpsc::UnboundedReceiver<GraphCommand>,
    tap: Arc<TapRing>,
    events: mpsc::UnboundedSender<EngineEvent>,
    generation: Generation,
}

impl GraphRenderer {
    /// Render one period at a time until closed or aborted. A write the
    /// device keeps rejecting ends the loop with an error, and no source
    /// is reported as ended after that.
    fn run<W: FrameWriter>(mut self, writer: &W, params: &AlsaParams) -> Result<bool, AudioError> {
        let channels = (params.channels as usize).max(1);
        let device_rate = params.sample_rate.max(1);
        let ratio = f64::from(device_rate) / f64::from(self.requested_rate.max(1));
        let period = params.period_size.max(64);
        let mut timeline = Timeline::new(channels);
        let mut placer = ChunkPlacer::default();
        let mut mix = vec![0.0f32; period * channels];
        let mut closing = false;

        loop {
            while !closing {
                match self.commands.try_recv() {
                    Ok(GraphCommand::Schedule { source, planes, start }) => {
                        let frames = planes.first().map_or(0, Vec::len);
                        let (first, len) =
                            placer.place(start * f64::from(device_rate), frames, ratio, timeline.position());
                        let planes = planes.iter().map(|p| resample_to(p, 1.0 / ratio, len)).collect();
                        timeline.schedule(source, convert_channels(planes, channels), first);
                    }
                    Ok(GraphCommand::Stop(source)) => {
                        timeline.stop(source);
                    }
                    Ok(GraphCommand::Close) | Err(TryRecvError::Disconnected) => closing = true,
                    Err(TryRecvError::Empty) => break,
                }
            }

            if self.shared.aborted.load(Ordering::Acquire) {
                if let Err(e) = writer.discard() {
                    log::warn!("ALSA drop error: {}", e);
                }
                log::debug!("graph aborted: gen={}", self.generation);
                return Ok(false);
            }
            if closing && timeline.position() >= timeline.horizon() {
                if let Err(e) = writer.drain() {
                    log::warn!("ALSA drain error: {}", e);
                }
                log::debug!("graph drained: gen={}", self.generation);
                return Ok(false);
            }

            let finished = timeline.render(period, &mut mix);
            alsa_device::write_interleaved(writer, &to_i16(&mix), channels)?;
            self.tap.push(downmix(&mix, channels));
            self.shared.publish(timeline.position(), writer.delay(), device_rate);
            for source in finished {
                let event = EngineEvent::SourceEnded {
                    generation: self.generation,
                    source,
                };
                if self.events.send(event).is_err() {
                    return Ok(false);
                }
            }
        }
    }
}

pub struct AlsaGraph {
    commands: mpsc::UnboundedSender<GraphCommand>,
    shared: Arc<GraphShared>,
    tap: Arc<TapRing>,
    closed: bool,
}

impl PcmGraph for AlsaGraph {
    fn current_time(&self) -> f64 {
        self.shared.clock()
    }

    fn schedule(&mut self, source: SourceId, planes: Vec<Vec<f32>>, start_time: f64) -> Result<f64, AudioError> {
        if self.closed {
            return Err(AudioError::Closed);
        }
        let start = start_time.max(self.shared.head());
        self.commands
            .send(GraphCommand::Schedule { source, planes, start })
            .map_err(|_| AudioError::Closed)?;
        Ok(start)
    }

    fn stop_source(&mut self, source: SourceId) {
        let _ = self.commands.send(GraphCommand::Stop(source));
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(SharedTap(self.tap.clone()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.commands.send(GraphCommand::Close);
        }
    }

    fn abort(&mut self) {
        self.closed = true;
        self.shared.aborted.store(true, Ordering::Release);
    }
}

impl Drop for AlsaGraph {
    fn drop(&mut self) {
        if !self.closed {
            self.abort();
        }
    }
}

// ======================== Element output ========================

/// Back-to-back playback of decoded blocks on a stereo device. Only whole
/// periods are written until `flush`, so a slow decoder never causes
/// silence to be inserted mid-stream.
struct ElementOutput<W: FrameWriter> {
    writer: W,
    params: AlsaParams,
    timeline: Timeline,
    placer: ChunkPlacer,
    tap: Arc<TapRing>,
    next_id: SourceId,
    mix: Vec<f32>,
}

impl<W: FrameWriter> ElementOutput<W> {
    fn new(writer: W, params: AlsaParams, tap: Arc<TapRing>) -> Self {
        let channels = params.channels as usize;
        let period = params.period_size.max(64);
        Self {
            writer,
            timeline: Timeline::new(channels),
            placer: ChunkPlacer::default(),
            mix: vec![0.0; period * channels.max(1)],
            params,
            tap,
            next_id: 0,
        }
    }

    fn period(&self) -> usize {
        self.params.period_size.max(64)
    }

    fn feed(&mut self, planes: Vec<Vec<f32>>, source_rate: u32) {
        let frames = planes.first().map_or(0, Vec::len);
        let ratio = f64::from(self.params.sample_rate) / f64::from(source_rate.max(1));
        let (first, len) = self.placer.append(frames, ratio, self.timeline.position());
        let planes = planes.iter().map(|p| resample_to(p, 1.0 / ratio, len)).collect();
        let planes = convert_channels(planes, self.params.channels as usize);
        self.timeline.schedule(self.next_id, planes, first);
        self.next_id += 1;
    }

    /// Write whatever is ready. Returns `Ok(false)` if `stop` was raised.
    fn pump(&mut self, flush: bool, stop: &AtomicBool) -> Result<bool, AudioError> {
        let channels = self.params.channels as usize;
        let period = self.period();
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let available = (self.timeline.horizon() - self.timeline.position()) as usize;
            if available == 0 || (!flush && available < period) {
                return Ok(true);
            }
            let frames = available.min(period);
            let mix = &mut self.mix[..frames * channels];
            self.timeline.render(frames, mix);
            alsa_device::write_interleaved(&self.writer, &to_i16(mix), channels)?;
            self.tap.push(downmix(mix, channels));
        }
    }

    fn finish(&self, stopped: bool) {
        let result = if stopped { self.writer.discard() } else { self.writer.drain() };
        if let Err(e) = result {
            log::warn!("ALSA finish error: {}", e);
        }
    }
}

// ======================== Progressive sink ========================

pub struct AlsaSink {
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
    updating: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    tap: Arc<TapRing>,
}

fn run_sink<W: FrameWriter>(
    mut output: ElementOutput<W>,
    mime: &str,
    reader: ChunkReader,
    stop: &AtomicBool,
) -> Result<bool, AudioError> {
    let mut decoder = create_decoder(mime, reader)?;

    while !stop.load(Ordering::Relaxed) {
        match decoder.next_frame()? {
            Some(frame) => {
                let planes = planes_from_interleaved(&frame.samples, frame.channels);
                output.feed(planes, frame.sample_rate);
                if !output.pump(false, stop)? {
                    break;
                }
            }
            None => {
                let completed = output.pump(true, stop)?;
                output.finish(!completed);
                return Ok(completed);
            }
        }
    }
    output.finish(true);
    Ok(false)
}

impl MediaSink for AlsaSink {
    fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    fn append(&mut self, chunk: Bytes) -> Result<(), AudioError> {
        let Some(chunks) = self.chunks.as_ref() else {
            return Err(AudioError::Closed);
        };
        self.updating.store(true, Ordering::SeqCst);
        chunks.send(chunk).map_err(|_| {
            self.updating.store(false, Ordering::SeqCst);
            AudioError::Closed
        })
    }

    fn end_of_stream(&mut self) {
        // closing the channel ends the decoder's input
        self.chunks.take();
    }

    fn abort(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.chunks.take();
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(SharedTap(self.tap.clone()))
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        if self.chunks.is_some() {
            self.abort();
        }
    }
}

// ======================== One-shot clip ========================

pub struct AlsaClip {
    stop: Arc<AtomicBool>,
    tap: Arc<TapRing>,
}

impl MediaClip for AlsaClip {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn tap(&self) -> Rc<dyn AudioTap> {
        Rc::new(SharedTap(self.tap.clone()))
    }
}

impl AudioBackend for AlsaBackend {
    fn supports_progressive(&self, mime: &str) -> bool {
        is_progressive(mime)
    }

    fn open_graph(&self, sample_rate: u32, channels: u16, generation: Generation) -> Result<Box<dyn PcmGraph>, AudioError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(GraphShared::default());
        let tap = TapRing::new(self.config.tap_window);
        let renderer = GraphRenderer {
            requested_rate: sample_rate,
            shared: shared.clone(),
            commands: rx,
            tap: tap.clone(),
            events: self.events.clone(),
            generation,
        };

        let target = self.target(sample_rate, u32::from(channels));
        spawn_output("audio-graph", self.events.clone(), generation, move || {
            let (pcm, params) = target.open()?;
            renderer.run(&AlsaWriter::new(&pcm)?, &params)
        })?;

        Ok(Box::new(AlsaGraph {
            commands,
            shared,
            tap,
            closed: false,
        }))
    }

    fn open_sink(&self, mime: &str, generation: Generation) -> Result<Box<dyn MediaSink>, AudioError> {
        if !is_progressive(mime) {
            return Err(AudioError::Unsupported(mime.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let updating = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let tap = TapRing::new(self.config.tap_window);

        let reader = {
            let updating = updating.clone();
            let events = self.events.clone();
            ChunkReader::new(
                rx,
                Box::new(move || {
                    updating.store(false, Ordering::SeqCst);
                    let _ = events.send(EngineEvent::SinkReady { generation });
                }),
            )
        };

        {
            let stop = stop.clone();
            let tap = tap.clone();
            let mime = mime.to_string();
            let target = self.target(self.config.element_sample_rate, ELEMENT_CHANNELS);
            spawn_output("audio-sink", self.events.clone(), generation, move || {
                let (pcm, params) = target.open()?;
                let output = ElementOutput::new(AlsaWriter::new(&pcm)?, params, tap);
                run_sink(output, &mime, reader, &stop)
            })?;
        }

        Ok(Box::new(AlsaSink {
            chunks: Some(tx),
            updating,
            stop,
            tap,
        }))
    }

    fn play_clip(&self, format: &StreamFormat, data: Vec<u8>, generation: Generation) -> Result<Box<dyn MediaClip>, AudioError> {
        let stop = Arc::new(AtomicBool::new(false));
        let tap = TapRing::new(self.config.tap_window);

        {
            let stop = stop.clone();
            let tap = tap.clone();
            let format = format.clone();
            let target = self.target(self.config.element_sample_rate, ELEMENT_CHANNELS);
            spawn_output("audio-clip", self.events.clone(), generation, move || {
                let clip = decode_clip(&format, &data)?;
                log::info!(
                    "clip decoded: {} frames @ {}Hz, {}ch",
                    clip.frames(),
                    clip.sample_rate,
                    clip.planes.len()
                );
                if stop.load(Ordering::Relaxed) {
                    return Ok(false);
                }
                let (pcm, params) = target.open()?;
                let mut output = ElementOutput::new(AlsaWriter::new(&pcm)?, params, tap);
                output.feed(clip.planes, clip.sample_rate);
                let completed = output.pump(true, &stop)?;
                output.finish(!completed);
                Ok(completed)
            })?;
        }

        Ok(Box::new(AlsaClip { stop, tap }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::alsa_device::tests::ScriptedWriter;

    fn params(rate: u32, channels: u32) -> AlsaParams {
        AlsaParams {
            sample_rate: rate,
            channels,
            period_size: 64,
        }
    }

    fn renderer(
        requested_rate: u32,
    ) -> (
        GraphRenderer,
        mpsc::UnboundedSender<GraphCommand>,
        Arc<GraphShared>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(GraphShared::default());
        let renderer = GraphRenderer {
            requested_rate,
            shared: shared.clone(),
            commands: rx,
            tap: TapRing::new(16),
            events,
            generation: 4,
        };
        (renderer, commands, shared, events_rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_tap_ring_keeps_latest_window() {
        let ring = TapRing::new(4);
        ring.push([1.0, 2.0, 3.0].into_iter());
        ring.push([4.0, 5.0].into_iter());
        let tap = SharedTap(ring);

        let mut out = [0.0f32; 4];
        assert_eq!(tap.time_domain(&mut out), 4);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);

        let mut short = [0.0f32; 2];
        assert_eq!(tap.time_domain(&mut short), 2);
        assert_eq!(short, [4.0, 5.0]);
    }

    #[test]
    fn test_backend_capabilities() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = AlsaBackend::new(AlsaBackendConfig::default(), tx);
        assert!(backend.supports_progressive("audio/mpeg"));
        assert!(!backend.supports_progressive("audio/aac"));
        assert!(matches!(
            backend.open_sink("audio/aac", 1),
            Err(AudioError::Unsupported(_))
        ));
    }

    #[test]
    fn test_clip_decodes_on_its_thread() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = AlsaBackend::new(AlsaBackendConfig::default(), tx);
        let format = StreamFormat::Encoded {
            mime: Some("audio/ogg".to_string()),
        };
        // returns before the data is looked at; the decode error arrives as an event
        assert!(backend.play_clip(&format, b"OggS\0\0\0\0".to_vec(), 3).is_ok());
        assert!(matches!(
            rx.blocking_recv(),
            Some(EngineEvent::PlaybackFailed { generation: 3, .. })
        ));
    }

    #[test]
    fn test_rejected_writes_fail_the_graph() {
        let (renderer, commands, _shared, mut events) = renderer(8000);
        commands
            .send(GraphCommand::Schedule {
                source: 0,
                planes: vec![vec![0.5; 32]],
                start: 0.0,
            })
            .unwrap();
        let writer = ScriptedWriter {
            channels: 2,
            ..Default::default()
        };
        writer.fail_writes.set(u32::MAX);

        let thread_events = renderer.events.clone();
        let result = renderer.run(&writer, &params(8000, 2));
        assert!(matches!(result, Err(AudioError::Device(_))));
        report(&thread_events, 4, result);
        // the source never played, so only the failure is reported
        let events = drain_events(&mut events);
        assert!(matches!(&events[..], [EngineEvent::PlaybackFailed { generation: 4, .. }]));
    }

    #[test]
    fn test_failure_is_reported_for_the_generation() {
        let (events, mut rx) = mpsc::unbounded_channel();
        report(&events, 9, Err(AudioError::Device("gone".to_string())));
        report(&events, 9, Ok(false));
        report(&events, 9, Ok(true));
        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[..],
            [EngineEvent::PlaybackFailed { generation: 9, .. }, EngineEvent::OutputEnded { generation: 9 }]
        ));
    }

    #[test]
    fn test_close_plays_out_then_drains() {
        let (renderer, commands, shared, mut events) = renderer(8000);
        commands
            .send(GraphCommand::Schedule {
                source: 1,
                planes: vec![vec![0.25; 100]],
                start: 0.0,
            })
            .unwrap();
        commands.send(GraphCommand::Close).unwrap();
        let writer = ScriptedWriter {
            channels: 2,
            latency: 32,
            ..Default::default()
        };

        assert!(!renderer.run(&writer, &params(8000, 2)).unwrap());
        assert!(writer.drained.get());
        assert!(!writer.discarded.get());
        // two whole periods of stereo
        let written = writer.written.borrow();
        assert_eq!(written.len(), 256);
        assert_eq!(written[0], to_i16(&[0.25])[0]);
        assert_eq!(written[199], to_i16(&[0.25])[0]);
        assert_eq!(written[200], 0);
        assert_eq!(
            drain_events(&mut events),
            vec![EngineEvent::SourceEnded { generation: 4, source: 1 }]
        );
        // the clock trails the write head by the device delay
        assert!((shared.head() - 128.0 / 8000.0).abs() < 1e-12);
        assert!((shared.clock() - 96.0 / 8000.0).abs() < 1e-12);
    }

    #[test]
    fn test_abort_discards_without_writing() {
        let (renderer, commands, shared, mut events) = renderer(8000);
        commands
            .send(GraphCommand::Schedule {
                source: 1,
                planes: vec![vec![0.25; 1000]],
                start: 0.0,
            })
            .unwrap();
        shared.aborted.store(true, Ordering::SeqCst);
        let writer = ScriptedWriter {
            channels: 1,
            ..Default::default()
        };

        assert!(!renderer.run(&writer, &params(8000, 1)).unwrap());
        assert!(writer.discarded.get());
        assert!(!writer.drained.get());
        assert!(writer.written.borrow().is_empty());
        assert!(drain_events(&mut events).is_empty());
    }

    #[test]
    fn test_resampled_chunks_have_no_gap() {
        let (renderer, commands, _shared, mut events) = renderer(24000);
        // 3 chunks of 10ms at 24kHz on a 44.1kHz device
        for source in 0..3u64 {
            commands
                .send(GraphCommand::Schedule {
                    source,
                    planes: vec![vec![0.5; 240]],
                    start: source as f64 * 0.01,
                })
                .unwrap();
        }
        commands.send(GraphCommand::Close).unwrap();
        let writer = ScriptedWriter {
            channels: 1,
            ..Default::default()
        };

        renderer.run(&writer, &params(44100, 1)).unwrap();
        let written = writer.written.borrow();
        let level = to_i16(&[0.5])[0];
        // 3 * 441 frames, all at full level
        assert!(written[..1323].iter().all(|s| *s == level));
        assert!(written[1323..].iter().all(|s| *s == 0));
        assert_eq!(drain_events(&mut events).len(), 3);
    }

    #[test]
    fn test_schedule_starts_no_earlier_than_write_head() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(GraphShared::default());
        shared.publish(8000, 0, 8000);
        let mut graph = AlsaGraph {
            commands,
            shared,
            tap: TapRing::new(4),
            closed: false,
        };
        assert_eq!(graph.schedule(0, vec![vec![0.0; 8]], 0.5).unwrap(), 1.0);
        assert_eq!(graph.schedule(1, vec![vec![0.0; 8]], 2.0).unwrap(), 2.0);
        graph.close();
        assert!(matches!(graph.schedule(2, vec![vec![0.0; 8]], 3.0), Err(AudioError::Closed)));
        let mut received = 0;
        while let Ok(command) = rx.try_recv() {
            if matches!(command, GraphCommand::Schedule { .. }) {
                received += 1;
            }
        }
        assert_eq!(received, 2);
    }

    #[test]
    fn test_element_write_failure_is_an_error() {
        let writer = ScriptedWriter {
            channels: 2,
            fail_prepare: true,
            ..Default::default()
        };
        writer.fail_writes.set(1);
        let mut output = ElementOutput::new(writer, params(8000, 2), TapRing::new(4));
        output.feed(vec![vec![0.1; 200]], 8000);
        let stop = AtomicBool::new(false);
        assert!(output.pump(true, &stop).is_err());
    }
}
