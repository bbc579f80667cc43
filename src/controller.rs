//! Protocol dispatch: the one place inbound messages, engine callbacks and
//! user actions mutate conversation state.
//!
//! The controller is synchronous. The main loop hands it one event at a
//! time and it never awaits, so every handler runs check-then-act without
//! interleaving.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::audio::{
    AmplitudeExtractor, AudioBackend, AudioStage, EngineEvent, EngineKind, RetryScheduler,
};
use crate::chunk_tracker::ChunkTracker;
use crate::config::Config;
use crate::error::{AudioError, ProtocolError};
use crate::gui_bridge::{UiSignal, UserAction};
use crate::net_link::{NetCommand, NetEvent};
use crate::protocol::{
    ActivityState, AudioBegin, AudioChunk, ChunkEncoding, ClientMessage, Inbound, ServerMessage, decode_binary,
    decode_text,
};
use crate::transcript::Transcript;
use crate::turn::{TurnArbiter, TurnScoped};

/// Mouth changes smaller than this are not worth a datagram.
const MOUTH_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub server_instance_id: Option<String>,
}

/// Everything that lives and dies with a turn.
struct TurnScope {
    stage: AudioStage,
    tracker: Option<ChunkTracker>,
    /// Turn whose stream already ended or was cancelled; late chunks for it
    /// must not restart playback.
    closed_turn: Option<u64>,
}

impl TurnScope {
    fn clear_stream(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            log::info!("{}", tracker.summary());
        }
    }
}

impl TurnScoped for TurnScope {
    fn retire_turn(&mut self, previous: u64, reason: &str) {
        self.stage.retire_turn(previous, reason);
        if self.tracker.as_ref().is_some_and(|t| t.turn() <= previous) {
            self.clear_stream();
        }
        self.closed_turn = None;
    }

    fn reset(&mut self) {
        self.stage.reset();
        self.tracker = None;
        self.closed_turn = None;
    }
}

pub struct CoreController {
    arbiter: TurnArbiter,
    scope: TurnScope,
    session: Option<SessionInfo>,
    activity: ActivityState,
    connected: bool,
    transcript: Transcript,
    trace: VecDeque<String>,
    trace_limit: usize,
    amplitude: AmplitudeExtractor,
    playing: bool,
    mouth: f32,
    net_tx: mpsc::Sender<NetCommand>,
    ui_tx: mpsc::UnboundedSender<UiSignal>,
}

impl CoreController {
    pub fn new(
        config: &Config,
        backend: Rc<dyn AudioBackend>,
        scheduler: Rc<dyn RetryScheduler>,
        net_tx: mpsc::Sender<NetCommand>,
        ui_tx: mpsc::UnboundedSender<UiSignal>,
    ) -> Self {
        let stage = AudioStage::new(backend, scheduler)
            .with_defaults(config.audio.default_sample_rate, config.audio.default_channels);
        let mut amplitude = AmplitudeExtractor::new(config.amplitude_params());
        amplitude.start();

        Self {
            arbiter: TurnArbiter::new(),
            scope: TurnScope {
                stage,
                tracker: None,
                closed_turn: None,
            },
            session: None,
            activity: ActivityState::Idle,
            connected: false,
            transcript: Transcript::new(config.ui.transcript_limit),
            trace: VecDeque::new(),
            trace_limit: config.ui.trace_limit.max(1),
            amplitude,
            playing: false,
            mouth: 0.0,
            net_tx,
            ui_tx,
        }
    }

    pub fn current_turn(&self) -> u64 {
        self.arbiter.current()
    }

    pub fn activity(&self) -> ActivityState {
        self.activity
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn trace(&self) -> impl Iterator<Item = &str> {
        self.trace.iter().map(String::as_str)
    }

    pub fn is_playing(&self) -> bool {
        self.scope.stage.is_playing()
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.scope.stage.kind()
    }

    pub fn engine_turn(&self) -> Option<u64> {
        self.scope.stage.active_turn()
    }

    pub fn mouth(&self) -> f32 {
        self.mouth
    }

    pub fn expected_seq(&self) -> Option<u32> {
        self.scope.tracker.as_ref().map(ChunkTracker::expected_seq)
    }

    fn emit(&self, signal: UiSignal) {
        // GUI forwarder gone means we are shutting down
        let _ = self.ui_tx.send(signal);
    }

    fn push_trace(&mut self, line: String) {
        log::debug!("trace: {}", line);
        if self.trace.len() == self.trace_limit {
            self.trace.pop_front();
        }
        self.trace.push_back(line.clone());
        self.emit(UiSignal::Trace { line });
    }

    fn send(&mut self, message: ClientMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode {:?}: {}", message, e);
                return;
            }
        };
        if let Err(e) = self.net_tx.try_send(NetCommand::SendText(json)) {
            log::warn!("Dropped outbound message: {}", e);
            self.push_trace(format!("outbound message dropped: {}", e));
        }
    }

    // ======================== Network ========================

    pub fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected => {
                log::info!("WebSocket Connected");
                self.connected = true;
                self.emit(UiSignal::Connection { connected: true });
            }
            NetEvent::Disconnected => {
                if self.connected {
                    log::info!("WebSocket Disconnected");
                }
                self.connected = false;
                self.scope.stage.stop("disconnected");
                self.scope.clear_stream();
                self.set_activity(ActivityState::Idle);
                self.emit(UiSignal::Connection { connected: false });
                self.sync_playback();
            }
            NetEvent::Text(text) => {
                let decoded = decode_text(&text);
                self.handle_inbound(decoded);
            }
            NetEvent::Binary(data) => {
                let decoded = decode_binary(&data);
                self.handle_inbound(decoded);
            }
        }
    }

    fn handle_inbound(&mut self, decoded: Result<Inbound, ProtocolError>) {
        match decoded {
            Ok(Inbound::Message(message)) => self.dispatch(message),
            Ok(Inbound::Unrecognized(kind)) => {
                log::info!("Unhandled message type: {}", kind);
                self.push_trace(format!("unrecognized message type {:?}", kind));
            }
            Err(ProtocolError::Opaque(len)) => {
                log::debug!("ignoring opaque binary frame of {} bytes", len);
            }
            Err(e) => {
                log::warn!("Dropping malformed message: {}", e);
                self.push_trace(format!("malformed message dropped: {}", e));
            }
        }
    }

    /// Apply one decoded server message.
    pub fn dispatch(&mut self, message: ServerMessage) {
        let message = match message {
            ServerMessage::Hello {
                session_id,
                server_instance_id,
                turn_id_reset,
            } => {
                self.start_session(session_id, server_instance_id, turn_id_reset.unwrap_or(0));
                return;
            }
            ServerMessage::Error { msg, turn_id } => {
                log::warn!("Server error (turn {:?}): {}", turn_id, msg);
                self.push_trace(format!("server error: {}", msg));
                self.emit(UiSignal::Error { msg, turn_id });
                return;
            }
            other => other,
        };

        if self.arbiter.is_stale(message.turn()) {
            log::trace!("stale {} for turn {:?}", message.kind(), message.turn());
            return;
        }

        if message.is_forward_progress() {
            let Some(turn) = message.turn() else {
                return;
            };
            self.advance(turn, message.kind());
            if !self.arbiter.is_current(turn) {
                log::debug!("{} for turn {} lost the race", message.kind(), turn);
                return;
            }
        }

        match message {
            ServerMessage::StateUpdate { state, .. } => self.set_activity(state),
            ServerMessage::AssistantDelta { turn_id, delta } => {
                let entry = self.transcript.apply_delta(turn_id, &delta).clone();
                self.emit(UiSignal::Transcript { entry });
            }
            ServerMessage::AssistantFinal { turn_id, text } => {
                let entry = self.transcript.apply_final(turn_id, &text).clone();
                self.emit(UiSignal::Transcript { entry });
            }
            ServerMessage::AudioBegin(begin) => self.on_audio_begin(begin),
            ServerMessage::AudioChunk(chunk) => self.on_audio_chunk(chunk),
            ServerMessage::AudioEnd { turn_id } => self.on_audio_end(turn_id),
            ServerMessage::AudioCancel { turn_id } => self.on_audio_cancel(turn_id),
            ServerMessage::Unrecognized => log::info!("Unhandled message"),
            ServerMessage::Hello { .. } | ServerMessage::Error { .. } => {}
        }
        self.sync_playback();
    }

    fn advance(&mut self, turn: u64, reason: &str) -> bool {
        let changed = self.arbiter.advance(turn, reason, &mut self.scope);
        if changed {
            self.emit(UiSignal::Turn { turn });
            self.sync_playback();
        }
        changed
    }

    fn start_session(&mut self, session_id: String, server_instance_id: Option<String>, base_turn: u64) {
        log::info!("New Session ID: {} (base turn {})", session_id, base_turn);
        self.arbiter.reset(base_turn, &mut self.scope);
        self.transcript.clear();
        self.trace.clear();
        self.amplitude.detach();
        self.session = Some(SessionInfo {
            session_id: session_id.clone(),
            server_instance_id: server_instance_id.clone(),
        });
        self.emit(UiSignal::Session {
            session_id,
            server_instance_id: server_instance_id.unwrap_or_default(),
        });
        self.emit(UiSignal::Turn { turn: base_turn });
        self.set_activity(ActivityState::Idle);
        self.sync_playback();
    }

    fn set_activity(&mut self, state: ActivityState) {
        if self.activity != state {
            self.activity = state;
            self.emit(UiSignal::Activity { state });
        }
    }

    // ======================== Audio ========================

    fn on_audio_begin(&mut self, begin: AudioBegin) {
        let turn = begin.turn_id;
        let (rate, channels) = self.scope.stage.default_format();
        let format = begin.stream_format(rate, channels);

        self.scope.clear_stream();
        self.scope.tracker = Some(ChunkTracker::new(turn));
        self.scope.closed_turn = None;
        let kind = self.scope.stage.begin(turn, format.clone());
        self.push_trace(format!("audio_begin turn {}: {:?} -> {:?} engine", turn, format, kind));
    }

    fn on_audio_chunk(&mut self, chunk: AudioChunk) {
        let turn = chunk.turn_id;
        if !self.arbiter.is_current(turn) {
            log::debug!("chunk for turn {} while current is {}", turn, self.arbiter.current());
            return;
        }

        match self.scope.stage.active_turn() {
            Some(active) if active == turn => {}
            Some(active) => {
                log::debug!("chunk for turn {} but engine belongs to {}", turn, active);
                return;
            }
            None if self.scope.closed_turn == Some(turn) => {
                log::debug!("late chunk for closed turn {}", turn);
                return;
            }
            None if chunk.payload.is_empty() => return,
            None => {
                self.scope.stage.begin_implicit(turn);
                self.scope.tracker = Some(ChunkTracker::new(turn));
                self.push_trace(format!("audio_chunk without audio_begin, buffering turn {}", turn));
            }
        }

        // AUD0 frames only ever carry raw PCM
        if chunk.encoding == ChunkEncoding::Framed && self.scope.stage.kind() == EngineKind::Compressed {
            log::debug!("framed chunk dropped: turn {} is playing through the compressed engine", turn);
            return;
        }

        // metrics end with the stream; a late chunk for a draining engine is not counted
        let gap = match self.scope.tracker.as_mut() {
            Some(tracker) => tracker.record(chunk.seq, chunk.payload.len()),
            None => None,
        };
        if let Some(gap) = gap {
            log::warn!(
                "turn {} sequence gap: expected {}, got {}",
                turn,
                gap.expected,
                gap.received
            );
            self.push_trace(format!(
                "seq gap on turn {}: expected {}, got {}",
                turn, gap.expected, gap.received
            ));
        }

        self.append_audio(chunk.payload);
    }

    fn append_audio(&mut self, payload: Bytes) {
        if let Err(e) = self.scope.stage.append(payload) {
            self.playback_failed(e);
        }
    }

    fn on_audio_end(&mut self, turn: u64) {
        if !self.arbiter.is_current(turn) {
            return;
        }
        self.scope.closed_turn = Some(turn);
        self.scope.clear_stream();
        if self.scope.stage.active_turn() != Some(turn) {
            log::debug!("audio_end for turn {} with no engine", turn);
            return;
        }
        if let Err(e) = self.scope.stage.end() {
            self.playback_failed(e);
        }
    }

    fn on_audio_cancel(&mut self, turn: Option<u64>) {
        let Some(turn) = turn else {
            self.push_trace("audio_cancel without turn ignored".to_string());
            return;
        };
        if turn > self.arbiter.current() {
            // adopting a future turn without a begin or state update
            log::warn!(
                "audio_cancel adopts future turn {} (current {})",
                turn,
                self.arbiter.current()
            );
            self.advance(turn, "audio_cancel");
        }
        self.scope.stage.stop("audio_cancel");
        self.scope.clear_stream();
        self.scope.closed_turn = Some(turn);
        self.push_trace(format!("audio cancelled for turn {}", turn));
    }

    fn playback_failed(&mut self, error: AudioError) {
        log::error!("Playback failed: {}", error);
        self.scope.stage.stop("playback failure");
        self.scope.clear_stream();
        self.amplitude.detach();
        self.push_trace(format!("playback failed: {}", error));
        self.sync_playback();
    }

    /// Hardware progress from render threads and retry timers.
    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        match self.scope.stage.handle_event(&event) {
            Ok(true) => {}
            Ok(false) => log::trace!("fenced off {:?}", event),
            Err(e) => self.playback_failed(e),
        }
        self.sync_playback();
    }

    /// Keep the amplitude tap on the active output and report the playing
    /// flag when it flips.
    fn sync_playback(&mut self) {
        match self.scope.stage.engine().tap_target() {
            Some((mode, generation)) => {
                let engine = self.scope.stage.engine();
                self.amplitude.attach(mode, generation, || engine.tap());
            }
            None => self.amplitude.detach(),
        }

        let playing = self.scope.stage.is_playing();
        if playing != self.playing {
            self.playing = playing;
            self.emit(UiSignal::Playing { playing });
        }
    }

    /// One animation frame. Returns the mouth level.
    pub fn tick(&mut self) -> f32 {
        self.sync_playback();
        let level = self.amplitude.tick(self.playing);
        let changed = (level - self.mouth).abs() >= MOUTH_EPSILON || (level == 0.0 && self.mouth != 0.0);
        if changed {
            self.mouth = level;
            self.emit(UiSignal::Mouth { level });
        }
        level
    }

    // ======================== User ========================

    pub fn handle_user_action(&mut self, action: UserAction) {
        match action {
            UserAction::UserText { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                let turn = self.arbiter.current() + 1;
                self.advance(turn, "user_text");
                let entry = self.transcript.push_user(turn, text).clone();
                self.emit(UiSignal::Transcript { entry });
                self.send(ClientMessage::UserText {
                    text: text.to_string(),
                });
            }
            UserAction::Interrupt => {
                let turn = self.arbiter.current() + 1;
                self.advance(turn, "interrupt");
                self.push_trace(format!("interrupt, now on turn {}", turn));
                self.send(ClientMessage::Interrupt);
            }
            UserAction::Page { page } => self.send(ClientMessage::UiState { page }),
        }
        self.sync_playback();
    }

    /// Tear everything down before exit.
    pub fn shutdown(&mut self) {
        self.scope.stage.stop("shutdown");
        self.scope.clear_stream();
        self.amplitude.stop();
        self.sync_playback();
    }
}
