//! Wire messages exchanged with the conversation server.
//!
//! Text frames carry JSON objects tagged by `type`. Binary frames carry
//! audio with a 12 byte header: `AUD0`, little-endian u32 turn id,
//! little-endian u32 sequence number, then the raw payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const AUDIO_FRAME_MAGIC: [u8; 4] = *b"AUD0";
pub const AUDIO_FRAME_HEADER_LEN: usize = 12;

/// Backend activity reported by `state_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    #[default]
    Idle,
    Thinking,
    Speaking,
    Listening,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkEncoding {
    /// `audio_chunk` JSON with base64 `data`
    #[default]
    Base64,
    /// `AUD0` binary frame
    Framed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioChunk {
    pub turn_id: u64,
    #[serde(default)]
    pub seq: Option<u32>,
    #[serde(rename = "data", deserialize_with = "base64_payload")]
    pub payload: Bytes,
    #[serde(skip)]
    pub encoding: ChunkEncoding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioBegin {
    pub turn_id: u64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
    #[serde(default)]
    pub mime: Option<String>,
}

/// What `audio_begin` asks us to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    Pcm { sample_rate: u32, channels: u16 },
    Encoded { mime: Option<String> },
}

impl AudioBegin {
    pub fn stream_format(&self, default_rate: u32, default_channels: u16) -> StreamFormat {
        let format_is_pcm = self
            .format
            .as_deref()
            .map(|f| matches!(f.to_ascii_lowercase().as_str(), "pcm" | "pcm_s16le" | "s16le" | "l16"))
            .unwrap_or(false);
        let mime = self.mime.as_deref().map(str::trim).filter(|m| !m.is_empty());
        let mime_is_pcm = mime
            .map(|m| {
                let base = mime_essence(m);
                base == "audio/l16" || base == "audio/pcm"
            })
            .unwrap_or(false);

        if format_is_pcm || mime_is_pcm {
            // audio/L16;rate=24000;channels=1 may carry what the fields omit
            let sample_rate = self
                .sample_rate
                .or_else(|| mime.and_then(|m| mime_param(m, "rate")))
                .filter(|r| *r > 0)
                .unwrap_or(default_rate);
            let channels = self
                .channels
                .or_else(|| mime.and_then(|m| mime_param(m, "channels")))
                .filter(|c| *c > 0)
                .unwrap_or(default_channels);
            StreamFormat::Pcm {
                sample_rate,
                channels,
            }
        } else {
            StreamFormat::Encoded {
                mime: mime.map(str::to_string),
            }
        }
    }
}

/// Lower-cased `type/subtype` without parameters.
pub fn mime_essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn mime_param<T: std::str::FromStr>(mime: &str, name: &str) -> Option<T> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Everything the server can send us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(alias = "session_init")]
    Hello {
        session_id: String,
        #[serde(default)]
        server_instance_id: Option<String>,
        #[serde(default)]
        turn_id_reset: Option<u64>,
    },
    StateUpdate {
        turn_id: u64,
        state: ActivityState,
    },
    AssistantFinal {
        turn_id: u64,
        text: String,
    },
    AssistantDelta {
        turn_id: u64,
        delta: String,
    },
    AudioBegin(AudioBegin),
    AudioChunk(AudioChunk),
    AudioEnd {
        turn_id: u64,
    },
    AudioCancel {
        #[serde(default)]
        turn_id: Option<u64>,
    },
    Error {
        #[serde(default)]
        msg: String,
        #[serde(default)]
        turn_id: Option<u64>,
    },
    #[serde(other)]
    Unrecognized,
}

impl ServerMessage {
    /// Turn the message belongs to. `hello` and `error` are turn-less for
    /// arbitration purposes.
    pub fn turn(&self) -> Option<u64> {
        match self {
            ServerMessage::StateUpdate { turn_id, .. }
            | ServerMessage::AssistantFinal { turn_id, .. }
            | ServerMessage::AssistantDelta { turn_id, .. }
            | ServerMessage::AudioEnd { turn_id } => Some(*turn_id),
            ServerMessage::AudioBegin(begin) => Some(begin.turn_id),
            ServerMessage::AudioChunk(chunk) => Some(chunk.turn_id),
            ServerMessage::AudioCancel { turn_id } => *turn_id,
            ServerMessage::Hello { .. } | ServerMessage::Error { .. } | ServerMessage::Unrecognized => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::StateUpdate { .. } => "state_update",
            ServerMessage::AssistantFinal { .. } => "assistant_final",
            ServerMessage::AssistantDelta { .. } => "assistant_delta",
            ServerMessage::AudioBegin(_) => "audio_begin",
            ServerMessage::AudioChunk(_) => "audio_chunk",
            ServerMessage::AudioEnd { .. } => "audio_end",
            ServerMessage::AudioCancel { .. } => "audio_cancel",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unrecognized => "unrecognized",
        }
    }

    /// Kinds that move the conversation forward and may advance the turn.
    pub fn is_forward_progress(&self) -> bool {
        matches!(
            self,
            ServerMessage::StateUpdate { .. }
                | ServerMessage::AssistantFinal { .. }
                | ServerMessage::AssistantDelta { .. }
                | ServerMessage::AudioBegin(_)
        )
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(ServerMessage),
    /// A well-formed JSON object whose `type` we do not know.
    Unrecognized(String),
}

pub fn decode_text(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value::<ServerMessage>(value)? {
        ServerMessage::Unrecognized => Ok(Inbound::Unrecognized(kind)),
        message => Ok(Inbound::Message(message)),
    }
}

/// Binary frames are audio when they carry the `AUD0` header; anything else
/// is given a second chance as JSON-in-bytes.
pub fn decode_binary(data: &[u8]) -> Result<Inbound, ProtocolError> {
    match parse_audio_frame(data) {
        Ok(chunk) => Ok(Inbound::Message(ServerMessage::AudioChunk(chunk))),
        Err(frame_err) => match std::str::from_utf8(data) {
            Ok(text) if text.trim_start().starts_with('{') => decode_text(text),
            _ => {
                log::debug!("binary frame is not audio: {}", frame_err);
                Err(ProtocolError::Opaque(data.len()))
            }
        },
    }
}

pub fn parse_audio_frame(data: &[u8]) -> Result<AudioChunk, ProtocolError> {
    if data.len() < AUDIO_FRAME_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(data.len()));
    }
    let magic = [data[0], data[1], data[2], data[3]];
    if magic != AUDIO_FRAME_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let turn_id = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let seq = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    Ok(AudioChunk {
        turn_id: u64::from(turn_id),
        seq: Some(seq),
        payload: Bytes::copy_from_slice(&data[AUDIO_FRAME_HEADER_LEN..]),
        encoding: ChunkEncoding::Framed,
    })
}

fn base64_payload<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Messages we send to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { client_id: String, version: u8 },
    UserText { text: String },
    Interrupt,
    UiState { page: u32 },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(turn: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = AUDIO_FRAME_MAGIC.to_vec();
        data.extend_from_slice(&turn.to_le_bytes());
        data.extend_from_slice(&seq.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_parse_audio_frame_header() {
        let chunk = parse_audio_frame(&frame(7, 42, &[1, 2, 3])).unwrap();
        assert_eq!(chunk.turn_id, 7);
        assert_eq!(chunk.seq, Some(42));
        assert_eq!(&chunk.payload[..], &[1, 2, 3]);
        assert_eq!(chunk.encoding, ChunkEncoding::Framed);
    }

    #[test]
    fn test_header_only_frame_has_empty_payload() {
        let chunk = parse_audio_frame(&frame(1, 0, &[])).unwrap();
        assert!(chunk.payload.is_empty());
    }

    #[test]
    fn test_short_or_foreign_frames_are_not_audio() {
        assert!(matches!(
            parse_audio_frame(b"AUD0\x01\x00"),
            Err(ProtocolError::FrameTooShort(6))
        ));
        assert!(matches!(
            parse_audio_frame(b"RIFF\x00\x00\x00\x00\x00\x00\x00\x00"),
            Err(ProtocolError::BadMagic(_))
        ));
        assert!(matches!(
            decode_binary(&[0xff; 20]),
            Err(ProtocolError::Opaque(20))
        ));
    }

    #[test]
    fn test_json_in_bytes_falls_back_to_text_decoding() {
        let inbound = decode_binary(br#"{"type":"audio_end","turn_id":3}"#).unwrap();
        assert!(matches!(
            inbound,
            Inbound::Message(ServerMessage::AudioEnd { turn_id: 3 })
        ));
    }

    #[test]
    fn test_decode_base64_chunk() {
        let inbound = decode_text(r#"{"type":"audio_chunk","turn_id":2,"seq":5,"data":"AQID"}"#).unwrap();
        match inbound {
            Inbound::Message(ServerMessage::AudioChunk(chunk)) => {
                assert_eq!(chunk.turn_id, 2);
                assert_eq!(chunk.seq, Some(5));
                assert_eq!(&chunk.payload[..], &[1, 2, 3]);
                assert_eq!(chunk.encoding, ChunkEncoding::Base64);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let result = decode_text(r#"{"type":"audio_chunk","turn_id":2,"data":"!!!"}"#);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_unknown_type_is_reported_by_name() {
        match decode_text(r#"{"type":"slide_change","page":4}"#).unwrap() {
            Inbound::Unrecognized(kind) => assert_eq!(kind, "slide_change"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hello_and_session_init_alias() {
        for text in [
            r#"{"type":"hello","session_id":"s1","server_instance_id":"i1","turn_id_reset":0}"#,
            r#"{"type":"session_init","session_id":"s1"}"#,
        ] {
            match decode_text(text).unwrap() {
                Inbound::Message(ServerMessage::Hello { session_id, .. }) => assert_eq!(session_id, "s1"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_state_string() {
        match decode_text(r#"{"type":"state_update","turn_id":1,"state":"dreaming"}"#).unwrap() {
            Inbound::Message(ServerMessage::StateUpdate { state, .. }) => {
                assert_eq!(state, ActivityState::Unknown)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_format_selection() {
        let begin = |format: Option<&str>, mime: Option<&str>| AudioBegin {
            turn_id: 1,
            format: format.map(str::to_string),
            sample_rate: None,
            channels: None,
            mime: mime.map(str::to_string),
        };
        assert_eq!(
            begin(Some("pcm_s16le"), Some("audio/L16")).stream_format(24000, 1),
            StreamFormat::Pcm {
                sample_rate: 24000,
                channels: 1
            }
        );
        assert_eq!(
            begin(None, Some("audio/L16; rate=16000; channels=2")).stream_format(24000, 1),
            StreamFormat::Pcm {
                sample_rate: 16000,
                channels: 2
            }
        );
        assert_eq!(
            begin(None, Some("audio/mpeg")).stream_format(24000, 1),
            StreamFormat::Encoded {
                mime: Some("audio/mpeg".to_string())
            }
        );
        assert_eq!(
            begin(None, None).stream_format(24000, 1),
            StreamFormat::Encoded { mime: None }
        );
    }

    #[test]
    fn test_client_message_json() {
        assert_eq!(
            ClientMessage::Interrupt.to_json().unwrap(),
            r#"{"type":"interrupt"}"#
        );
        assert_eq!(
            ClientMessage::UserText {
                text: "hi".to_string()
            }
            .to_json()
            .unwrap(),
            r#"{"type":"user_text","text":"hi"}"#
        );
    }
}
