use thiserror::Error;

/// Failures while decoding what the server sent us.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("not an audio frame (magic {0:02x?})")]
    BadMagic([u8; 4]),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("opaque binary payload ({0} bytes)")]
    Opaque(usize),
}

/// Failures inside the playback backends.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("audio output closed")]
    Closed,
}

impl From<alsa::Error> for AudioError {
    fn from(err: alsa::Error) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        AudioError::Decode(err.to_string())
    }
}

impl From<opus::Error> for AudioError {
    fn from(err: opus::Error) -> Self {
        AudioError::Decode(err.to_string())
    }
}
