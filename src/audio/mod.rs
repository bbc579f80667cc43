//! audio - Playback engines, amplitude analysis and the ALSA backend
//!
//! The engines are plain single-threaded state machines driven by the
//! controller. Everything that touches a device lives behind
//! [`AudioBackend`] and runs on its own OS thread.

pub mod alsa_backend;
mod alsa_device;
pub mod amplitude;
pub mod backend;
pub mod clip;
pub mod compressed_engine;
pub mod engine;
pub mod fallback;
#[cfg(test)]
pub(crate) mod mock;
mod opus_codec;
pub mod pcm;
pub mod pcm_engine;
pub mod phase;
pub mod retry;
pub mod stream_decoder;
pub mod timeline;

pub use alsa_backend::{AlsaBackend, AlsaBackendConfig};
pub use amplitude::{AmplitudeExtractor, AmplitudeParams, TapMode};
pub use backend::{AudioBackend, EngineEvent, Generation, RetryScheduler};
pub use engine::{AudioStage, EngineKind};
pub use retry::TokioRetryScheduler;
pub use stream_decoder::StreamDecoder;
