//! Generic stream decoder trait for progressive playback of encoded chunks.

use std::io::{self, Read};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc::UnboundedReceiver;

use super::opus_codec::OpusStreamDecoder;
use crate::error::AudioError;
use crate::protocol::mime_essence;

/// One block of decoded audio.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub sample_rate: u32,
    pub channels: usize,
    /// Interleaved samples.
    pub samples: Vec<i16>,
}

/// A decoder pulling compressed chunks from a [`ChunkReader`] and yielding
/// interleaved i16 PCM.
pub trait StreamDecoder {
    /// `Ok(None)` once the chunk stream has ended.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, AudioError>;
}

/// Mime types [`create_decoder`] can handle.
pub fn is_progressive(mime: &str) -> bool {
    matches!(
        mime_essence(mime).as_str(),
        "audio/mpeg" | "audio/mp3" | "audio/opus"
    )
}

/// Blocking reader over the chunks a sink receives. `on_pull` runs after
/// every chunk taken off the channel so the sink can report readiness.
pub struct ChunkReader {
    rx: UnboundedReceiver<Bytes>,
    current: Bytes,
    on_pull: Box<dyn FnMut() + Send>,
}

impl ChunkReader {
    pub fn new(rx: UnboundedReceiver<Bytes>, on_pull: Box<dyn FnMut() + Send>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            on_pull,
        }
    }

    /// Next whole chunk, or `None` once every sender is gone.
    pub fn next_chunk(&mut self) -> Option<Bytes> {
        if !self.current.is_empty() {
            return Some(std::mem::take(&mut self.current));
        }
        let chunk = self.rx.blocking_recv()?;
        (self.on_pull)();
        Some(chunk)
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.next_chunk() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

pub struct Mp3StreamDecoder {
    decoder: minimp3::Decoder<ChunkReader>,
}

impl Mp3StreamDecoder {
    pub fn new(reader: ChunkReader) -> Self {
        Self {
            decoder: minimp3::Decoder::new(reader),
        }
    }
}

impl StreamDecoder for Mp3StreamDecoder {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, AudioError> {
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    if frame.channels == 0 || frame.sample_rate <= 0 || frame.data.is_empty() {
                        continue;
                    }
                    return Ok(Some(DecodedFrame {
                        sample_rate: frame.sample_rate as u32,
                        channels: frame.channels,
                        samples: frame.data,
                    }));
                }
                Err(minimp3::Error::Eof) => return Ok(None),
                Err(minimp3::Error::SkippedData) => continue,
                // stream ended mid-frame
                Err(minimp3::Error::InsufficientData) => return Ok(None),
                Err(e) => return Err(AudioError::Decode(format!("mp3: {}", e))),
            }
        }
    }
}

/// Factory: pick a decoder for the sink's mime type.
pub fn create_decoder(mime: &str, reader: ChunkReader) -> Result<Box<dyn StreamDecoder>, AudioError> {
    match mime_essence(mime).as_str() {
        "audio/mpeg" | "audio/mp3" => Ok(Box::new(Mp3StreamDecoder::new(reader))),
        "audio/opus" => Ok(Box::new(OpusStreamDecoder::new(reader)?)),
        other => Err(AudioError::Unsupported(format!("no progressive decoder for {}", other))),
    }
}
