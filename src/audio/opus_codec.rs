//! Opus packet decoding for progressive sinks.
//!
//! Each chunk handed to an `audio/opus` sink is one raw Opus packet.
//! Packets are decoded at 48 kHz; rate and channel conversion to the
//! element output happen downstream.

use super::stream_decoder::{ChunkReader, DecodedFrame, StreamDecoder};
use crate::error::AudioError;

/// Opus always decodes at 48 kHz internally.
pub const OPUS_DECODE_RATE: u32 = 48000;

/// Max 120ms @ 48kHz per channel.
const MAX_FRAME_SIZE: usize = 5760;

pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: usize,
}

impl OpusDecoder {
    pub fn new(channels: usize) -> Result<Self, AudioError> {
        let (opus_channels, channels) = if channels == 1 {
            (opus::Channels::Mono, 1)
        } else {
            (opus::Channels::Stereo, 2)
        };
        let decoder = opus::Decoder::new(OPUS_DECODE_RATE, opus_channels)?;
        Ok(Self { decoder, channels })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Decode one Opus packet to interleaved PCM at 48 kHz.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, AudioError> {
        let mut pcm_buf = vec![0i16; MAX_FRAME_SIZE * self.channels];
        let decoded_per_ch = self.decoder.decode(packet, &mut pcm_buf, false)?;
        pcm_buf.truncate(decoded_per_ch * self.channels);
        Ok(pcm_buf)
    }
}

/// Packet-per-chunk opus stream.
pub struct OpusStreamDecoder {
    reader: ChunkReader,
    codec: OpusDecoder,
}

impl OpusStreamDecoder {
    pub fn new(reader: ChunkReader) -> Result<Self, AudioError> {
        Ok(Self {
            reader,
            codec: OpusDecoder::new(1)?,
        })
    }
}

impl StreamDecoder for OpusStreamDecoder {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, AudioError> {
        while let Some(packet) = self.reader.next_chunk() {
            match self.codec.decode(&packet) {
                Ok(samples) if !samples.is_empty() => {
                    return Ok(Some(DecodedFrame {
                        sample_rate: OPUS_DECODE_RATE,
                        channels: self.codec.channels(),
                        samples,
                    }));
                }
                Ok(_) => continue,
                Err(e) => {
                    // one corrupt packet is not fatal
                    log::error!("Audio decode error: {}", e);
                }
            }
        }
        Ok(None)
    }
}
