//! Whole-buffer decoding for the buffered fallback player.

use std::io::Cursor;

use super::pcm::planes_from_interleaved;
use crate::error::AudioError;
use crate::protocol::{StreamFormat, mime_essence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipContainer {
    Wav,
    Mp3,
    Ogg,
    Unknown,
}

/// Decoded clip as per-channel planes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub sample_rate: u32,
    pub planes: Vec<Vec<f32>>,
}

impl DecodedClip {
    pub fn frames(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }
}

/// Identify the container from its leading bytes.
pub fn sniff(data: &[u8]) -> ClipContainer {
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        return ClipContainer::Wav;
    }
    if data.starts_with(b"ID3") {
        return ClipContainer::Mp3;
    }
    // mpeg audio frame sync
    if data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0 {
        return ClipContainer::Mp3;
    }
    if data.starts_with(b"OggS") {
        return ClipContainer::Ogg;
    }
    ClipContainer::Unknown
}

fn container_for_mime(mime: &str) -> ClipContainer {
    match mime_essence(mime).as_str() {
        "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => ClipContainer::Wav,
        "audio/mpeg" | "audio/mp3" => ClipContainer::Mp3,
        "audio/ogg" | "audio/opus" => ClipContainer::Ogg,
        _ => ClipContainer::Unknown,
    }
}

/// Wrap raw S16LE samples in a WAV container.
pub fn wav_from_pcm(data: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: channels.max(1),
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frame_bytes = 2 * usize::from(spec.channels);
    let usable = data.len() - data.len() % frame_bytes;

    let mut cursor = Cursor::new(Vec::with_capacity(usable + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for pair in data[..usable].chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn decode_wav(data: &[u8]) -> Result<DecodedClip, AudioError> {
    let mut reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let frames = interleaved.len() / channels;
    let mut planes: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for frame in interleaved.chunks_exact(channels) {
        for (plane, &sample) in planes.iter_mut().zip(frame) {
            plane.push(sample);
        }
    }
    Ok(DecodedClip {
        sample_rate: spec.sample_rate,
        planes,
    })
}

fn decode_mp3(data: &[u8]) -> Result<DecodedClip, AudioError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut sample_rate = 0u32;
    let mut planes: Vec<Vec<f32>> = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 0 || frame.sample_rate <= 0 {
                    continue;
                }
                if planes.is_empty() {
                    planes = vec![Vec::new(); frame.channels];
                    sample_rate = frame.sample_rate as u32;
                }
                let decoded = planes_from_interleaved(&frame.data, frame.channels);
                for (plane, channel) in planes.iter_mut().zip(decoded.into_iter().cycle()) {
                    plane.extend(channel);
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => return Err(AudioError::Decode(format!("mp3: {}", e))),
        }
    }

    if planes.is_empty() {
        return Err(AudioError::Decode("mp3: no frames".to_string()));
    }
    Ok(DecodedClip { sample_rate, planes })
}

/// Decode an assembled clip. Raw PCM is wrapped into WAV first; encoded
/// data is identified by its magic bytes, then by the declared mime.
pub fn decode_clip(format: &StreamFormat, data: &[u8]) -> Result<DecodedClip, AudioError> {
    match format {
        StreamFormat::Pcm { sample_rate, channels } => {
            let wav = wav_from_pcm(data, *sample_rate, *channels)?;
            decode_wav(&wav)
        }
        StreamFormat::Encoded { mime } => {
            let container = match sniff(data) {
                ClipContainer::Unknown => mime.as_deref().map(container_for_mime).unwrap_or(ClipContainer::Unknown),
                found => found,
            };
            match container {
                ClipContainer::Wav => decode_wav(data),
                ClipContainer::Mp3 => decode_mp3(data),
                ClipContainer::Ogg => Err(AudioError::Unsupported("ogg container".to_string())),
                ClipContainer::Unknown => Err(AudioError::Unsupported(format!(
                    "unrecognised clip ({} bytes, mime {:?})",
                    data.len(),
                    mime
                ))),
            }
        }
    }
}
