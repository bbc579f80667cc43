//! ALSA PCM playback device wrapper.

use alsa::pcm::{Access, Format, HwParams, IO, PCM};
use alsa::{Direction, ValueOr};

use crate::error::AudioError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), AudioError> {
    let pcm = PCM::new(device, Direction::Playback, false)
        .map_err(|e| AudioError::Device(format!("failed to open PCM device '{}': {}", device, e)))?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    log::info!(
        "ALSA playback: device={}, rate={}, channels={}, period_size={}",
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

/// Blocking interleaved S16 output. Implemented over an ALSA PCM handle;
/// render loops are generic over it so they can run without hardware.
pub trait FrameWriter {
    /// Write interleaved samples, returning the number of frames taken.
    fn writei(&self, samples: &[i16]) -> Result<usize, AudioError>;

    /// Recover the stream after a failed write.
    fn prepare(&self) -> Result<(), AudioError>;

    /// Frames written but not yet audible.
    fn delay(&self) -> u64 {
        0
    }

    /// Block until everything written has been played.
    fn drain(&self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Discard everything written but not yet played.
    fn discard(&self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// [`FrameWriter`] over an open PCM handle.
pub struct AlsaWriter<'a> {
    pcm: &'a PCM,
    io: IO<'a, i16>,
}

impl<'a> AlsaWriter<'a> {
    pub fn new(pcm: &'a PCM) -> Result<Self, AudioError> {
        Ok(Self { io: pcm.io_i16()?, pcm })
    }
}

impl FrameWriter for AlsaWriter<'_> {
    fn writei(&self, samples: &[i16]) -> Result<usize, AudioError> {
        Ok(self.io.writei(samples)?)
    }

    fn prepare(&self) -> Result<(), AudioError> {
        Ok(self.pcm.prepare()?)
    }

    fn delay(&self) -> u64 {
        self.pcm.delay().map(|d| d.max(0) as u64).unwrap_or(0)
    }

    fn drain(&self) -> Result<(), AudioError> {
        Ok(self.pcm.drain()?)
    }

    fn discard(&self) -> Result<(), AudioError> {
        Ok(self.pcm.drop()?)
    }
}

/// Write interleaved samples, recovering from XRUNs. Fails once the
/// stream cannot be prepared again or three recoveries in a row did not
/// get any frame through. Returns the number of frames written.
pub fn write_interleaved<W: FrameWriter + ?Sized>(
    writer: &W,
    samples: &[i16],
    channels: usize,
) -> Result<usize, AudioError> {
    let channels = channels.max(1);
    let total_frames = samples.len() / channels;
    let mut frames_written = 0;
    let mut retry_count = 0u32;

    while frames_written < total_frames {
        let offset = frames_written * channels;
        match writer.writei(&samples[offset..total_frames * channels]) {
            Ok(n) => {
                frames_written += n;
                retry_count = 0;
            }
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering...", e);
                retry_count += 1;

                if let Err(e2) = writer.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    return Err(AudioError::Device(format!("recovery failed: {}", e2)));
                }

                if retry_count >= 3 {
                    log::error!(
                        "Max recovery retries ({}) reached with {} frames unwritten",
                        retry_count,
                        total_frames - frames_written
                    );
                    return Err(AudioError::Device(format!("write failed after {} retries: {}", retry_count, e)));
                }
            }
        }
    }
    Ok(frames_written)
}
