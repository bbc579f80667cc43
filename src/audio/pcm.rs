//! Raw little-endian 16-bit PCM helpers.

/// Split interleaved S16LE bytes into per-channel `f32` planes normalized
/// by 32768. Trailing bytes that do not form a whole frame are ignored.
///
/// Returns `None` when the buffer holds less than one full frame.
pub fn deinterleave_s16le(bytes: &[u8], channels: usize) -> Option<Vec<Vec<f32>>> {
    if channels == 0 {
        return None;
    }
    let frame_bytes = 2 * channels;
    let frames = bytes.len() / frame_bytes;
    if frames == 0 {
        return None;
    }

    let mut planes: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for frame in bytes.chunks_exact(frame_bytes) {
        for (ch, plane) in planes.iter_mut().enumerate() {
            let sample = i16::from_le_bytes([frame[2 * ch], frame[2 * ch + 1]]);
            plane.push(f32::from(sample) / 32768.0);
        }
    }
    Some(planes)
}

/// Interleaved i16 samples to planes, as produced by the codec decoders.
pub fn planes_from_interleaved(samples: &[i16], channels: usize) -> Vec<Vec<f32>> {
    let channels = channels.max(1);
    let frames = samples.len() / channels;
    let mut planes: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for frame in samples.chunks_exact(channels) {
        for (plane, &sample) in planes.iter_mut().zip(frame) {
            plane.push(f32::from(sample) / 32768.0);
        }
    }
    planes
}

/// Linear-interpolation rate conversion of one plane: read `out_len`
/// samples from `plane`, advancing `step` input samples per
/// output sample. Positions past the end repeat the last sample.
pub fn resample_to(plane: &[f32], step: f64, out_len: usize) -> Vec<f32> {
    if plane.is_empty() {
        return vec![0.0; out_len];
    }
    if step == 1.0 && out_len <= plane.len() {
        return plane[..out_len].to_vec();
    }
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let fract = (pos - idx as f64) as f32;
            let a = plane[idx.min(plane.len() - 1)];
            let b = plane[(idx + 1).min(plane.len() - 1)];
            a * (1.0 - fract) + b * fract
        })
        .collect()
}

/// Places rate-converted chunks on an output's frame axis. The exact
/// (fractional) end of every chunk is kept, so a chunk that starts where
/// the previous one ended lands on the very next frame and rounding never
/// opens a gap or an overlap between them.
#[derive(Debug, Default, Clone)]
pub struct ChunkPlacer {
    end: Option<f64>,
}

impl ChunkPlacer {
    /// Place `frames` input frames converted by `ratio` (output rate over
    /// input rate), starting at output frame `start` but never before
    /// `floor` nor inside the previous chunk. Returns the first output frame
    /// and the converted length.
    pub fn place(&mut self, start: f64, frames: usize, ratio: f64, floor: u64) -> (u64, usize) {
        let floor = floor as f64;
        let mut exact = start.max(floor);
        if let Some(end) = self.end {
            // within a frame of the previous end counts as contiguous
            if exact < end + 1.0 {
                exact = end.max(floor);
            }
        }
        let end = exact + frames as f64 * ratio;
        self.end = Some(end);
        let first = exact.round() as u64;
        let last = (end.round() as u64).max(first);
        (first, (last - first) as usize)
    }

    /// Place the next chunk right after the previous one.
    pub fn append(&mut self, frames: usize, ratio: f64, floor: u64) -> (u64, usize) {
        let start = self.end.unwrap_or(0.0);
        self.place(start, frames, ratio, floor)
    }
}

/// Map `planes` onto `channels` outputs, duplicating or averaging.
pub fn convert_channels(planes: Vec<Vec<f32>>, channels: usize) -> Vec<Vec<f32>> {
    if planes.len() == channels || planes.is_empty() {
        return planes;
    }
    if channels == 1 {
        let frames = planes[0].len();
        let count = planes.len() as f32;
        let mono = (0..frames)
            .map(|i| planes.iter().map(|p| p.get(i).copied().unwrap_or(0.0)).sum::<f32>() / count)
            .collect();
        return vec![mono];
    }
    (0..channels).map(|c| planes[c % planes.len()].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave_channel_major() {
        // two frames of stereo: (L=1, R=-1), (L=16384, R=-32768)
        let samples: [i16; 4] = [1, -1, 16384, -32768];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let planes = deinterleave_s16le(&bytes, 2).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0], vec![1.0 / 32768.0, 0.5]);
        assert_eq!(planes[1], vec![-1.0 / 32768.0, -1.0]);
    }

    #[test]
    fn test_short_chunk_is_dropped() {
        assert!(deinterleave_s16le(&[0, 0, 0], 2).is_none());
        assert!(deinterleave_s16le(&[], 1).is_none());
        assert!(deinterleave_s16le(&[0, 0], 0).is_none());
    }

    #[test]
    fn test_trailing_partial_frame_ignored() {
        let planes = deinterleave_s16le(&[0, 0, 0, 0, 7], 1).unwrap();
        assert_eq!(planes[0].len(), 2);
    }

    #[test]
    fn test_resample_halves_length() {
        let plane: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_to(&plane, 2.0, 50);
        assert_eq!(out.len(), 50);
        assert_eq!(out[10], 20.0);
    }

    #[test]
    fn test_chunks_stay_contiguous_across_rates() {
        let mut placer = ChunkPlacer::default();
        let ratio = 44100.0 / 24000.0;
        let mut expected_first = None;
        let mut total = 0;
        let mut start_time = 0.05;
        for _ in 0..50 {
            let (first, len) = placer.place(start_time * 44100.0, 487, ratio, 0);
            if let Some(expected) = expected_first {
                assert_eq!(first, expected);
            }
            expected_first = Some(first + len as u64);
            total += len;
            start_time += 487.0 / 24000.0;
        }
        let exact = 50.0 * 487.0 * ratio;
        assert!((total as f64 - exact).abs() <= 1.0);
    }

    #[test]
    fn test_placer_respects_floor_and_gaps() {
        let mut placer = ChunkPlacer::default();
        assert_eq!(placer.place(10.0, 100, 1.0, 40), (40, 100));
        // a deliberate gap is kept
        assert_eq!(placer.place(500.0, 10, 1.0, 0), (500, 10));
        // an overlapping start is moved to the previous end
        assert_eq!(placer.place(505.0, 10, 1.0, 0), (510, 10));
        assert_eq!(placer.append(4, 2.0, 0), (520, 8));
    }

    #[test]
    fn test_resample_to_exact_length() {
        let plane: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let out = resample_to(&plane, 0.5, 21);
        assert_eq!(out.len(), 21);
        assert_eq!(out[3], 1.5);
        assert_eq!(out[20], 9.0);
        assert_eq!(resample_to(&plane, 1.0, 4), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_convert_mono_to_stereo_and_back() {
        let stereo = convert_channels(vec![vec![0.5, 0.25]], 2);
        assert_eq!(stereo, vec![vec![0.5, 0.25], vec![0.5, 0.25]]);
        let mono = convert_channels(vec![vec![1.0], vec![0.0]], 1);
        assert_eq!(mono, vec![vec![0.5]]);
    }
}
