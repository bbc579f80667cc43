//! Frame-indexed mixer behind the ALSA graph and element outputs.

use super::backend::SourceId;

struct TimelineSource {
    id: SourceId,
    start: u64,
    planes: Vec<Vec<f32>>,
}

impl TimelineSource {
    fn frames(&self) -> u64 {
        self.planes.first().map(|p| p.len() as u64).unwrap_or(0)
    }

    fn end(&self) -> u64 {
        self.start + self.frames()
    }
}

/// Sources placed at absolute frame positions, rendered one period at a
/// time. `position` is the number of frames already rendered and acts as
/// the clock of whatever output drives it.
pub struct Timeline {
    channels: usize,
    position: u64,
    sources: Vec<TimelineSource>,
}

impl Timeline {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            position: 0,
            sources: Vec::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Last frame any source covers, or the current position.
    pub fn horizon(&self) -> u64 {
        self.sources
            .iter()
            .map(TimelineSource::end)
            .max()
            .unwrap_or(self.position)
            .max(self.position)
    }

    /// Place `planes` at `start`. A start already in the past is clamped to
    /// the current position.
    pub fn schedule(&mut self, id: SourceId, planes: Vec<Vec<f32>>, start: u64) {
        let start = start.max(self.position);
        self.sources.push(TimelineSource { id, start, planes });
    }

    /// Append right after the last scheduled frame.
    pub fn append(&mut self, id: SourceId, planes: Vec<Vec<f32>>) {
        let start = self.horizon();
        self.schedule(id, planes, start);
    }

    pub fn stop(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        before != self.sources.len()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    /// Mix the next `frames` frames into `out` (interleaved, `frames *
    /// channels` long) and advance the clock. Returns the sources that
    /// finished inside this period.
    pub fn render(&mut self, frames: usize, out: &mut [f32]) -> Vec<SourceId> {
        let channels = self.channels;
        out.fill(0.0);
        let period_start = self.position;
        let period_end = period_start + frames as u64;

        for source in &self.sources {
            if source.start >= period_end || source.end() <= period_start {
                continue;
            }
            let from = source.start.max(period_start);
            let to = source.end().min(period_end);
            for frame in from..to {
                let src_idx = (frame - source.start) as usize;
                let dst = (frame - period_start) as usize * channels;
                for ch in 0..channels {
                    let plane = &source.planes[ch % source.planes.len()];
                    out[dst + ch] += plane[src_idx];
                }
            }
        }

        self.position = period_end;
        let mut finished = Vec::new();
        self.sources.retain(|s| {
            if s.end() <= period_end {
                finished.push(s.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Interleaved f32 to S16LE-ready samples with clipping.
pub fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Average channels of an interleaved period into mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> impl Iterator<Item = f32> + '_ {
    let channels = channels.max(1);
    interleaved
        .chunks_exact(channels)
        .map(move |frame| frame.iter().sum::<f32>() / channels as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_mix_at_their_offsets() {
        let mut timeline = Timeline::new(1);
        timeline.schedule(1, vec![vec![0.5; 4]], 2);
        timeline.schedule(2, vec![vec![0.25; 2]], 0);
        let mut out = vec![0.0; 6];
        let finished = timeline.render(6, &mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.5, 0.5, 0.5, 0.5]);
        assert_eq!(finished, vec![1, 2]);
        assert!(timeline.is_empty());
        assert_eq!(timeline.position(), 6);
    }

    #[test]
    fn test_source_spanning_periods() {
        let mut timeline = Timeline::new(2);
        timeline.schedule(7, vec![vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0]], 1);
        let mut out = vec![0.0; 4];
        assert!(timeline.render(2, &mut out).is_empty());
        assert_eq!(out, vec![0.0, 0.0, 1.0, -1.0]);
        assert_eq!(timeline.render(2, &mut out), vec![7]);
        assert_eq!(out, vec![2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_append_is_back_to_back() {
        let mut timeline = Timeline::new(1);
        timeline.append(1, vec![vec![0.1; 3]]);
        timeline.append(2, vec![vec![0.2; 3]]);
        assert_eq!(timeline.horizon(), 6);
        let mut out = vec![0.0; 6];
        timeline.render(6, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn test_stopped_source_is_silent() {
        let mut timeline = Timeline::new(1);
        timeline.schedule(3, vec![vec![1.0; 4]], 0);
        assert!(timeline.stop(3));
        assert!(!timeline.stop(3));
        let mut out = vec![0.0; 4];
        assert!(timeline.render(4, &mut out).is_empty());
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_mono_source_fills_every_channel() {
        let mut timeline = Timeline::new(2);
        timeline.schedule(1, vec![vec![0.5]], 0);
        let mut out = vec![0.0; 2];
        timeline.render(1, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
        assert_eq!(downmix(&out, 2).collect::<Vec<_>>(), vec![0.5]);
        assert_eq!(to_i16(&[2.0, -2.0, 0.0]), vec![32767, -32768, 0]);
    }
}
