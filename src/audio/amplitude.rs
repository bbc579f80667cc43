//! Mouth-openness level derived from whatever is currently playing.

use std::rc::Rc;

use super::backend::{AudioTap, Generation};

/// Which kind of output the tap is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMode {
    /// A media element (progressive sink or one-shot clip).
    Element,
    /// The gain node of a PCM graph.
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplitudeParams {
    pub noise_floor: f32,
    pub max_level: f32,
    pub window: usize,
}

impl Default for AmplitudeParams {
    fn default() -> Self {
        Self {
            noise_floor: 0.02,
            max_level: 0.3,
            window: 1024,
        }
    }
}

const SMOOTH_KEEP: f32 = 0.7;
const SMOOTH_NEW: f32 = 0.3;

struct Attached {
    mode: TapMode,
    context: Generation,
    tap: Rc<dyn AudioTap>,
}

pub struct AmplitudeExtractor {
    params: AmplitudeParams,
    attached: Option<Attached>,
    buffer: Vec<f32>,
    smoothed: f32,
    running: bool,
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Map an RMS value onto 0..=1 between the noise floor and `max_level`.
pub fn normalize(rms: f32, noise_floor: f32, max_level: f32) -> f32 {
    let span = max_level - noise_floor;
    if span <= f32::EPSILON {
        return if rms > noise_floor { 1.0 } else { 0.0 };
    }
    ((rms - noise_floor) / span).clamp(0.0, 1.0)
}

impl AmplitudeExtractor {
    pub fn new(params: AmplitudeParams) -> Self {
        let window = params.window.max(1);
        Self {
            params,
            attached: None,
            buffer: vec![0.0; window],
            smoothed: 0.0,
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.attached = None;
        self.smoothed = 0.0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn value(&self) -> f32 {
        self.smoothed
    }

    pub fn attached_to(&self) -> Option<(TapMode, Generation)> {
        self.attached.as_ref().map(|a| (a.mode, a.context))
    }

    /// Point the analyser at a new output. The tap is only rebuilt when the
    /// mode or the playback context differs from the current one; returns
    /// whether it was.
    pub fn attach<F>(&mut self, mode: TapMode, context: Generation, make_tap: F) -> bool
    where
        F: FnOnce() -> Option<Rc<dyn AudioTap>>,
    {
        if let Some(current) = &self.attached
            && current.mode == mode
            && current.context == context
        {
            return false;
        }
        let Some(tap) = make_tap() else {
            return false;
        };
        log::debug!("amplitude tap attached: {:?} gen={}", mode, context);
        self.attached = Some(Attached { mode, context, tap });
        true
    }

    pub fn detach(&mut self) {
        if self.attached.take().is_some() {
            log::debug!("amplitude tap detached");
        }
        self.smoothed = 0.0;
    }

    /// One animation tick. Outside playback the level is forced to zero and
    /// smoothing restarts from rest.
    pub fn tick(&mut self, playing: bool) -> f32 {
        if !self.running || !playing {
            self.smoothed = 0.0;
            return 0.0;
        }
        let Some(attached) = &self.attached else {
            self.smoothed = 0.0;
            return 0.0;
        };

        let n = attached.tap.time_domain(&mut self.buffer);
        let raw = normalize(
            rms(&self.buffer[..n]),
            self.params.noise_floor,
            self.params.max_level,
        );
        self.smoothed = self.smoothed * SMOOTH_KEEP + raw * SMOOTH_NEW;
        self.smoothed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ConstTap(f32);

    impl AudioTap for ConstTap {
        fn time_domain(&self, out: &mut [f32]) -> usize {
            out.fill(self.0);
            out.len()
        }
    }

    fn extractor(level: f32) -> AmplitudeExtractor {
        let mut amp = AmplitudeExtractor::new(AmplitudeParams::default());
        amp.start();
        amp.attach(TapMode::Node, 1, || Some(Rc::new(ConstTap(level)) as Rc<dyn AudioTap>));
        amp
    }

    #[test]
    fn test_normalize_clamps() {
        assert_eq!(normalize(0.01, 0.02, 0.3), 0.0);
        assert_eq!(normalize(0.5, 0.02, 0.3), 1.0);
        assert!((normalize(0.16, 0.02, 0.3) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rms_of_long_constant_window() {
        assert_eq!(rms(&[0.3; 1024]), 0.3);
        assert_eq!(rms(&[-0.5; 4096]), 0.5);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_smoothing_converges() {
        let mut amp = extractor(0.3);
        let first = amp.tick(true);
        assert!((first - 0.3).abs() < 1e-6);
        let second = amp.tick(true);
        assert!((second - (0.3 * 0.7 + 0.3)).abs() < 1e-6);
        for _ in 0..50 {
            amp.tick(true);
        }
        assert!((amp.value() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_not_playing_forces_zero_and_resets() {
        let mut amp = extractor(0.3);
        amp.tick(true);
        amp.tick(true);
        assert_eq!(amp.tick(false), 0.0);
        // smoothing restarted from rest
        assert!((amp.tick(true) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_values_stay_in_unit_range() {
        for level in [0.0f32, 0.01, 0.1, 0.9, -2.0] {
            let mut amp = extractor(level);
            for _ in 0..10 {
                let v = amp.tick(true);
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_rebuild_only_on_mode_or_context_change() {
        let built = Cell::new(0);
        let mut amp = AmplitudeExtractor::new(AmplitudeParams::default());
        let mut make = || {
            built.set(built.get() + 1);
            Some(Rc::new(ConstTap(0.1)) as Rc<dyn AudioTap>)
        };
        assert!(amp.attach(TapMode::Element, 1, &mut make));
        assert!(!amp.attach(TapMode::Element, 1, &mut make));
        assert!(amp.attach(TapMode::Node, 1, &mut make));
        assert!(amp.attach(TapMode::Node, 2, &mut make));
        assert_eq!(built.get(), 3);
        assert_eq!(amp.attached_to(), Some((TapMode::Node, 2)));
    }

    #[test]
    fn test_stopped_extractor_reports_zero() {
        let mut amp = extractor(0.3);
        amp.stop();
        assert_eq!(amp.tick(true), 0.0);
        assert_eq!(amp.attached_to(), None);
    }
}
