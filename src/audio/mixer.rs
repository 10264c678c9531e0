//! # Sample-Clock Mixer
//!
//! Backs the hardware output context. Time is measured in frames of the
//! source rate (24 kHz) that have been rendered so far, which gives the
//! playback scheduler a clock that only moves when audio actually goes out.
//!
//! When the device runs at a different rate the mixer steps through the
//! source timeline by `source_rate / device_rate` per device frame
//! (nearest-sample conversion).

use crate::audio::SourceId;

struct MixUnit {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl MixUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

pub struct Mixer {
    source_rate: f64,
    step: f64,
    position: f64,
    units: Vec<MixUnit>,
}

impl Mixer {
    pub fn new(source_rate: u32, device_rate: u32) -> Self {
        Self {
            source_rate: source_rate as f64,
            step: source_rate as f64 / device_rate.max(1) as f64,
            position: 0.0,
            units: Vec::new(),
        }
    }

    /// Seconds of source audio rendered so far.
    pub fn current_time(&self) -> f64 {
        self.position / self.source_rate
    }

    pub fn schedule(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) {
        let start_frame = (start_at * self.source_rate).round().max(0.0) as u64;
        self.units.push(MixUnit {
            id,
            start_frame,
            samples,
        });
    }

    pub fn cancel(&mut self, id: SourceId) {
        self.units.retain(|unit| unit.id != id);
    }

    pub fn scheduled(&self) -> usize {
        self.units.len()
    }

    /// Fill an interleaved device buffer and return the units that finished.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<SourceId> {
        for frame in out.chunks_mut(channels.max(1)) {
            let index = self.position as u64;
            let mut value = 0.0f32;
            for unit in &self.units {
                if index >= unit.start_frame && index < unit.end_frame() {
                    value += unit.samples[(index - unit.start_frame) as usize];
                }
            }
            let value = value.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
            self.position += self.step;
        }

        let now = self.position as u64;
        let mut finished = Vec::new();
        self.units.retain(|unit| {
            let done = now >= unit.end_frame();
            if done {
                finished.push(unit.id);
            }
            !done
        });
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_to_back_units_render_without_gap() {
        let mut mixer = Mixer::new(4, 4);
        mixer.schedule(1, vec![0.1, 0.2], 0.0);
        mixer.schedule(2, vec![0.3, 0.4], 0.5);

        let mut out = vec![0.0; 6];
        let finished = mixer.render(&mut out, 1);

        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.0, 0.0]);
        assert_eq!(finished, vec![1, 2]);
        assert_eq!(mixer.current_time(), 1.5);
    }

    #[test]
    fn test_unit_finishes_only_after_last_sample() {
        let mut mixer = Mixer::new(4, 4);
        mixer.schedule(7, vec![0.5; 4], 0.0);

        let mut out = vec![0.0; 2];
        assert!(mixer.render(&mut out, 1).is_empty());
        assert_eq!(mixer.render(&mut out, 1), vec![7]);
        assert_eq!(mixer.scheduled(), 0);
    }

    #[test]
    fn test_cancel_silences_unit() {
        let mut mixer = Mixer::new(4, 4);
        mixer.schedule(1, vec![0.9; 4], 0.0);
        mixer.cancel(1);

        let mut out = vec![1.0; 4];
        assert!(mixer.render(&mut out, 1).is_empty());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_device_rate_and_channels() {
        // Device runs twice as fast: each source sample covers two frames.
        let mut mixer = Mixer::new(2, 4);
        mixer.schedule(1, vec![0.25, -0.25], 0.0);

        let mut out = vec![0.0; 8];
        mixer.render(&mut out, 2);

        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.25, -0.25, -0.25, -0.25, -0.25]);
        assert_eq!(mixer.current_time(), 1.0);
    }
}
