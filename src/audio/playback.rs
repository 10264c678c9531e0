//! # Playback Scheduler
//!
//! Turns streamed audio fragments into continuous output. Fragments are
//! scheduled back-to-back on the output context's clock using a single cursor,
//! `next_start_time`, so playback is gapless and never overlaps regardless of
//! when each fragment arrived.
//!
//! ## Invariants:
//! - The cursor is clamped up to the output's current time before every use,
//!   so nothing is ever scheduled in the past.
//! - The active set holds exactly the units that are still playing. It
//!   becoming empty is the only "assistant stopped speaking" signal.
//! - Interruption and stop empty the set and reset the cursor to zero.

use crate::audio::codec;
use crate::audio::{AudioDevices, AudioOutput, EndedCallback, SourceId};
use crate::error::VoiceError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Where and for how long a fragment was scheduled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    devices: Arc<dyn AudioDevices>,
    on_ended: EndedCallback,
    sample_rate: u32,
    output: Option<Box<dyn AudioOutput>>,
    next_start_time: f64,
    active: BTreeSet<SourceId>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new(devices: Arc<dyn AudioDevices>, sample_rate: u32, on_ended: EndedCallback) -> Self {
        Self {
            devices,
            on_ended,
            sample_rate,
            output: None,
            next_start_time: 0.0,
            active: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Decode one base64 fragment and schedule it right after the previous one.
    ///
    /// On error only this fragment is lost; the cursor and active set are
    /// left as they were.
    pub fn enqueue(&mut self, fragment: &str) -> Result<ScheduledUnit, VoiceError> {
        if self.output.is_none() {
            let output = self
                .devices
                .open_output(self.sample_rate, self.on_ended.clone())?;
            info!(sample_rate = self.sample_rate, "Output audio context created");
            self.output = Some(output);
        }
        let Some(output) = self.output.as_mut() else {
            return Err(VoiceError::DeviceNotFound("output context unavailable".to_string()));
        };

        self.next_start_time = self.next_start_time.max(output.current_time());

        let samples = codec::decode_fragment(fragment)?;
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let id = self.next_id;
        let start_at = self.next_start_time;

        output.start(id, samples, start_at)?;

        self.next_id += 1;
        self.next_start_time = start_at + duration;
        self.active.insert(id);

        debug!(id, start_at, duration, active = self.active.len(), "Scheduled playback unit");
        Ok(ScheduledUnit {
            id,
            start_at,
            duration,
        })
    }

    /// A unit finished on its own. Returns `true` when that silenced playback.
    pub fn finished(&mut self, id: SourceId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// The user cut in: stop everything now and rewind the cursor.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        self.stop_all();
        debug!(stopped, "Playback interrupted");
    }

    /// Stop-path teardown. The output context itself stays open for reuse.
    pub fn reset(&mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        let active = std::mem::take(&mut self.active);
        if let Some(output) = self.output.as_mut() {
            for id in active {
                output.stop(id);
            }
        }
        self.next_start_time = 0.0;
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeDevices;

    fn fragment(samples: usize) -> String {
        codec::encode_base64(&vec![0u8; samples * 2])
    }

    fn scheduler(devices: &FakeDevices) -> PlaybackScheduler {
        PlaybackScheduler::new(Arc::new(devices.clone()), 24000, Arc::new(|_: SourceId| {}))
    }

    #[test]
    fn test_back_to_back_schedule() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);

        let a = playback.enqueue(&fragment(2400)).unwrap();
        let b = playback.enqueue(&fragment(4800)).unwrap();
        let c = playback.enqueue(&fragment(1200)).unwrap();

        assert_eq!(a.start_at, 0.0);
        assert_eq!(b.start_at, a.duration);
        assert_eq!(c.start_at, a.duration + b.duration);
        assert!((playback.next_start_time() - 0.35).abs() < 1e-9);
        assert_eq!(devices.log.lock().unwrap().outputs_opened, 1);
    }

    #[test]
    fn test_cursor_is_clamped_to_now() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);

        playback.enqueue(&fragment(2400)).unwrap();
        devices.set_now(5.0);
        let late = playback.enqueue(&fragment(2400)).unwrap();

        assert_eq!(late.start_at, 5.0);
        assert!(playback.next_start_time() >= 5.0);
    }

    #[test]
    fn test_cursor_never_decreases() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);
        let mut last = 0.0;

        for (i, now) in [0.0, 0.02, 0.5, 0.51, 2.0].iter().enumerate() {
            devices.set_now(*now);
            let unit = playback.enqueue(&fragment(240 * (i + 1))).unwrap();
            assert!(unit.start_at >= *now);
            assert!(playback.next_start_time() >= last);
            last = playback.next_start_time();
        }
    }

    #[test]
    fn test_interrupt_stops_everything() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);
        for _ in 0..4 {
            playback.enqueue(&fragment(480)).unwrap();
        }
        assert!(playback.is_speaking());

        playback.interrupt();

        assert_eq!(playback.active_count(), 0);
        assert_eq!(playback.next_start_time(), 0.0);
        assert!(!playback.is_speaking());
        assert_eq!(devices.log.lock().unwrap().stopped, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_twice_leaves_nothing_scheduled() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);
        playback.enqueue(&fragment(2400)).unwrap();
        playback.enqueue(&fragment(2400)).unwrap();

        playback.reset();
        playback.reset();

        assert_eq!(playback.active_count(), 0);
        assert_eq!(playback.next_start_time(), 0.0);
        assert_eq!(devices.log.lock().unwrap().stopped, vec![1, 2]);
        // The output context is reused by the next session.
        playback.enqueue(&fragment(2400)).unwrap();
        assert_eq!(devices.log.lock().unwrap().outputs_opened, 1);
    }

    #[test]
    fn test_finished_reports_silence_once_empty() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);
        let a = playback.enqueue(&fragment(480)).unwrap();
        let b = playback.enqueue(&fragment(480)).unwrap();

        assert!(!playback.finished(a.id));
        assert!(playback.finished(b.id));
        // Late notification for an already removed unit.
        assert!(!playback.finished(b.id));
    }

    #[test]
    fn test_bad_fragment_leaves_schedule_intact() {
        let devices = FakeDevices::default();
        let mut playback = scheduler(&devices);
        playback.enqueue(&fragment(2400)).unwrap();

        assert!(matches!(playback.enqueue("%%%"), Err(VoiceError::Decoding(_))));
        assert_eq!(playback.active_count(), 1);
        assert!((playback.next_start_time() - 0.1).abs() < 1e-9);
    }
}
