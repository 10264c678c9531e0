//! # Audio Module
//!
//! Everything between the sound card and the live session.
//!
//! ## Key Components:
//! - **Codec**: float <-> base64 PCM16 wire encoding
//! - **Capture**: microphone -> fixed frames -> encoded blobs -> session
//! - **Playback**: streamed fragments -> gapless schedule on the output clock
//! - **Mixer**: sample-clock renderer backing the hardware output
//! - **Device**: hardware bindings (cpal, `hardware` feature)
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16 kHz mono, 4096-sample frames
//! - **Playback**: 24 kHz mono
//!
//! Hardware is reached only through the [`AudioDevices`] trait so the voice
//! controller can be exercised without a sound card.

pub mod capture;
pub mod codec;
pub mod device;
#[cfg(any(feature = "hardware", test))]
pub mod mixer;
pub mod playback;

use crate::error::VoiceError;
use std::sync::Arc;

/// Identifier of one scheduled playback unit.
pub type SourceId = u64;

/// Receives captured mono samples at the requested rate, on the device thread.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Invoked from the output thread when a unit finishes playing on its own.
pub type EndedCallback = Arc<dyn Fn(SourceId) + Send + Sync>;

/// A running microphone stream.
pub trait InputStream: Send {
    /// Detach the microphone from the sample callback.
    fn disconnect(&mut self) -> Result<(), VoiceError>;

    /// Stop the hardware tracks and release the input context.
    fn close(&mut self) -> Result<(), VoiceError>;
}

/// An output context with its own clock, in seconds.
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;

    /// Schedule `samples` to start exactly at `start_at` on this output's clock.
    fn start(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> Result<(), VoiceError>;

    /// Stop a unit immediately. No ended notification follows.
    fn stop(&mut self, id: SourceId);
}

/// Factory for input and output contexts.
pub trait AudioDevices: Send + Sync {
    fn open_input(
        &self,
        sample_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>, VoiceError>;

    fn open_output(
        &self,
        sample_rate: u32,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn AudioOutput>, VoiceError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory devices for controller and pipeline tests.

    use super::*;
    use std::sync::Mutex;

    /// Shared record of everything the fake devices were asked to do.
    #[derive(Default)]
    pub struct DeviceLog {
        pub calls: Vec<String>,
        pub started: Vec<(SourceId, usize, f64)>,
        pub stopped: Vec<SourceId>,
        pub now: f64,
        pub input_callback: Option<SampleCallback>,
        pub outputs_opened: usize,
    }

    #[derive(Clone, Default)]
    pub struct FakeDevices {
        pub log: Arc<Mutex<DeviceLog>>,
        pub input_error: Option<VoiceError>,
        pub output_error: Option<VoiceError>,
        pub fail_disconnect: bool,
    }

    impl FakeDevices {
        pub fn denying(err: VoiceError) -> Self {
            Self {
                input_error: Some(err),
                ..Self::default()
            }
        }

        pub fn set_now(&self, now: f64) {
            self.log.lock().unwrap().now = now;
        }

        /// Push samples through the captured microphone callback.
        pub fn feed(&self, samples: &[f32]) {
            let mut callback = self.log.lock().unwrap().input_callback.take();
            if let Some(cb) = callback.as_mut() {
                cb(samples);
            }
            self.log.lock().unwrap().input_callback = callback;
        }

        pub fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().calls.clone()
        }
    }

    struct FakeInput {
        log: Arc<Mutex<DeviceLog>>,
        fail_disconnect: bool,
    }

    impl InputStream for FakeInput {
        fn disconnect(&mut self) -> Result<(), VoiceError> {
            self.log.lock().unwrap().calls.push("input.disconnect".into());
            if self.fail_disconnect {
                return Err(VoiceError::DeviceNotFound("unplugged".into()));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), VoiceError> {
            let mut log = self.log.lock().unwrap();
            log.calls.push("input.close".into());
            log.input_callback = None;
            Ok(())
        }
    }

    struct FakeOutput {
        log: Arc<Mutex<DeviceLog>>,
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.log.lock().unwrap().now
        }

        fn start(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> Result<(), VoiceError> {
            self.log.lock().unwrap().started.push((id, samples.len(), start_at));
            Ok(())
        }

        fn stop(&mut self, id: SourceId) {
            self.log.lock().unwrap().stopped.push(id);
        }
    }

    impl AudioDevices for FakeDevices {
        fn open_input(
            &self,
            _sample_rate: u32,
            on_samples: SampleCallback,
        ) -> Result<Box<dyn InputStream>, VoiceError> {
            if let Some(err) = &self.input_error {
                return Err(err.clone());
            }
            let mut log = self.log.lock().unwrap();
            log.calls.push("input.open".into());
            log.input_callback = Some(on_samples);
            Ok(Box::new(FakeInput {
                log: self.log.clone(),
                fail_disconnect: self.fail_disconnect,
            }))
        }

        fn open_output(
            &self,
            _sample_rate: u32,
            _on_ended: EndedCallback,
        ) -> Result<Box<dyn AudioOutput>, VoiceError> {
            if let Some(err) = &self.output_error {
                return Err(err.clone());
            }
            self.log.lock().unwrap().outputs_opened += 1;
            Ok(Box::new(FakeOutput { log: self.log.clone() }))
        }
    }
}
