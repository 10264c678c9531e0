//! # Audio Devices
//!
//! Hardware bindings for [`AudioDevices`].
//!
//! With the `hardware` feature the default input and output devices are opened
//! through cpal. cpal streams are not `Send`, so each one lives on its own
//! thread and is driven through a command channel; the handles returned here
//! only hold the channel and the join handle.
//!
//! Without the feature every request fails with `DeviceNotFound`, which is
//! what a headless deployment reports when a session is started.

use crate::audio::{AudioDevices, AudioOutput, EndedCallback, InputStream, SampleCallback};
use crate::error::VoiceError;
use std::sync::Arc;

/// Device factory for builds without audio hardware support.
#[derive(Debug, Default, Clone)]
pub struct UnavailableDevices;

impl AudioDevices for UnavailableDevices {
    fn open_input(
        &self,
        _sample_rate: u32,
        _on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>, VoiceError> {
        Err(VoiceError::DeviceNotFound(
            "no microphone available: built without the `hardware` feature".to_string(),
        ))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        _on_ended: EndedCallback,
    ) -> Result<Box<dyn AudioOutput>, VoiceError> {
        Err(VoiceError::DeviceNotFound(
            "no output device available: built without the `hardware` feature".to_string(),
        ))
    }
}

/// The device factory this binary was built with.
pub fn default_devices() -> Arc<dyn AudioDevices> {
    #[cfg(feature = "hardware")]
    {
        Arc::new(cpal_backend::CpalDevices::new())
    }
    #[cfg(not(feature = "hardware"))]
    {
        Arc::new(UnavailableDevices)
    }
}

/// Run a wait on a device thread without stalling other tasks of a
/// multi-thread runtime. Elsewhere the closure just runs inline.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
pub(crate) fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Map a backend-specific stream failure. Only text that reads like an OS
/// refusal is treated as a permission problem.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
pub(crate) fn classify_backend_failure(description: &str) -> VoiceError {
    let lower = description.to_lowercase();
    let refused = ["permission", "denied", "not authorized", "unauthorized", "not permitted"]
        .iter()
        .any(|needle| lower.contains(needle));
    if refused {
        VoiceError::Permission(description.to_string())
    } else {
        VoiceError::DeviceNotFound(description.to_string())
    }
}

/// Streaming linear-interpolation resampler for mono input.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
pub(crate) struct LinearResampler {
    step: f64,
    // Read position; index 0 is the last sample of the previous block.
    position: f64,
    previous: f32,
}

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
impl LinearResampler {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            position: 1.0,
            previous: 0.0,
        }
    }

    pub(crate) fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        let previous = self.previous;
        let sample_at = |i: usize| if i == 0 { previous } else { input[i - 1] };

        let len = input.len() as f64;
        while self.position < len {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = sample_at(index);
            let b = sample_at(index + 1);
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.position -= len;
        self.previous = input[input.len() - 1];
    }
}

#[cfg(feature = "hardware")]
mod cpal_backend {
    use super::{classify_backend_failure, run_blocking, LinearResampler};
    use crate::audio::mixer::Mixer;
    use crate::audio::{
        AudioDevices, AudioOutput, EndedCallback, InputStream, SampleCallback, SourceId,
    };
    use crate::error::VoiceError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SizedSample};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread::{self, JoinHandle};
    use tracing::{error, info, warn};

    enum StreamCommand {
        Pause,
        Close,
    }

    type Ready = mpsc::SyncSender<Result<u32, VoiceError>>;

    fn build_error(err: cpal::BuildStreamError) -> VoiceError {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceNotFound("audio device is not available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                classify_backend_failure(&err.description)
            }
            other => VoiceError::DeviceNotFound(other.to_string()),
        }
    }

    #[derive(Default)]
    pub struct CpalDevices;

    impl CpalDevices {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioDevices for CpalDevices {
        fn open_input(
            &self,
            sample_rate: u32,
            on_samples: SampleCallback,
        ) -> Result<Box<dyn InputStream>, VoiceError> {
            let (commands, command_rx) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::sync_channel(1);

            let thread = thread::Builder::new()
                .name("voice-capture".to_string())
                .spawn(move || run_input(sample_rate, on_samples, command_rx, ready_tx))
                .map_err(|e| VoiceError::DeviceNotFound(format!("failed to spawn capture thread: {}", e)))?;

            let device_rate = run_blocking(|| ready_rx.recv()).map_err(|_| {
                VoiceError::DeviceNotFound("capture thread exited during setup".to_string())
            })??;
            info!(device_rate, target_rate = sample_rate, "Microphone opened");

            Ok(Box::new(CpalInput {
                commands,
                thread: Some(thread),
            }))
        }

        fn open_output(
            &self,
            sample_rate: u32,
            on_ended: EndedCallback,
        ) -> Result<Box<dyn AudioOutput>, VoiceError> {
            let (commands, command_rx) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::sync_channel(1);
            let (mixer_tx, mixer_rx) = mpsc::sync_channel(1);

            let thread = thread::Builder::new()
                .name("voice-playback".to_string())
                .spawn(move || run_output(sample_rate, on_ended, command_rx, ready_tx, mixer_tx))
                .map_err(|e| VoiceError::DeviceNotFound(format!("failed to spawn playback thread: {}", e)))?;

            let device_rate = run_blocking(|| ready_rx.recv()).map_err(|_| {
                VoiceError::DeviceNotFound("playback thread exited during setup".to_string())
            })??;
            let mixer = run_blocking(|| mixer_rx.recv()).map_err(|_| {
                VoiceError::DeviceNotFound("playback thread exited during setup".to_string())
            })?;
            info!(device_rate, source_rate = sample_rate, "Output device opened");

            Ok(Box::new(CpalOutput {
                mixer,
                commands,
                thread: Some(thread),
            }))
        }
    }

    fn run_input(
        target_rate: u32,
        on_samples: SampleCallback,
        commands: mpsc::Receiver<StreamCommand>,
        ready: Ready,
    ) {
        let stream = match build_input(target_rate, on_samples) {
            Ok((stream, device_rate)) => {
                let _ = ready.send(Ok(device_rate));
                stream
            }
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };

        // Runs until Close or until the handle is dropped.
        while let Ok(command) = commands.recv() {
            match command {
                StreamCommand::Pause => {
                    if let Err(e) = stream.pause() {
                        warn!(error = %e, "Failed to pause input stream");
                    }
                }
                StreamCommand::Close => break,
            }
        }
        drop(stream);
        info!("Capture thread finished");
    }

    fn build_input(
        target_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<(cpal::Stream, u32), VoiceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceNotFound("no default input device".to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceNotFound(format!("no usable input config: {}", e)))?;
        let config: cpal::StreamConfig = supported.config();
        let device_rate = config.sample_rate.0;

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => input_stream::<f32>(&device, &config, target_rate, on_samples),
            cpal::SampleFormat::I16 => input_stream::<i16>(&device, &config, target_rate, on_samples),
            cpal::SampleFormat::U16 => input_stream::<u16>(&device, &config, target_rate, on_samples),
            other => Err(VoiceError::DeviceNotFound(format!(
                "unsupported input sample format: {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::Permission(format!("failed to start input stream: {}", e)))?;
        Ok((stream, device_rate))
    }

    fn input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        target_rate: u32,
        mut on_samples: SampleCallback,
    ) -> Result<cpal::Stream, VoiceError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        let mut resampler = LinearResampler::new(config.sample_rate.0, target_rate);
        let mut mono = Vec::new();
        let mut resampled = Vec::new();

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    for frame in data.chunks(channels) {
                        let sum: f32 = frame.iter().map(|&s| f32::from_sample_(s)).sum();
                        mono.push(sum / frame.len() as f32);
                    }
                    resampled.clear();
                    resampler.process(&mono, &mut resampled);
                    if !resampled.is_empty() {
                        on_samples(&resampled);
                    }
                },
                |err| error!(error = %err, "Input stream error"),
                None,
            )
            .map_err(build_error)
    }

    fn run_output(
        source_rate: u32,
        on_ended: EndedCallback,
        commands: mpsc::Receiver<StreamCommand>,
        ready: Ready,
        mixer_out: mpsc::SyncSender<Arc<Mutex<Mixer>>>,
    ) {
        let (stream, mixer, device_rate) = match build_output(source_rate, on_ended) {
            Ok(parts) => parts,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(device_rate));
        let _ = mixer_out.send(mixer);

        while let Ok(command) = commands.recv() {
            match command {
                StreamCommand::Pause => {
                    if let Err(e) = stream.pause() {
                        warn!(error = %e, "Failed to pause output stream");
                    }
                }
                StreamCommand::Close => break,
            }
        }
        drop(stream);
        info!("Playback thread finished");
    }

    fn build_output(
        source_rate: u32,
        on_ended: EndedCallback,
    ) -> Result<(cpal::Stream, Arc<Mutex<Mixer>>, u32), VoiceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VoiceError::DeviceNotFound("no default output device".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| VoiceError::DeviceNotFound(format!("no usable output config: {}", e)))?;
        let config: cpal::StreamConfig = supported.config();
        let device_rate = config.sample_rate.0;
        let mixer = Arc::new(Mutex::new(Mixer::new(source_rate, device_rate)));

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => output_stream::<f32>(&device, &config, mixer.clone(), on_ended),
            cpal::SampleFormat::I16 => output_stream::<i16>(&device, &config, mixer.clone(), on_ended),
            cpal::SampleFormat::U16 => output_stream::<u16>(&device, &config, mixer.clone(), on_ended),
            other => Err(VoiceError::DeviceNotFound(format!(
                "unsupported output sample format: {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::DeviceNotFound(format!("failed to start output stream: {}", e)))?;
        Ok((stream, mixer, device_rate))
    }

    fn output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mixer: Arc<Mutex<Mixer>>,
        on_ended: EndedCallback,
    ) -> Result<cpal::Stream, VoiceError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let mut scratch = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.clear();
                    scratch.resize(data.len(), 0.0f32);
                    let ended = mixer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .render(&mut scratch, channels);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample_(sample);
                    }
                    for id in ended {
                        on_ended(id);
                    }
                },
                |err| error!(error = %err, "Output stream error"),
                None,
            )
            .map_err(build_error)
    }

    struct CpalInput {
        commands: mpsc::Sender<StreamCommand>,
        thread: Option<JoinHandle<()>>,
    }

    impl InputStream for CpalInput {
        fn disconnect(&mut self) -> Result<(), VoiceError> {
            self.commands
                .send(StreamCommand::Pause)
                .map_err(|_| VoiceError::DeviceNotFound("capture thread is gone".to_string()))
        }

        fn close(&mut self) -> Result<(), VoiceError> {
            let _ = self.commands.send(StreamCommand::Close);
            if let Some(thread) = self.thread.take() {
                run_blocking(|| thread.join())
                    .map_err(|_| VoiceError::DeviceNotFound("capture thread panicked".to_string()))?;
            }
            Ok(())
        }
    }

    impl Drop for CpalInput {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }

    struct CpalOutput {
        mixer: Arc<Mutex<Mixer>>,
        commands: mpsc::Sender<StreamCommand>,
        thread: Option<JoinHandle<()>>,
    }

    impl AudioOutput for CpalOutput {
        fn current_time(&self) -> f64 {
            self.mixer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .current_time()
        }

        fn start(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> Result<(), VoiceError> {
            self.mixer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .schedule(id, samples, start_at);
            Ok(())
        }

        fn stop(&mut self, id: SourceId) {
            self.mixer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel(id);
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            let _ = self.commands.send(StreamCommand::Close);
            if let Some(thread) = self.thread.take() {
                if run_blocking(|| thread.join()).is_err() {
                    error!("Playback thread panicked");
                }
            }
        }
    }
}
