//! # Audio Capture Pipeline
//!
//! Bridges the microphone to the live session:
//!
//! 1. The device delivers mono samples at 16 kHz in whatever block size it likes.
//! 2. [`FrameChunker`] regroups them into fixed frames (4096 samples).
//! 3. Each completed frame is encoded synchronously with the PCM codec.
//! 4. The blob goes to whatever sink is armed in the [`SendSlot`].
//!
//! The slot is empty until the session has connected. Frames captured before
//! that, or after the session is gone, are dropped with a warning; a failed send
//! never stops capture.

use crate::audio::codec::{self, WireAudioBlob};
use crate::audio::{AudioDevices, InputStream};
use crate::error::VoiceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Destination for encoded frames (the open session's outbound path).
pub trait MediaSink: Send + Sync {
    fn send_media(&self, blob: WireAudioBlob) -> Result<(), VoiceError>;
}

/// Capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub sample_rate: u32,
    pub frame_size: usize,
}

/// Regroups arbitrary sample blocks into fixed-size frames.
pub struct FrameChunker {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples, calling `emit` once per completed frame, in order.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The nullable send callback shared with the device thread.
#[derive(Clone, Default)]
pub struct SendSlot {
    sink: Arc<Mutex<Option<Arc<dyn MediaSink>>>>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SendSlot {
    pub fn arm(&self, sink: Arc<dyn MediaSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn disarm(&self) {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_armed(&self) -> bool {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Fire-and-forget one frame. Failures are logged and counted, never raised.
    pub fn dispatch(&self, blob: WireAudioBlob) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => match sink.send_media(blob) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "Failed to send realtime input frame");
                }
            },
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping captured frame: live session is not open yet");
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live microphone feeding the send slot.
pub struct CapturePipeline {
    stream: Option<Box<dyn InputStream>>,
    slot: SendSlot,
}

impl CapturePipeline {
    /// Acquire the microphone and start framing. The slot starts disarmed.
    pub fn open(devices: &dyn AudioDevices, settings: &CaptureSettings) -> Result<Self, VoiceError> {
        let slot = SendSlot::default();
        let frame_slot = slot.clone();
        let rate = settings.sample_rate;
        let mut chunker = FrameChunker::new(settings.frame_size);

        let stream = devices.open_input(
            rate,
            Box::new(move |samples: &[f32]| {
                chunker.push(samples, |frame| {
                    frame_slot.dispatch(codec::encode_frame(frame, rate));
                });
            }),
        )?;

        info!(
            sample_rate = settings.sample_rate,
            frame_size = settings.frame_size,
            "Microphone capture started"
        );

        Ok(Self {
            stream: Some(stream),
            slot,
        })
    }

    /// Route frames to the session from now on.
    pub fn arm(&self, sink: Arc<dyn MediaSink>) {
        self.slot.arm(sink);
        debug!("Capture send callback armed");
    }

    pub fn slot(&self) -> &SendSlot {
        &self.slot
    }

    /// Best-effort teardown: null the callback, detach the microphone, close
    /// the device. Every step runs even if an earlier one fails.
    pub fn shutdown(&mut self) {
        self.slot.disarm();

        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.disconnect() {
                warn!(error = %err, "Failed to disconnect microphone source");
            }
            if let Err(err) = stream.close() {
                warn!(error = %err, "Failed to close input audio context");
            }
        }

        info!(
            frames_sent = self.slot.frames_sent(),
            frames_dropped = self.slot.frames_dropped(),
            "Microphone capture stopped"
        );
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeDevices;

    #[derive(Default)]
    struct RecordingSink {
        blobs: Mutex<Vec<WireAudioBlob>>,
        fail: bool,
    }

    impl MediaSink for RecordingSink {
        fn send_media(&self, blob: WireAudioBlob) -> Result<(), VoiceError> {
            if self.fail {
                return Err(VoiceError::SessionNotReady("closed".into()));
            }
            self.blobs.lock().unwrap().push(blob);
            Ok(())
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            sample_rate: 16000,
            frame_size: 4,
        }
    }

    #[test]
    fn test_chunker_emits_fixed_frames_in_order() {
        let mut chunker = FrameChunker::new(4);
        let mut frames = Vec::new();

        chunker.push(&[1.0, 2.0, 3.0], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        chunker.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f.to_vec()));

        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(chunker.pending_len(), 1);
    }

    #[test]
    fn test_frames_before_arming_are_dropped() {
        let devices = FakeDevices::default();
        let pipeline = CapturePipeline::open(&devices, &settings()).unwrap();

        devices.feed(&[0.1; 8]);
        assert_eq!(pipeline.slot().frames_dropped(), 2);
        assert_eq!(pipeline.slot().frames_sent(), 0);

        let sink = Arc::new(RecordingSink::default());
        pipeline.arm(sink.clone());
        devices.feed(&[0.5; 12]);

        let blobs = sink.blobs.lock().unwrap();
        assert_eq!(blobs.len(), 3);
        assert!(blobs.iter().all(|b| b.mime_type == "audio/pcm;rate=16000"));
        assert_eq!(codec::decode_base64(&blobs[0].data).unwrap().len(), 8);
    }

    #[test]
    fn test_send_failures_do_not_stop_capture() {
        let devices = FakeDevices::default();
        let pipeline = CapturePipeline::open(&devices, &settings()).unwrap();
        pipeline.arm(Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        }));

        devices.feed(&[0.0; 8]);
        devices.feed(&[0.0; 8]);
        assert_eq!(pipeline.slot().frames_dropped(), 4);
        assert!(pipeline.slot().is_armed());
    }

    #[test]
    fn test_shutdown_attempts_every_step() {
        let devices = FakeDevices {
            fail_disconnect: true,
            ..Default::default()
        };
        let mut pipeline = CapturePipeline::open(&devices, &settings()).unwrap();
        pipeline.arm(Arc::new(RecordingSink::default()));

        pipeline.shutdown();
        pipeline.shutdown();

        assert!(!pipeline.slot().is_armed());
        assert_eq!(devices.calls(), vec!["input.open", "input.disconnect", "input.close"]);
    }

    #[test]
    fn test_open_propagates_permission_error() {
        let devices = FakeDevices::denying(VoiceError::Permission("denied".into()));
        let result = CapturePipeline::open(&devices, &settings());
        assert!(matches!(result, Err(VoiceError::Permission(_))));
    }
}
