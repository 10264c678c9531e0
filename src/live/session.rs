//! # Voice Session Controller
//!
//! Owns every piece of voice-session state and is the only place that state
//! changes. All inputs arrive as [`ControlEvent`]s on one channel, and one
//! task processes them in order:
//!
//! - commands from the HTTP API (start, stop, credential, snapshot)
//! - the result of a connect attempt
//! - inbound server events, already flattened into dispatch order
//! - playback completions from the output device thread
//!
//! ## State Machine:
//! ```text
//! Idle -> Connecting -> Open -> Closed -> Idle
//!            \           \
//!             `-> Errored <'-> Idle
//! ```
//! `Closed` and `Errored` are transient: the same event that enters them
//! runs the full teardown and lands back in `Idle`.
//!
//! ## Session Epochs:
//! Every start and stop bumps the epoch. Connect results and server events
//! carry the epoch they were issued under and are ignored once it is stale,
//! so a late close after a user stop never surfaces as an error, and a
//! connect that resolves after stop is closed straight away.
//!
//! Every state change, transcript update and error is broadcast as a
//! [`VoiceEvent`] for connected UIs.

use crate::audio::capture::{CapturePipeline, CaptureSettings};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::{AudioDevices, EndedCallback, SourceId};
use crate::error::{AppError, ErrorKind, VoiceError};
use crate::live::connection::{ConnectRequest, InboundSink, LiveBackend, LiveSession};
use crate::live::protocol::LiveEvent;
use crate::transcription::TranscriptionAggregator;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffered events per UI subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Persona and backend selection for one session.
#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub persona_name: String,
    pub system_instruction: String,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
}

/// Fixed audio parameters of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub capture: CaptureSettings,
    pub output_sample_rate: u32,
}

/// Everything the controller reacts to.
pub enum ControlEvent {
    Start(VoiceProfile),
    Stop,
    ProvideCredential(String),
    Snapshot(oneshot::Sender<VoiceSnapshot>),
    Connected {
        epoch: u64,
        result: Result<LiveSession, VoiceError>,
    },
    Live {
        epoch: u64,
        event: LiveEvent,
    },
    PlaybackEnded(SourceId),
    Shutdown,
}

/// The one user-facing message for an escalated error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Pushed to every UI subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    StateChanged { state: SessionState },
    InputTranscript { text: String },
    OutputTranscript { text: String },
    TurnCompleted { user: String, assistant: String },
    Speaking { speaking: bool },
    Error { kind: ErrorKind, message: String },
    ErrorCleared,
    ConversationCleared,
    CredentialChanged { ready: bool },
}

/// Point-in-time view of the voice component.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceSnapshot {
    pub state: SessionState,
    pub speaking: bool,
    pub active_playback: usize,
    pub persona_name: String,
    pub input_transcript: String,
    pub output_transcript: String,
    pub history: Vec<String>,
    pub error: Option<ErrorReport>,
    pub credential_ready: bool,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// Cloneable front door to the controller task.
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::UnboundedSender<ControlEvent>,
    events: broadcast::Sender<VoiceEvent>,
}

impl fmt::Debug for VoiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceHandle")
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl VoiceHandle {
    fn send(&self, event: ControlEvent) -> Result<(), AppError> {
        self.commands
            .send(event)
            .map_err(|_| AppError::Unavailable("voice controller is not running".to_string()))
    }

    pub fn start(&self, profile: VoiceProfile) -> Result<(), AppError> {
        self.send(ControlEvent::Start(profile))
    }

    pub fn stop(&self) -> Result<(), AppError> {
        self.send(ControlEvent::Stop)
    }

    pub fn provide_credential(&self, api_key: String) -> Result<(), AppError> {
        self.send(ControlEvent::ProvideCredential(api_key))
    }

    /// Ask the controller for its state. Queued behind earlier commands.
    pub async fn snapshot(&self) -> Result<VoiceSnapshot, AppError> {
        let (reply, response) = oneshot::channel();
        self.send(ControlEvent::Snapshot(reply))?;
        response
            .await
            .map_err(|_| AppError::Unavailable("voice controller dropped the request".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Stop any session and end the controller task.
    pub fn shutdown(&self) {
        if self.commands.send(ControlEvent::Shutdown).is_err() {
            debug!("Voice controller already stopped");
        }
    }
}

pub struct VoiceController {
    devices: Arc<dyn AudioDevices>,
    backend: Arc<dyn LiveBackend>,
    capture_settings: CaptureSettings,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    events: broadcast::Sender<VoiceEvent>,

    state: SessionState,
    epoch: u64,
    session: Option<LiveSession>,
    capture: Option<CapturePipeline>,
    playback: PlaybackScheduler,
    transcripts: TranscriptionAggregator,
    persona_name: String,
    credential: Option<String>,
    last_error: Option<ErrorReport>,
    speaking: bool,
}

impl VoiceController {
    pub fn new(
        devices: Arc<dyn AudioDevices>,
        backend: Arc<dyn LiveBackend>,
        settings: ControllerSettings,
        credential: Option<String>,
    ) -> (Self, VoiceHandle, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let ended_tx = control_tx.clone();
        let on_ended: EndedCallback = Arc::new(move |id: SourceId| {
            let _ = ended_tx.send(ControlEvent::PlaybackEnded(id));
        });
        let playback = PlaybackScheduler::new(devices.clone(), settings.output_sample_rate, on_ended);

        let handle = VoiceHandle {
            commands: control_tx.clone(),
            events: events.clone(),
        };

        let controller = Self {
            devices,
            backend,
            capture_settings: settings.capture,
            control_tx,
            events,
            state: SessionState::Idle,
            epoch: 0,
            session: None,
            capture: None,
            playback,
            transcripts: TranscriptionAggregator::new(),
            persona_name: String::new(),
            credential: credential.filter(|key| !key.trim().is_empty()),
            last_error: None,
            speaking: false,
        };
        (controller, handle, control_rx)
    }

    /// Build the controller and run it on `runtime`. Device opens and closes
    /// block briefly, so production gives the controller a multi-thread
    /// runtime of its own.
    pub fn spawn_on(
        runtime: &Handle,
        devices: Arc<dyn AudioDevices>,
        backend: Arc<dyn LiveBackend>,
        settings: ControllerSettings,
        credential: Option<String>,
    ) -> (VoiceHandle, JoinHandle<()>) {
        let (controller, handle, events) = Self::new(devices, backend, settings, credential);
        let task = runtime.spawn(controller.run(events));
        (handle, task)
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ControlEvent>) {
        info!(credential_ready = self.credential.is_some(), "Voice controller started");
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.stop();
        info!("Voice controller stopped");
    }

    /// Process one event. Returns `false` once the controller should exit.
    pub fn handle(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Start(profile) => self.start(profile),
            ControlEvent::Stop => self.stop(),
            ControlEvent::ProvideCredential(key) => self.provide_credential(key),
            ControlEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ControlEvent::Connected { epoch, result } => self.on_connected(epoch, result),
            ControlEvent::Live { epoch, event } => self.on_live(epoch, event),
            ControlEvent::PlaybackEnded(id) => {
                if self.playback.finished(id) {
                    self.set_speaking(false);
                }
            }
            ControlEvent::Shutdown => return false,
        }
        true
    }

    fn start(&mut self, profile: VoiceProfile) {
        if self.state != SessionState::Idle {
            debug!(state = ?self.state, "Start ignored: a session is already active");
            return;
        }

        self.clear_error();
        let Some(api_key) = self.credential.clone() else {
            self.report(VoiceError::MissingCredential);
            return;
        };

        self.epoch += 1;
        let epoch = self.epoch;
        self.persona_name = profile.persona_name.clone();
        self.set_state(SessionState::Connecting);
        self.transcripts.reset();
        self.broadcast(VoiceEvent::ConversationCleared);
        self.playback.reset();
        self.set_speaking(false);

        match CapturePipeline::open(self.devices.as_ref(), &self.capture_settings) {
            Ok(capture) => self.capture = Some(capture),
            Err(err) => {
                self.report(err);
                self.stop();
                return;
            }
        }

        let request = ConnectRequest {
            endpoint: profile.endpoint,
            api_key,
            model: profile.model,
            voice: profile.voice,
            system_instruction: profile.system_instruction,
        };
        let inbound_tx = self.control_tx.clone();
        let inbound: InboundSink = Arc::new(move |event: LiveEvent| {
            let _ = inbound_tx.send(ControlEvent::Live { epoch, event });
        });
        let connecting = self.backend.connect(request, inbound);
        let result_tx = self.control_tx.clone();
        tokio::spawn(async move {
            let result = connecting.await;
            let _ = result_tx.send(ControlEvent::Connected { epoch, result });
        });

        info!(epoch, persona = %self.persona_name, "Voice session starting");
    }

    /// Full teardown. Safe to call in any state, any number of times.
    fn stop(&mut self) {
        self.epoch += 1;

        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        self.playback.reset();
        self.set_speaking(false);
        self.set_state(SessionState::Idle);
    }

    fn on_connected(&mut self, epoch: u64, result: Result<LiveSession, VoiceError>) {
        if epoch != self.epoch || self.state != SessionState::Connecting {
            match result {
                Ok(session) => {
                    debug!(epoch, "Closing session that connected after stop");
                    session.close();
                }
                Err(err) => debug!(epoch, error = %err, "Ignoring stale connect failure"),
            }
            return;
        }

        match result {
            Ok(session) => {
                if let Some(capture) = &self.capture {
                    capture.arm(session.media_sink());
                }
                self.session = Some(session);
                self.set_state(SessionState::Open);
            }
            Err(err) => {
                self.set_state(SessionState::Errored);
                self.report(err);
                self.stop();
            }
        }
    }

    fn on_live(&mut self, epoch: u64, event: LiveEvent) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Ignoring event from a previous session");
            return;
        }

        match event {
            LiveEvent::InputTranscript(fragment) => {
                let text = self.transcripts.append_input(&fragment).to_string();
                self.broadcast(VoiceEvent::InputTranscript { text });
            }
            LiveEvent::OutputTranscript(fragment) => {
                let text = self.transcripts.append_output(&fragment).to_string();
                self.broadcast(VoiceEvent::OutputTranscript { text });
            }
            LiveEvent::Audio(fragment) => {
                self.set_speaking(true);
                if let Err(err) = self.playback.enqueue(&fragment) {
                    self.report(err);
                    if !self.playback.is_speaking() {
                        self.set_speaking(false);
                    }
                }
            }
            LiveEvent::Interrupted => {
                self.playback.interrupt();
                self.set_speaking(false);
            }
            LiveEvent::TurnComplete => {
                let turn = self.transcripts.complete_turn(&self.persona_name);
                self.broadcast(VoiceEvent::TurnCompleted {
                    user: turn.user,
                    assistant: turn.assistant,
                });
            }
            LiveEvent::Error(err) => {
                self.set_state(SessionState::Errored);
                self.report(err);
                self.stop();
            }
            LiveEvent::Closed { code, reason } => {
                self.set_state(SessionState::Closed);
                self.report(VoiceError::Closed { code, reason });
                self.stop();
            }
        }
    }

    fn provide_credential(&mut self, api_key: String) {
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            warn!("Ignoring empty API key");
            return;
        }
        self.credential = Some(api_key);
        self.clear_error();
        self.broadcast(VoiceEvent::CredentialChanged { ready: true });
        info!("API key provisioned");
    }

    /// The single generic error handler: classify, log, apply side effects,
    /// publish exactly one message.
    fn report(&mut self, err: VoiceError) {
        let (kind, message) = ErrorKind::describe(&err);
        error!(kind = %kind, error = %err, state = ?self.state, "Voice session error");

        if kind == ErrorKind::Authentication {
            self.transcripts.reset();
            self.credential = None;
            self.broadcast(VoiceEvent::ConversationCleared);
            self.broadcast(VoiceEvent::CredentialChanged { ready: false });
        }

        self.last_error = Some(ErrorReport {
            kind,
            message: message.clone(),
        });
        self.broadcast(VoiceEvent::Error { kind, message });
    }

    fn clear_error(&mut self) {
        if self.last_error.take().is_some() {
            self.broadcast(VoiceEvent::ErrorCleared);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "Voice session state changed");
            self.state = state;
            self.broadcast(VoiceEvent::StateChanged { state });
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            self.broadcast(VoiceEvent::Speaking { speaking });
        }
    }

    fn broadcast(&self, event: VoiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        let (frames_sent, frames_dropped) = self
            .capture
            .as_ref()
            .map(|c| (c.slot().frames_sent(), c.slot().frames_dropped()))
            .unwrap_or((0, 0));

        VoiceSnapshot {
            state: self.state,
            speaking: self.speaking,
            active_playback: self.playback.active_count(),
            persona_name: self.persona_name.clone(),
            input_transcript: self.transcripts.input().to_string(),
            output_transcript: self.transcripts.output().to_string(),
            history: self.transcripts.history().to_vec(),
            error: self.last_error.clone(),
            credential_ready: self.credential.is_some(),
            frames_sent,
            frames_dropped,
        }
    }
}
