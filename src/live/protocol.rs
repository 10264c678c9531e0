//! # Live Protocol Messages
//!
//! JSON messages exchanged with the Gemini Live `BidiGenerateContent`
//! WebSocket. Field names are camelCase on the wire.
//!
//! ## Client -> Server:
//! - `{"setup": {...}}` once, right after the socket opens
//! - `{"realtimeInput": {"mediaChunks": [...]}}` for every captured frame
//!
//! ## Server -> Client:
//! - `{"setupComplete": {}}` once the session is ready
//! - `{"serverContent": {...}}` carrying transcripts, audio and turn markers
//! - `{"goAway": {...}}` shortly before the server drops the connection
//!
//! Everything else the server may send is ignored.

use crate::audio::codec::WireAudioBlob;
use crate::error::VoiceError;
use serde::{Deserialize, Serialize};

/// Messages this client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SessionSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(model: &str, voice: &str, system_instruction: &str) -> Self {
        let system_instruction = if system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            })
        };

        ClientMessage::Setup(SessionSetup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: TranscriptionConfig {},
            output_audio_transcription: TranscriptionConfig {},
        })
    }

    pub fn media(blob: WireAudioBlob) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![blob],
        })
    }

    pub fn to_json(&self) -> Result<String, VoiceError> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Backend(format!("failed to encode client message: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub input_audio_transcription: TranscriptionConfig,
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object: its presence turns transcription on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<WireAudioBlob>,
}

/// One message from the server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

/// Audio is always PCM16 at the output rate, so the mime type is not read.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineData {
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Everything the session manager reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    InputTranscript(String),
    OutputTranscript(String),
    /// Base64 PCM16 at the output rate.
    Audio(String),
    Interrupted,
    TurnComplete,
    /// Terminal transport failure.
    Error(VoiceError),
    /// The server closed the socket.
    Closed { code: u16, reason: String },
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, VoiceError> {
        serde_json::from_slice(bytes)
            .map_err(|e| VoiceError::Backend(format!("malformed server message: {}", e)))
    }

    /// Flatten one server message into dispatch order: input transcript,
    /// output transcript, audio parts, interruption, turn completion.
    pub fn into_events(self) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(input) = content.input_transcription {
            events.push(LiveEvent::InputTranscript(input.text.unwrap_or_default()));
        }
        if let Some(output) = content.output_transcription {
            events.push(LiveEvent::OutputTranscript(output.text.unwrap_or_default()));
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    if !inline.data.is_empty() {
                        events.push(LiveEvent::Audio(inline.data));
                    }
                }
            }
        }
        if content.interrupted {
            events.push(LiveEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(LiveEvent::TurnComplete);
        }
        events
    }
}
