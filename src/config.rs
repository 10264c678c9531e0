//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`)
//! - Environment variables (`APP__SECTION__KEY`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables `HOST`, `PORT` and `API_KEY`
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__BACKEND__VOICE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! The double-underscore separator keeps keys such as `system_instruction`
//! and `frame_size` intact.

use crate::audio::capture::CaptureSettings;
use crate::live::{ControllerSettings, VoiceProfile};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub audio: AudioConfig,
    pub persona: PersonaConfig,
}

/// Where the control API listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The streaming voice backend.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the live API (the key is appended as `?key=`)
/// - `model`: native-audio model name
/// - `voice`: prebuilt voice used for responses
/// - `api_key`: optional; can also be provided at runtime through the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

/// Fixed audio parameters of the live protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
}

/// Display name and instruction of the assistant persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    pub system_instruction: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            backend: BackendConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                api_key: None,
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                frame_size: 4096,
            },
            persona: PersonaConfig {
                name: "Assistant".to_string(),
                system_instruction: String::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`
    /// - `APP__PERSONA__NAME=Aria`
    /// - `APP__BACKEND__VOICE=Puck`
    /// - `HOST=0.0.0.0`, `PORT=3000`: deployment platforms
    /// - `API_KEY=...`: backend credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("backend.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the voice pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.backend.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend model cannot be empty"));
        }

        if self.backend.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend endpoint cannot be empty"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, then re-validate.
    ///
    /// Only the server, backend model/voice and persona can change at
    /// runtime. For example `{"persona": {"name": "Aria"}}` renames the
    /// persona for the next session and leaves everything else alone.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(backend) = partial_config.get("backend") {
            if let Some(model) = backend.get("model").and_then(|v| v.as_str()) {
                self.backend.model = model.to_string();
            }
            if let Some(voice) = backend.get("voice").and_then(|v| v.as_str()) {
                self.backend.voice = voice.to_string();
            }
        }

        if let Some(persona) = partial_config.get("persona") {
            if let Some(name) = persona.get("name").and_then(|v| v.as_str()) {
                self.persona.name = name.to_string();
            }
            if let Some(instruction) = persona.get("system_instruction").and_then(|v| v.as_str()) {
                self.persona.system_instruction = instruction.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Persona and backend selection for the next session.
    pub fn voice_profile(&self) -> VoiceProfile {
        VoiceProfile {
            persona_name: self.persona.name.clone(),
            system_instruction: self.persona.system_instruction.clone(),
            endpoint: self.backend.endpoint.clone(),
            model: self.backend.model.clone(),
            voice: self.backend.voice.clone(),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            capture: CaptureSettings {
                sample_rate: self.audio.input_sample_rate,
                frame_size: self.audio.frame_size,
            },
            output_sample_rate: self.audio.output_sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backend.voice, "Zephyr");
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.frame_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.model = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"persona": {"name": "Aria"}, "backend": {"voice": "Puck"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.persona.name, "Aria");
        assert_eq!(config.backend.voice, "Puck");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"backend": {"model": ""}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn test_api_key_is_never_serialized() {
        let mut config = AppConfig::default();
        config.backend.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_profile_and_settings_follow_config() {
        let mut config = AppConfig::default();
        config.persona.name = "Aria".to_string();
        let profile = config.voice_profile();
        assert_eq!(profile.persona_name, "Aria");
        assert_eq!(profile.voice, "Zephyr");

        let settings = config.controller_settings();
        assert_eq!(settings.capture.frame_size, 4096);
        assert_eq!(settings.output_sample_rate, 24000);
    }
}
