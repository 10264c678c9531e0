//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`VoiceError`**: everything that can go wrong inside the voice pipeline
//!   (microphone, live connection, audio decoding). These never become HTTP
//!   responses directly; they flow into the voice controller's single error
//!   reporter, which classifies them into an [`ErrorKind`] and produces exactly
//!   one user-facing message.
//! - **`AppError`**: failures of the HTTP control API, converted into JSON error
//!   responses through actix's `ResponseError` trait.
//!
//! ## Classification Order:
//! 1. Message text that identifies a credential or project problem wins over
//!    the structured type (the backend reports those as plain text).
//! 2. The structured `VoiceError` variant.
//! 3. Text fallbacks for otherwise uninformative errors.

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Errors raised by capture, playback and the live session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access was denied.
    #[error("microphone permission denied: {0}")]
    Permission(String),

    /// No usable microphone or speaker.
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    /// The backend was reached but rejected or terminated the session.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend closed the session with a close code and reason.
    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// Transport-level failure without a structured backend error.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed audio payload.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// No credential has been provisioned for the backend.
    #[error("no API key has been provided")]
    MissingCredential,

    /// The session was used after it was closed, or before it opened.
    #[error("session not ready: {0}")]
    SessionNotReady(String),

    /// Backend error with nothing but its message text.
    #[error("{0}")]
    Backend(String),
}

/// User-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    DeviceNotFound,
    Connection,
    Network,
    Decoding,
    Authentication,
    Configuration,
    Unknown,
}

impl ErrorKind {
    /// Classify a pipeline error.
    pub fn classify(err: &VoiceError) -> Self {
        let lower = err.to_string().to_lowercase();

        if lower.contains("api key not valid") || lower.contains("requested entity was not found") {
            return ErrorKind::Authentication;
        }
        if lower.contains("api has not been used in project") {
            return ErrorKind::Configuration;
        }
        if lower.contains("rpc failed due to xhr error") {
            return ErrorKind::Network;
        }

        match err {
            VoiceError::Permission(_) => ErrorKind::Permission,
            VoiceError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            VoiceError::Connection(_) | VoiceError::Closed { .. } => ErrorKind::Connection,
            VoiceError::Network(_) => ErrorKind::Network,
            VoiceError::Decoding(_) => ErrorKind::Decoding,
            VoiceError::MissingCredential => ErrorKind::Authentication,
            VoiceError::SessionNotReady(_) | VoiceError::Backend(_) => {
                if lower.contains("failed to fetch")
                    || lower.contains("network request failed")
                    || lower.contains("network error")
                {
                    ErrorKind::Network
                } else if lower.contains("websocket")
                    && (lower.contains("closed") || lower.contains("disconnected"))
                {
                    ErrorKind::Connection
                } else {
                    ErrorKind::Unknown
                }
            }
        }
    }

    /// Kind and user-facing message for one escalated error.
    pub fn describe(err: &VoiceError) -> (Self, String) {
        let kind = Self::classify(err);
        let message = match err {
            VoiceError::MissingCredential => {
                "An API key is required for voice chat. Please provide one to continue.".to_string()
            }
            _ => kind.user_message(&err.to_string()),
        };
        (kind, message)
    }

    /// The single human-readable message shown for this kind.
    ///
    /// Raw error text only appears for `Unknown`.
    pub fn user_message(&self, raw: &str) -> String {
        match self {
            ErrorKind::Permission => {
                "Microphone permission is required for voice chat. Please grant access and try again."
                    .to_string()
            }
            ErrorKind::DeviceNotFound => {
                "No usable audio device was found. Please check that a microphone and speaker are connected and try again."
                    .to_string()
            }
            ErrorKind::Connection => {
                "The voice connection was lost unexpectedly. Please start the conversation again."
                    .to_string()
            }
            ErrorKind::Network => {
                "A network problem interrupted the conversation. Please check your connection and try again."
                    .to_string()
            }
            ErrorKind::Decoding => {
                "Some audio from the assistant could not be played.".to_string()
            }
            ErrorKind::Authentication => {
                "Your API key appears to be invalid. Please provide a new, valid key to continue."
                    .to_string()
            }
            ErrorKind::Configuration => {
                "The generative AI API is not enabled for your project. Enable it in your cloud console and try again."
                    .to_string()
            }
            ErrorKind::Unknown => format!("An unexpected issue occurred: \"{}\"", raw),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Permission => "PermissionError",
            ErrorKind::DeviceNotFound => "DeviceNotFoundError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Decoding => "DecodingError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Unknown => "UnknownError",
        };
        f.write_str(name)
    }
}

/// Custom error types for the HTTP control API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The voice controller is not running (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts API errors into JSON responses:
///
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Port must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_text_wins_over_variant() {
        let err = VoiceError::Closed {
            code: 1007,
            reason: "API key not valid. Please pass a valid API key.".to_string(),
        };
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Authentication);

        let err = VoiceError::Backend("Requested entity was not found.".to_string());
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Authentication);
    }

    #[test]
    fn test_structured_kinds() {
        assert_eq!(
            ErrorKind::classify(&VoiceError::Permission("denied".into())),
            ErrorKind::Permission
        );
        assert_eq!(
            ErrorKind::classify(&VoiceError::DeviceNotFound("none".into())),
            ErrorKind::DeviceNotFound
        );
        assert_eq!(
            ErrorKind::classify(&VoiceError::Closed { code: 1011, reason: "internal".into() }),
            ErrorKind::Connection
        );
        assert_eq!(
            ErrorKind::classify(&VoiceError::Network("reset by peer".into())),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorKind::classify(&VoiceError::Decoding("odd length".into())),
            ErrorKind::Decoding
        );
        assert_eq!(ErrorKind::classify(&VoiceError::MissingCredential), ErrorKind::Authentication);
    }

    #[test]
    fn test_text_fallbacks() {
        let project = VoiceError::Backend(
            "Generative Language API has not been used in project 1234 before".into(),
        );
        assert_eq!(ErrorKind::classify(&project), ErrorKind::Configuration);

        let fetch = VoiceError::Backend("TypeError: Failed to fetch".into());
        assert_eq!(ErrorKind::classify(&fetch), ErrorKind::Network);

        let ws = VoiceError::Backend("WebSocket is already closed".into());
        assert_eq!(ErrorKind::classify(&ws), ErrorKind::Connection);

        let other = VoiceError::Backend("quota exhausted".into());
        assert_eq!(ErrorKind::classify(&other), ErrorKind::Unknown);
    }

    #[test]
    fn test_missing_credential_is_not_called_invalid() {
        let (kind, message) = ErrorKind::describe(&VoiceError::MissingCredential);
        assert_eq!(kind, ErrorKind::Authentication);
        assert!(!message.contains("invalid"));
        assert!(!VoiceError::MissingCredential.to_string().contains("not valid"));
    }

    #[test]
    fn test_missing_speaker_message_mentions_speaker() {
        let (kind, message) =
            ErrorKind::describe(&VoiceError::DeviceNotFound("no default output device".into()));
        assert_eq!(kind, ErrorKind::DeviceNotFound);
        assert!(message.contains("speaker"));
        assert!(message.contains("microphone"));
    }

    #[test]
    fn test_only_unknown_exposes_raw_text() {
        assert!(ErrorKind::Unknown.user_message("boom").contains("boom"));
        assert!(!ErrorKind::Network.user_message("boom").contains("boom"));
        assert!(!ErrorKind::Authentication.user_message("boom").contains("boom"));
    }
}
