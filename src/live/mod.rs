//! # Live Session Module
//!
//! The realtime conversation with the streaming voice backend.
//!
//! ## Key Components:
//! - **Protocol**: wire messages of the live WebSocket API
//! - **Connection**: opening a session, writer and reader tasks
//! - **Session**: the voice controller that owns all session state

pub mod connection;
pub mod protocol;
pub mod session;

pub use connection::GeminiLiveBackend;
pub use session::{ControllerSettings, VoiceController, VoiceEvent, VoiceHandle, VoiceProfile};
