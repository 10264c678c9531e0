//! # Live Connection
//!
//! The bidirectional session with the streaming voice backend.
//!
//! A [`LiveBackend`] turns a [`ConnectRequest`] into a [`LiveSession`]. The
//! session is only a handle to the outbound queue; the socket itself is owned
//! by two background tasks:
//!
//! - **writer**: drains the outbound queue into the socket
//! - **reader**: parses server messages and hands each [`LiveEvent`] to the
//!   inbound sink, in arrival order
//!
//! Closing the handle (or dropping it) makes the writer send a close frame.

use crate::audio::capture::MediaSink;
use crate::audio::codec::WireAudioBlob;
use crate::error::VoiceError;
use crate::live::protocol::{ClientMessage, LiveEvent, ServerMessage};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Receives inbound events from the reader task.
pub type InboundSink = Arc<dyn Fn(LiveEvent) + Send + Sync>;

/// Everything needed to open one session.
#[derive(Clone)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish()
    }
}

/// Work for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Media(WireAudioBlob),
    Close,
}

/// Handle to an open session.
pub struct LiveSession {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl LiveSession {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { outbound }
    }

    /// A sink the capture pipeline can push frames into.
    pub fn media_sink(&self) -> Arc<dyn MediaSink> {
        Arc::new(MediaSender {
            outbound: self.outbound.clone(),
        })
    }

    pub fn close(self) {
        if self.outbound.send(Outbound::Close).is_err() {
            debug!("Live session already closed");
        }
    }
}

/// Queues frames for the writer task. Fails once the session is gone.
pub struct MediaSender {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl MediaSink for MediaSender {
    fn send_media(&self, blob: WireAudioBlob) -> Result<(), VoiceError> {
        self.outbound
            .send(Outbound::Media(blob))
            .map_err(|_| VoiceError::SessionNotReady("live session is closed".to_string()))
    }
}

/// Opens live sessions.
pub trait LiveBackend: Send + Sync {
    /// Resolve once the session is ready to accept media. No timeout.
    fn connect(
        &self,
        request: ConnectRequest,
        inbound: InboundSink,
    ) -> BoxFuture<'static, Result<LiveSession, VoiceError>>;
}

/// The Gemini Live WebSocket backend.
#[derive(Debug, Default, Clone)]
pub struct GeminiLiveBackend;

impl GeminiLiveBackend {
    pub fn new() -> Self {
        Self
    }
}

impl LiveBackend for GeminiLiveBackend {
    fn connect(
        &self,
        request: ConnectRequest,
        inbound: InboundSink,
    ) -> BoxFuture<'static, Result<LiveSession, VoiceError>> {
        open_session(request, inbound).boxed()
    }
}

async fn open_session(request: ConnectRequest, inbound: InboundSink) -> Result<LiveSession, VoiceError> {
    let url = format!("{}?key={}", request.endpoint, request.api_key);
    info!(endpoint = %request.endpoint, model = %request.model, "Connecting live session");

    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(map_ws_error)?;
    let (mut writer, mut reader) = socket.split();

    let setup = ClientMessage::setup(&request.model, &request.voice, &request.system_instruction);
    writer
        .send(Message::Text(setup.to_json()?))
        .await
        .map_err(map_ws_error)?;

    // The session is usable only after setupComplete.
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                if ServerMessage::parse(text.as_bytes())?.setup_complete.is_some() {
                    break;
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                if ServerMessage::parse(&bytes)?.setup_complete.is_some() {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(map_ws_error(e)),
            None => {
                return Err(VoiceError::Connection(
                    "websocket closed before setup completed".to_string(),
                ))
            }
        }
    }
    info!("Live session opened");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Media(blob) => {
                    let json = match ClientMessage::media(blob).to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "Dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(json)).await {
                        warn!(error = %e, "Failed to send realtime input");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        if let Err(e) = writer.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not delivered");
        }
        debug!("Live writer finished");
    });

    tokio::spawn(async move {
        let mut closed = false;
        while let Some(message) = reader.next().await {
            let parsed = match message {
                Ok(Message::Text(text)) => ServerMessage::parse(text.as_bytes()),
                Ok(Message::Binary(bytes)) => ServerMessage::parse(&bytes),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = close_parts(frame);
                    info!(code, reason = %reason, "Live session closed by server");
                    inbound(LiveEvent::Closed { code, reason });
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    inbound(LiveEvent::Error(map_ws_error(e)));
                    closed = true;
                    break;
                }
            };

            match parsed {
                Ok(msg) => {
                    if let Some(go_away) = &msg.go_away {
                        warn!(time_left = ?go_away.time_left, "Server is about to end the live session");
                    }
                    for event in msg.into_events() {
                        inbound(event);
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unreadable server message"),
            }
        }
        if !closed {
            inbound(LiveEvent::Closed {
                code: 1006,
                reason: "websocket disconnected without a close frame".to_string(),
            });
        }
        debug!("Live reader finished");
    });

    Ok(LiveSession::new(outbound_tx))
}

fn close_parts(frame: Option<tungstenite::protocol::CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => {
            let reason = if frame.reason.is_empty() {
                "No reason provided".to_string()
            } else {
                frame.reason.to_string()
            };
            (u16::from(frame.code), reason)
        }
        None => (1005, "No reason provided".to_string()),
    }
}

fn close_error(frame: Option<tungstenite::protocol::CloseFrame<'_>>) -> VoiceError {
    let (code, reason) = close_parts(frame);
    VoiceError::Closed { code, reason }
}

fn map_ws_error(err: tungstenite::Error) -> VoiceError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            VoiceError::Connection(format!("handshake rejected with status {}: {}", status, body))
        }
        tungstenite::Error::Io(e) => VoiceError::Network(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            VoiceError::Connection("websocket closed".to_string())
        }
        tungstenite::Error::Url(e) => VoiceError::Connection(format!("invalid endpoint: {}", e)),
        other => VoiceError::Backend(other.to_string()),
    }
}
