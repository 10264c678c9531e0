//! # Voice Event Stream
//!
//! `GET /ws/events` upgrades to a WebSocket that pushes every [`VoiceEvent`]
//! as a JSON text frame, so a UI can render state, transcripts and errors
//! live instead of polling `/api/v1/voice`.
//!
//! ## Message Format:
//! - **Server -> Client**: `{"type": "state_changed", "state": "open"}`,
//!   `{"type": "output_transcript", "text": "..."}`, ... plus
//!   `{"type": "snapshot", ...}` on request and `{"type": "lagged", "skipped": n}`
//!   when this client fell behind the event buffer
//! - **Client -> Server**: optional commands `{"type": "start"}`,
//!   `{"type": "stop"}` and `{"type": "snapshot"}`
//!
//! Several UIs may subscribe at once; each gets its own copy of the stream.

use crate::live::VoiceEvent;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands a UI may send over the socket.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Start,
    Stop,
    Snapshot,
}

pub struct VoiceEventSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl VoiceEventSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(command = ?command, "Event socket command");
        let result = match command {
            ClientCommand::Start => {
                let profile = self.state.get_config().voice_profile();
                self.state.voice.start(profile)
            }
            ClientCommand::Stop => self.state.voice.stop(),
            ClientCommand::Snapshot => {
                let voice = self.state.voice.clone();
                let request = async move { voice.snapshot().await };
                ctx.spawn(request.into_actor(self).map(|result, _act, ctx| match result {
                    Ok(snapshot) => {
                        ctx.text(json!({ "type": "snapshot", "snapshot": snapshot }).to_string())
                    }
                    Err(e) => ctx.text(command_error(&e.to_string())),
                }));
                Ok(())
            }
        };

        if let Err(e) = result {
            ctx.text(command_error(&e.to_string()));
        }
    }
}

fn command_error(message: &str) -> String {
    json!({ "type": "command_error", "message": message }).to_string()
}

/// The text frame for one item of the broadcast stream.
fn event_frame(item: Result<VoiceEvent, BroadcastStreamRecvError>) -> Option<String> {
    match item {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize voice event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Event socket subscriber lagged");
            Some(json!({ "type": "lagged", "skipped": skipped }).to_string())
        }
    }
}

impl Actor for VoiceEventSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.increment_active_sessions();
        ctx.add_stream(BroadcastStream::new(self.state.voice.subscribe()));
        info!("Event socket connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Event socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_active_sessions();
        info!("Event socket disconnected");
    }
}

/// Voice events from the controller.
impl StreamHandler<Result<VoiceEvent, BroadcastStreamRecvError>> for VoiceEventSocket {
    fn handle(&mut self, item: Result<VoiceEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        if let Some(frame) = event_frame(item) {
            ctx.text(frame);
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        info!("Voice controller stopped, closing event socket");
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some("voice controller stopped".to_string()),
        }));
        ctx.stop();
    }
}

/// Frames from the UI.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceEventSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => self.command(command, ctx),
                    Err(e) => ctx.text(command_error(&format!("unknown command: {}", e))),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                ctx.text(command_error("binary frames are not accepted"));
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(reason = ?reason, "Event socket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Event socket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade handler for `/ws/events`.
pub async fn voice_events(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "Event socket upgrade requested");
    ws::start(VoiceEventSocket::new(state), &req, stream)
}
