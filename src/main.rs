//! # Live Voice Backend - Main Application Entry Point
//!
//! Runs a realtime voice conversation with a streaming speech backend:
//! microphone audio is streamed up, the backend's synthesized speech is
//! played back gaplessly, and transcripts of both sides are kept as a
//! conversation history. An Actix-web server exposes the controls.
//!
//! ## Application Architecture:
//! - **audio**: capture, PCM codec, playback scheduling, device backends
//! - **live**: the backend protocol, its WebSocket connection, and the
//!   session controller task that owns all voice state
//! - **transcription**: per-turn transcript buffers and history
//! - **config / state / error**: configuration, shared state, error types
//! - **health / handlers / websocket / middleware**: the HTTP surface

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use live::{GeminiLiveBackend, VoiceController};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers, polled by the main task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Spawn the voice controller on its own runtime with the default audio devices
/// 3. Serve the control API until the server fails or a signal arrives
/// 4. Stop the voice session, then the controller
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.backend.model,
        voice = %config.backend.voice,
        "Configuration loaded"
    );
    if config.backend.api_key.is_none() {
        warn!("No API key configured; provide one with PUT /api/v1/credential before starting a session");
    }

    // Device opens and closes wait on their stream threads; keep that off
    // the HTTP workers.
    let voice_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("voice-controller")
        .enable_all()
        .build()?;

    let (voice, controller_task) = VoiceController::spawn_on(
        voice_runtime.handle(),
        audio::device::default_devices(),
        Arc::new(GeminiLiveBackend::new()),
        config.controller_settings(),
        config.backend.api_key.clone(),
    );

    let app_state = AppState::new(config.clone(), voice.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice", web::get().to(handlers::get_voice))
                    .route("/voice/start", web::post().to(handlers::start_voice))
                    .route("/voice/stop", web::post().to(handlers::stop_voice))
                    .route("/credential", web::put().to(handlers::provide_credential)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/events", web::get().to(websocket::voice_events))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Releases the microphone and closes any live session.
    voice.shutdown();
    if let Err(e) = controller_task.await {
        error!("Voice controller task error: {}", e);
    }
    voice_runtime.shutdown_background();

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `live_voice_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// SIGTERM or SIGINT sets [`SHUTDOWN_SIGNAL`].
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
