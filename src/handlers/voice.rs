//! Voice session control.
//!
//! Commands are fire-and-forget to the controller task; each handler then
//! asks for a snapshot, which is queued behind the command, so the response
//! already reflects it. Connecting itself is asynchronous: a start answers
//! with `connecting` and the move to `open` arrives on `/ws/events`.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub api_key: String,
}

pub async fn get_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.voice.snapshot().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Start a session with the persona and backend currently configured.
pub async fn start_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let profile = state.get_config().voice_profile();
    info!(persona = %profile.persona_name, voice = %profile.voice, "Voice start requested");

    state.voice.start(profile)?;
    let snapshot = state.voice.snapshot().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn stop_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Voice stop requested");
    state.voice.stop()?;
    let snapshot = state.voice.snapshot().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Replace the backend API key. The key itself never appears in a response.
pub async fn provide_credential(
    state: web::Data<AppState>,
    body: web::Json<CredentialRequest>,
) -> Result<HttpResponse, AppError> {
    let api_key = body.into_inner().api_key;
    if api_key.trim().is_empty() {
        return Err(AppError::BadRequest("api_key cannot be empty".to_string()));
    }

    state.voice.provide_credential(api_key)?;
    let snapshot = state.voice.snapshot().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "credential_ready": snapshot.credential_ready
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::GeminiLiveBackend;
    use crate::state::testing::state_with;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/voice", web::get().to(get_voice))
            .route("/voice/start", web::post().to(start_voice))
            .route("/voice/stop", web::post().to(stop_voice))
            .route("/credential", web::put().to(provide_credential));
    }

    #[actix_web::test]
    async fn test_snapshot_starts_idle() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::get().uri("/voice").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["state"], "idle");
        assert_eq!(body["speaking"], false);
        assert_eq!(body["history"], json!([]));
        assert_eq!(body["persona_name"], "");
    }

    #[actix_web::test]
    async fn test_start_without_credential_reports_authentication() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post().uri("/voice/start").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["state"], "idle");
        assert_eq!(body["error"]["kind"], "authentication");
        assert_eq!(body["credential_ready"], false);
    }

    #[actix_web::test]
    async fn test_stop_when_idle_is_harmless() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        for _ in 0..2 {
            let req = test::TestRequest::post().uri("/voice/stop").to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["state"], "idle");
            assert!(body["error"].is_null());
        }
    }

    #[actix_web::test]
    async fn test_credential_sets_ready_flag() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::put()
            .uri("/credential")
            .set_json(json!({"api_key": "  "}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::put()
            .uri("/credential")
            .set_json(json!({"api_key": "new-key"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["credential_ready"], true);
        assert!(!body.to_string().contains("new-key"));
    }
}
