//! # Health and Metrics Endpoints
//!
//! `GET /health` reports liveness plus the voice controller's state, so a
//! supervisor can tell a stuck controller from a healthy idle one.
//! `GET /api/v1/metrics` breaks request counts down per endpoint.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    let (status, voice) = match state.voice.snapshot().await {
        Ok(snapshot) => (
            "healthy",
            json!({
                "controller": "running",
                "state": snapshot.state,
                "speaking": snapshot.speaking,
                "credential_ready": snapshot.credential_ready,
                "last_error": snapshot.error.map(|e| e.kind),
            }),
        ),
        Err(e) => ("degraded", json!({ "controller": "stopped", "error": e.to_string() })),
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "voice": voice,
        "backend": {
            "model": config.backend.model,
            "voice": config.backend.voice
        },
        "audio": {
            "hardware": cfg!(feature = "hardware"),
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "frame_size": config.audio.frame_size
        },
        "metrics": overall(&metrics),
        "memory": memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let mut overall = overall(&metrics);
    overall["requests_per_second"] = json!(if uptime_seconds > 0 {
        metrics.request_count as f64 / uptime_seconds as f64
    } else {
        0.0
    });

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": overall,
        "endpoints": endpoint_stats,
        "memory": memory_info()
    }))
}

fn overall(metrics: &AppMetrics) -> serde_json::Value {
    json!({
        "total_requests": metrics.request_count,
        "total_errors": metrics.error_count,
        "error_rate": if metrics.request_count > 0 {
            metrics.error_count as f64 / metrics.request_count as f64
        } else {
            0.0
        },
        "event_subscribers": metrics.active_sessions
    })
}

#[cfg(target_os = "linux")]
fn memory_info() -> serde_json::Value {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return json!({ "available": false });
    };

    // Values are reported in kB.
    let field = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": field("VmRSS:"),
        "virtual_memory_bytes": field("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> serde_json::Value {
    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::GeminiLiveBackend;
    use crate::state::testing::state_with;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_idle_controller() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["voice"]["state"], "idle");
        assert_eq!(body["voice"]["credential_ready"], false);
        assert_eq!(body["audio"]["frame_size"], 4096);
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let state = state_with(Arc::new(GeminiLiveBackend::new()), None);
        state.increment_request_count();
        state.record_endpoint_request("GET /health", 4, false);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["overall"]["total_requests"], 1);
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
    }
}
