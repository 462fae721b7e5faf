use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AppState;

#[derive(Serialize, Debug)]
pub struct HealthStatus {
    pub status: &'static str,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'static str>,
}

/// Load balancer health check: healthy iff the detector was constructed at startup.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    if state.detector.is_some() {
        (
            StatusCode::OK,
            Json(HealthStatus {
                status: "OK",
                model_loaded: true,
                details: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "UNHEALTHY",
                model_loaded: false,
                details: Some("Model failed to load."),
            }),
        )
    }
}
