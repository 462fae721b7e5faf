use std::time::Instant;

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use base64::{prelude::BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    assessment::AssessmentRecord,
    detection::Detection,
    detector::RawDetection,
    DETECTIONS_PER_REQUEST, INFERENCE_LATENCY, INFERENCE_REQUESTS,
};

use super::{
    error::{ApiError, ApiResult},
    AppState,
};

#[derive(Deserialize)]
pub struct InferenceRequest {
    /// Base64 text. Any other JSON value is accepted here and judged by [`encoded_image`].
    #[serde(default)]
    pub image: Value,
}

/// Null, `false`, zero and empty strings, arrays or objects all count as a missing image.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(x) => !x,
        Value::Number(x) => x.as_f64() == Some(0.0),
        Value::String(x) => x.is_empty(),
        Value::Array(x) => x.is_empty(),
        Value::Object(x) => x.is_empty(),
    }
}

fn encoded_image(value: Value) -> ApiResult<String> {
    match value {
        value if is_blank(&value) => Err(ApiError::MissingImage),
        Value::String(text) => Ok(text),
        other => Err(ApiError::Internal(format!(
            "'image' must be a base64 string, got {other}"
        ))),
    }
}

/// Line-wrapped base64 (MIME, `base64` CLI output) is accepted.
fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64_STANDARD.decode(compact)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct InferenceResponse {
    #[serde(rename = "assessmentId")]
    pub assessment_id: String,
    pub status: String,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
}

pub const COMPLETE_STATUS: &str = "Inference Complete and Result Saved";

pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

pub async fn inference(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<InferenceResponse>> {
    let start = Instant::now();
    let result = assess(&state, &body).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    INFERENCE_REQUESTS.with_label_values(&[outcome]).inc();
    INFERENCE_LATENCY
        .with_label_values(&[outcome])
        .observe(start.elapsed().as_secs_f64());
    result.map(Json)
}

async fn assess(state: &AppState, body: &[u8]) -> ApiResult<InferenceResponse> {
    let Some(detector) = state.detector.clone() else {
        return Err(ApiError::ModelUnavailable);
    };

    let request: InferenceRequest = serde_json::from_slice(body)?;
    let encoded = encoded_image(request.image)?;

    let assessment_id = Uuid::new_v4();

    let raw = tokio::task::spawn_blocking(move || -> ApiResult<Vec<RawDetection>> {
        let decoded = image::load_from_memory(&decode_base64(&encoded)?)?;
        Ok(detector.detect(&decoded)?)
    })
    .await??;

    let detections: Vec<Detection> = raw.iter().map(Detection::from).collect();
    DETECTIONS_PER_REQUEST.observe(detections.len() as f64);

    let record = AssessmentRecord::new(assessment_id, &detections)?;
    state.store.put(&record).await?;

    Ok(InferenceResponse {
        assessment_id: record.assessment_id,
        status: COMPLETE_STATUS.to_string(),
        detection_count: detections.len(),
        detections,
    })
}
