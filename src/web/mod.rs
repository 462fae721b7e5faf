use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing, Router,
};
use axum_util::logger::{LoggerConfig, LoggerLayer};
use log::Level;

use crate::{assessment::AssessmentStore, detector::Detect};

mod error;
mod health;
mod inference;

/// Shared by every request. The detector is fixed at startup; `None` means the service is unhealthy.
#[derive(Clone)]
pub struct AppState {
    pub detector: Option<Arc<dyn Detect>>,
    pub store: Arc<dyn AssessmentStore>,
}

async fn cors<B>(request: Request<B>, next: Next<B>) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    response
}

/// `max_body_bytes` replaces axum's 2 MB default so full-size photos fit.
pub fn route(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", routing::get(health::health))
        .route(
            "/inference",
            routing::post(inference::inference).options(inference::preflight),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// [`route`] plus access logging.
pub fn service(state: AppState, max_body_bytes: usize) -> Router {
    route(state, max_body_bytes).layer(LoggerLayer::new(LoggerConfig {
        log_level_filter: Arc::new(|x| {
            if x == "/health" {
                Level::Debug
            } else {
                Level::Info
            }
        }),
        honor_xff: true,
        metric_name: "dmgscan_web_responses".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use axum::{
        body::{Body, Bytes},
        http::{HeaderMap, Method, StatusCode},
    };
    use image::{DynamicImage, ImageFormat, RgbImage};
    use base64::{prelude::BASE64_STANDARD, Engine};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{
        inference::{InferenceResponse, COMPLETE_STATUS},
        *,
    };
    use crate::{
        assessment::{AssessmentRecord, MemoryTable, StoreError},
        config::Config,
        detection::Detection,
        detector::{DetectorError, RawDetection},
        probe::InferencePayload,
    };

    #[derive(Default)]
    struct FixedDetector {
        detections: Vec<RawDetection>,
        calls: AtomicUsize,
    }

    impl Detect for FixedDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.detections.clone())
        }
    }

    struct BrokenTable;

    #[async_trait]
    impl AssessmentStore for BrokenTable {
        async fn put(&self, _record: &AssessmentRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("CarDamageInferenceResults".to_string()))
        }
    }

    fn damage() -> Vec<RawDetection> {
        vec![
            RawDetection {
                bbox: [10.126, 20.0, 110.5, 80.333],
                class_id: 0,
                confidence: 0.912_345,
            },
            RawDetection {
                bbox: [200.0, 40.0, 260.0, 90.0],
                class_id: 1,
                confidence: 0.5,
            },
        ]
    }

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let mut raw = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut raw), format)
            .unwrap();
        raw
    }

    fn png_payload() -> Vec<u8> {
        serde_json::to_vec(&InferencePayload {
            image: encoded(32, 24, ImageFormat::Png),
            image_id: None,
        })
        .unwrap()
    }

    fn limited(state: AppState) -> Router {
        route(state, Config::default().max_body_bytes)
    }

    async fn call(router: Router, method: Method, uri: &str, body: Vec<u8>) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, headers, body)
    }

    fn json_body(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    fn assert_cors(headers: &HeaderMap) {
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(
            headers["access-control-allow-headers"],
            "Content-Type, Authorization"
        );
        assert_eq!(headers["access-control-allow-methods"], "GET, POST, OPTIONS");
    }

    fn loaded(detector: Arc<FixedDetector>, table: Arc<MemoryTable>) -> Router {
        limited(AppState {
            detector: Some(detector),
            store: table,
        })
    }

    fn unloaded(table: Arc<MemoryTable>) -> Router {
        limited(AppState {
            detector: None,
            store: table,
        })
    }

    #[tokio::test]
    async fn health_reports_loaded_model() {
        let router = loaded(Default::default(), Default::default());
        let (status, headers, body) = call(router, Method::GET, "/health", vec![]).await;
        assert_eq!(status, StatusCode::OK);
        assert_cors(&headers);
        assert_eq!(json_body(&body), json!({"status": "OK", "model_loaded": true}));
    }

    #[tokio::test]
    async fn health_reports_missing_model() {
        let (status, _, body) = call(unloaded(Default::default()), Method::GET, "/health", vec![]).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(&body);
        assert_eq!(body["status"], "UNHEALTHY");
        assert_eq!(body["model_loaded"], false);
        assert!(body["details"].is_string());
    }

    #[tokio::test]
    async fn preflight_is_empty_with_cors() {
        let router = unloaded(Default::default());
        let (status, headers, body) = call(router, Method::OPTIONS, "/inference", vec![]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_cors(&headers);
    }

    #[tokio::test]
    async fn inference_returns_and_persists_rounded_detections() {
        let detector = Arc::new(FixedDetector {
            detections: damage(),
            ..Default::default()
        });
        let table = Arc::new(MemoryTable::default());
        let router = loaded(detector.clone(), table.clone());

        let (status, headers, body) = call(router, Method::POST, "/inference", png_payload()).await;
        assert_eq!(status, StatusCode::OK);
        assert_cors(&headers);

        let response: InferenceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.status, COMPLETE_STATUS);
        assert_eq!(response.detection_count, response.detections.len());
        assert_eq!(response.detection_count, 2);
        assert_eq!(response.detections[0].bbox, [10.13, 20.0, 110.5, 80.33]);
        assert_eq!(response.detections[0].confidence, 0.9123);
        assert_eq!(response.detections[1].class_id, 1);
        assert!(Uuid::parse_str(&response.assessment_id).is_ok());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

        let record = table.get(&response.assessment_id).unwrap();
        assert_eq!(record.detections().unwrap(), response.detections);
    }

    #[tokio::test]
    async fn assessment_ids_are_unique() {
        let table = Arc::new(MemoryTable::default());
        let detector = Arc::new(FixedDetector::default());
        let mut ids = vec![];
        for _ in 0..3 {
            let (status, _, body) = call(
                loaded(detector.clone(), table.clone()),
                Method::POST,
                "/inference",
                png_payload(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let response: InferenceResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(response.detections, Vec::<Detection>::new());
            ids.push(response.assessment_id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn missing_image_is_bad_request() {
        let detector = Arc::new(FixedDetector::default());
        let table = Arc::new(MemoryTable::default());
        for payload in [
            json!({}),
            json!({"image": null}),
            json!({"image": ""}),
            json!({"image": false}),
            json!({"image": 0}),
            json!({"image": []}),
            json!({"image": {}}),
            json!({"image_id": "car-damage.jpg", "extra": [1, 2, 3]}),
        ] {
            let (status, headers, body) = call(
                loaded(detector.clone(), table.clone()),
                Method::POST,
                "/inference",
                serde_json::to_vec(&payload).unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_cors(&headers);
            assert_eq!(
                json_body(&body),
                json!({"error": "Missing 'image' (base64) field in request body."})
            );
        }
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn missing_model_is_unavailable_before_validation() {
        let table = Arc::new(MemoryTable::default());
        for payload in [png_payload(), b"{}".to_vec(), b"not json".to_vec()] {
            let (status, headers, body) =
                call(unloaded(table.clone()), Method::POST, "/inference", payload).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_cors(&headers);
            assert_eq!(
                json_body(&body),
                json!({"error": "Model not loaded. Service is UNHEALTHY."})
            );
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn undecodable_input_is_internal_error() {
        let detector = Arc::new(FixedDetector::default());
        let table = Arc::new(MemoryTable::default());
        for payload in [
            // valid base64, not an image
            br#"{"image": "aGVsbG8gd29ybGQ="}"#.to_vec(),
            br#"{"image": "***"}"#.to_vec(),
            br#"{"image": true}"#.to_vec(),
            b"not json".to_vec(),
        ] {
            let (status, headers, body) = call(
                loaded(detector.clone(), table.clone()),
                Method::POST,
                "/inference",
                payload,
            )
            .await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_cors(&headers);
            let error = json_body(&body)["error"].as_str().unwrap().to_string();
            assert!(error.starts_with("Internal Server Error during inference: "));
        }
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_is_internal_error() {
        let router = limited(AppState {
            detector: Some(Arc::new(FixedDetector {
                detections: damage(),
                ..Default::default()
            })),
            store: Arc::new(BrokenTable),
        });
        let (status, _, body) = call(router, Method::POST, "/inference", png_payload()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(&body),
            json!({"error": "Internal Server Error during inference: table CarDamageInferenceResults unavailable"})
        );
    }

    #[tokio::test]
    async fn accepts_photo_sized_bodies() {
        let detector = Arc::new(FixedDetector::default());
        let table = Arc::new(MemoryTable::default());
        // uncompressed, roughly 3.8 MB once encoded
        let payload = serde_json::to_vec(&InferencePayload {
            image: encoded(1200, 800, ImageFormat::Bmp),
            image_id: None,
        })
        .unwrap();
        assert!(payload.len() > 2 * 1024 * 1024);

        let (status, headers, body) =
            call(loaded(detector.clone(), table.clone()), Method::POST, "/inference", payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_cors(&headers);
        let response: InferenceResponse = serde_json::from_slice(&body).unwrap();
        assert!(table.get(&response.assessment_id).is_some());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_limit_is_configurable() {
        let router = route(
            AppState {
                detector: Some(Arc::new(FixedDetector::default())),
                store: Arc::new(MemoryTable::default()),
            },
            64,
        );
        let (status, _, _) = call(router, Method::POST, "/inference", png_payload()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn accepts_line_wrapped_base64() {
        let detector = Arc::new(FixedDetector::default());
        let text = BASE64_STANDARD.encode(encoded(32, 24, ImageFormat::Png));
        let wrapped = text
            .as_bytes()
            .chunks(76)
            .map(|x| std::str::from_utf8(x).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(wrapped.contains('\n'));

        let (status, _, body) = call(
            loaded(detector.clone(), Default::default()),
            Method::POST,
            "/inference",
            serde_json::to_vec(&json!({ "image": wrapped })).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["status"], COMPLETE_STATUS);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }
}
