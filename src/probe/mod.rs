use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use url::Url;
use uuid::Uuid;

use crate::{config::ProbeConfig, detection::Detection};

mod annotate;
mod cost;

pub use annotate::{draw_boxes, load_font};
pub use cost::{estimate_cost, CostModel, CostedDetection};

#[serde_as]
#[derive(Serialize, Deserialize, Default)]
pub struct InferencePayload {
    #[serde_as(as = "Base64")]
    pub image: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

/// Lenient view of the service response; every field is optional.
#[derive(Deserialize, Debug, Default)]
pub struct ProbeResponse {
    pub status: Option<String>,
    /// Read as sent by the service; the current service does not emit it.
    pub image_id: Option<String>,
    #[serde(rename = "assessmentId")]
    pub assessment_id: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

pub struct ProbeOptions {
    pub image: PathBuf,
    pub output: PathBuf,
    pub api_url: Url,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct ProbeReport {
    pub response: ProbeResponse,
    pub detections: Vec<CostedDetection>,
    pub total_estimated_cost: f64,
}

#[derive(Debug)]
pub enum ProbeOutcome {
    Completed(ProbeReport),
    /// The service answered with a non-success status.
    Rejected { status: StatusCode, body: String },
    /// No usable response (connect, timeout, undecodable body).
    Unreachable(String),
}

fn image_id(image: &std::path::Path) -> String {
    let name = image
        .file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("test-yolov11-{name}-{}", Uuid::new_v4())
}

async fn submit(options: &ProbeOptions, payload: &InferencePayload) -> ProbeOutcome {
    let client = match Client::builder().timeout(options.timeout).build() {
        Ok(x) => x,
        Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
    };
    let response = match client
        .post(options.api_url.clone())
        .json(payload)
        .send()
        .await
    {
        Ok(x) => x,
        Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return ProbeOutcome::Rejected { status, body };
    }
    match response.json::<ProbeResponse>().await {
        Ok(response) => ProbeOutcome::Completed(ProbeReport {
            response,
            detections: vec![],
            total_estimated_cost: 0.0,
        }),
        Err(e) => ProbeOutcome::Unreachable(e.to_string()),
    }
}

fn price(report: &mut ProbeReport, dimensions: Option<(u32, u32)>, model: &CostModel) {
    report.detections = report
        .response
        .detections
        .iter()
        .map(|detection| CostedDetection {
            detection: detection.clone(),
            estimated_cost: Some(
                dimensions
                    .map(|x| estimate_cost(x, detection, model))
                    .unwrap_or_default(),
            ),
        })
        .collect();
    report.total_estimated_cost = report
        .detections
        .iter()
        .filter_map(|x| x.estimated_cost)
        .sum();
}

fn print_report(report: &ProbeReport, config: &ProbeConfig) {
    println!("--- inference results ---");
    println!(
        "Status: {}",
        report.response.status.as_deref().unwrap_or("None")
    );
    println!(
        "Image ID: {}",
        report.response.image_id.as_deref().unwrap_or("None")
    );
    println!(
        "Assessment ID: {}",
        report.response.assessment_id.as_deref().unwrap_or("None")
    );
    println!("Detections: {}", report.detections.len());
    println!("{}", "-".repeat(35));
    if report.detections.is_empty() {
        println!("No damage detected in this image.");
        return;
    }
    println!(
        "Total estimated repair cost: {:.2} €",
        report.total_estimated_cost
    );
    for (i, costed) in report.detections.iter().enumerate() {
        println!(
            "  {}. Type: {}, Confidence: {:.4}, Est. cost: {:.2} €",
            i + 1,
            annotate::class_label(costed.detection.class_id, &config.classes),
            costed.detection.confidence,
            costed.estimated_cost.unwrap_or_default()
        );
    }
}

/// Submits one image, prices the returned detections and writes the annotated image.
/// Only a missing or unreadable input image is an error; service failures are reported
/// through the outcome.
pub async fn run(options: &ProbeOptions, config: &ProbeConfig) -> Result<ProbeOutcome> {
    info!("reading {}", options.image.display());
    let image = tokio::fs::read(&options.image)
        .await
        .with_context(|| format!("image file {} not found or unreadable", options.image.display()))?;

    let payload = InferencePayload {
        image,
        image_id: Some(image_id(&options.image)),
    };

    info!("posting to {}", options.api_url);
    let mut outcome = submit(options, &payload).await;

    match &mut outcome {
        ProbeOutcome::Rejected { status, body } => {
            error!("service returned HTTP {status}");
            if !body.is_empty() {
                error!("response body: {body}");
            }
        }
        ProbeOutcome::Unreachable(e) => {
            error!("request failed: {e}");
        }
        ProbeOutcome::Completed(report) => {
            let dimensions = match image::image_dimensions(&options.image) {
                Ok(x) => Some(x),
                Err(e) => {
                    warn!("cannot read dimensions of {}: {e}", options.image.display());
                    None
                }
            };
            price(report, dimensions, &CostModel::from(config));
            print_report(report, config);

            let font = match &config.font {
                Some(path) => match load_font(path) {
                    Ok(x) => Some(x),
                    Err(e) => {
                        warn!("labels disabled, failed to load font {}: {e}", path.display());
                        None
                    }
                },
                None => None,
            };
            match draw_boxes(
                &options.image,
                &report.detections,
                &options.output,
                &config.classes,
                font.as_ref(),
            ) {
                Ok(()) => info!("annotated image saved to {}", options.output.display()),
                Err(e) => error!("failed to annotate {}: {e}", options.image.display()),
            }
        }
    }

    Ok(outcome)
}
