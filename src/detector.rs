use std::{path::Path, sync::Mutex};

use image::{imageops::FilterType, DynamicImage};
use log::{debug, info};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("invalid tensor layout: {0}")]
    Layout(#[from] ndarray::ShapeError),
    #[error("detector session lock poisoned")]
    Poisoned,
}

/// Unrounded detector output in source image pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub confidence: f32,
}

pub trait Detect: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError>;
}

#[derive(Clone, Debug)]
pub struct DetectorParams {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl From<&ModelConfig> for DetectorParams {
    fn from(config: &ModelConfig) -> Self {
        DetectorParams {
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// YOLO detector exported to ONNX. Expects a single `[1, 3, S, S]` input and a
/// `[1, 4 + classes, candidates]` output with centre/size boxes.
pub struct OnnxDetector {
    session: Mutex<Session>,
    params: DetectorParams,
}

fn build_session(path: &Path, intra_threads: usize) -> ort::Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)
}

impl OnnxDetector {
    pub fn load(
        path: &Path,
        params: DetectorParams,
        intra_threads: usize,
    ) -> Result<Self, DetectorError> {
        let session = build_session(path, intra_threads)?;
        info!(
            "loaded detector from {} ({} inputs, {} outputs)",
            path.display(),
            session.inputs.len(),
            session.outputs.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            params,
        })
    }

    fn input_tensor(&self, image: &DynamicImage) -> Result<Tensor<f32>, DetectorError> {
        let size = self.params.input_size;
        let resized = image::imageops::resize(&image.to_rgb8(), size, size, FilterType::Triangle);

        let plane = (size * size) as usize;
        let mut input = vec![0f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = (y * size + x) as usize;
            input[offset] = pixel[0] as f32 / 255.0;
            input[plane + offset] = pixel[1] as f32 / 255.0;
            input[2 * plane + offset] = pixel[2] as f32 / 255.0;
        }

        let shape = vec![1i64, 3, size as i64, size as i64];
        Ok(Tensor::from_array((shape, input))?)
    }
}

impl Detect for OnnxDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError> {
        let input = self.input_tensor(image)?;

        let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
        let outputs = session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() != 3 || dims[0] != 1 || dims[1] <= 4 {
            return Err(DetectorError::OutputShape(dims));
        }
        let view = ArrayViewD::from_shape(IxDyn(&dims), data)?;
        let predictions = view.index_axis(Axis(0), 0).into_dimensionality::<Ix2>()?;

        let detections = decode_predictions(
            predictions,
            (image.width(), image.height()),
            &self.params,
        );
        debug!(
            "{} candidates -> {} detections",
            predictions.ncols(),
            detections.len()
        );
        Ok(detections)
    }
}

/// Turns raw `[4 + classes, candidates]` predictions into thresholded, suppressed detections
/// scaled to the source image.
pub fn decode_predictions(
    predictions: ArrayView2<f32>,
    source: (u32, u32),
    params: &DetectorParams,
) -> Vec<RawDetection> {
    let (width, height) = (source.0 as f32, source.1 as f32);
    let sx = width / params.input_size as f32;
    let sy = height / params.input_size as f32;

    let mut candidates = vec![];
    for column in predictions.columns() {
        let Some((class_id, &confidence)) = column
            .iter()
            .skip(4)
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
        else {
            continue;
        };
        if confidence < params.confidence_threshold {
            continue;
        }
        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        candidates.push(RawDetection {
            bbox: [
                ((cx - w / 2.0) * sx).clamp(0.0, width),
                ((cy - h / 2.0) * sy).clamp(0.0, height),
                ((cx + w / 2.0) * sx).clamp(0.0, width),
                ((cy + h / 2.0) * sy).clamp(0.0, height),
            ],
            class_id,
            confidence,
        });
    }

    non_max_suppression(candidates, params.iou_threshold, params.max_detections)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Class-aware greedy suppression; output is ordered by descending confidence.
pub fn non_max_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
