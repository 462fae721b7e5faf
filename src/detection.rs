use serde::{Deserialize, Serialize};

use crate::detector::RawDetection;

/// A single detected object as returned to clients and persisted with an assessment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_min, y_min, x_max, y_max]` in source image pixels, rounded to 2 decimals.
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
    #[serde(rename = "class")]
    pub class_id: i64,
    /// Rounded to 4 decimals.
    pub confidence: f64,
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl From<&RawDetection> for Detection {
    fn from(raw: &RawDetection) -> Self {
        Detection {
            bbox: raw.bbox.map(|c| round_to(c as f64, 2)),
            class_id: raw.class_id as i64,
            confidence: round_to(raw.confidence as f64, 4),
        }
    }
}
