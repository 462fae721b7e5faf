use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    config::{ClassConfig, ProbeConfig},
    detection::{round_to, Detection},
};

/// Per-class base costs plus a surcharge proportional to the damaged share of the image.
#[derive(Clone, Debug)]
pub struct CostModel {
    pub classes: IndexMap<i64, ClassConfig>,
    pub area_multiplier: f64,
}

impl From<&ProbeConfig> for CostModel {
    fn from(config: &ProbeConfig) -> Self {
        CostModel {
            classes: config.classes.clone(),
            area_multiplier: config.area_multiplier,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CostedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub estimated_cost: Option<f64>,
}

/// `base_cost(class) + normalized_area * area_multiplier`, rounded to 2 decimals.
/// Unknown classes have no base cost.
pub fn estimate_cost(dimensions: (u32, u32), detection: &Detection, model: &CostModel) -> f64 {
    let (width, height) = (dimensions.0 as f64, dimensions.1 as f64);
    if width <= 0.0 || height <= 0.0 {
        return 0.0;
    }
    let [x_min, y_min, x_max, y_max] = detection.bbox;
    let area = (x_max / width - x_min / width) * (y_max / height - y_min / height);
    let base_cost = model
        .classes
        .get(&detection.class_id)
        .map(|x| x.base_cost)
        .unwrap_or_default();
    round_to(base_cost + area * model.area_multiplier, 2)
}
