use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

fn default_web_bind() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_web_bind")]
    pub web_bind: SocketAddr,
    /// Largest accepted request body. Base64 inflates an image by a third.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    pub prometheus_bind: Option<SocketAddr>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_bind: default_web_bind(),
            max_body_bytes: default_max_body_bytes(),
            prometheus_bind: None,
            model: ModelConfig::default(),
            table: TableConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

fn default_object_store() -> Url {
    "https://s3.amazonaws.com/".parse().unwrap()
}

fn default_bucket() -> String {
    "car-damage-3051-models".to_string()
}

fn default_key() -> String {
    "artifacts/yolov11/best.onnx".to_string()
}

fn default_local_path() -> PathBuf {
    "/tmp/best.onnx".into()
}

fn default_input_size() -> u32 {
    640
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_max_detections() -> usize {
    300
}

fn default_intra_threads() -> usize {
    4
}

fn default_download_timeout_secs() -> u64 {
    300
}

/// Where the detector artifact lives and how the detector is run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelConfig {
    /// Object storage endpoint; objects are addressed as `<endpoint>/<bucket>/<key>`.
    /// `file://` endpoints read from a local directory with the same layout.
    #[serde(default = "default_object_store")]
    pub object_store: Url,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            object_store: default_object_store(),
            bucket: default_bucket(),
            key: default_key(),
            local_path: default_local_path(),
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            intra_threads: default_intra_threads(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_table_name() -> String {
    "CarDamageInferenceResults".to_string()
}

fn default_data_dir() -> PathBuf {
    "./tables".into()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TableConfig {
    #[serde(default = "default_table_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: default_table_name(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_api_url() -> Url {
    "http://localhost:8080/inference".parse().unwrap()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_area_multiplier() -> f64 {
    5000.0
}

fn default_classes() -> IndexMap<i64, ClassConfig> {
    let mut classes = IndexMap::new();
    classes.insert(
        0,
        ClassConfig {
            name: "General Damage (Small/Medium)".to_string(),
            base_cost: 250.0,
            color: [255, 255, 0],
        },
    );
    classes.insert(
        1,
        ClassConfig {
            name: "Headlight Damage".to_string(),
            base_cost: 400.0,
            color: [255, 0, 0],
        },
    );
    classes
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_area_multiplier")]
    pub area_multiplier: f64,
    /// TTF font for box labels. Without one, only boxes are drawn.
    pub font: Option<PathBuf>,
    #[serde(default = "default_classes")]
    pub classes: IndexMap<i64, ClassConfig>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            area_multiplier: default_area_multiplier(),
            font: None,
            classes: default_classes(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassConfig {
    pub name: String,
    pub base_cost: f64,
    /// RGB
    pub color: [u8; 3],
}

impl Config {
    /// Reads the YAML config at `path`. When `required` is false a missing file yields defaults.
    pub fn load(path: &std::path::Path, required: bool) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file {}", path.display()))
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bucket) = var("S3_BUCKET_MODELS").filter(|x| !x.is_empty()) {
            self.model.bucket = bucket;
        }
        if let Some(table) = var("DYNAMODB_TABLE_NAME").filter(|x| !x.is_empty()) {
            self.table.name = table;
        }
    }
}

lazy_static::lazy_static! {
    static ref CONFIG_PATH: Option<PathBuf> = {
        let var = std::env::var("DMGSCAN_CONFIG").unwrap_or_default();
        if var.is_empty() {
            None
        } else {
            Some(var.into())
        }
    };
    pub static ref CONFIG: Config = {
        let path = CONFIG_PATH.clone().unwrap_or_else(|| "./config.yaml".into());
        Config::load(&path, CONFIG_PATH.is_some()).expect("failed to load config")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.web_bind, default_web_bind());
        assert_eq!(config.max_body_bytes, 64 * 1024 * 1024);
        assert_eq!(config.model.bucket, "car-damage-3051-models");
        assert_eq!(config.model.key, "artifacts/yolov11/best.onnx");
        assert_eq!(config.table.name, "CarDamageInferenceResults");
        assert_eq!(config.probe.classes.len(), 2);
        assert_eq!(config.probe.classes[&1].base_cost, 400.0);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = serde_yaml::from_str(
            r"
web_bind: 127.0.0.1:9000
max_body_bytes: 1048576
model:
  object_store: file:///srv/objects/
  input_size: 320
probe:
  classes:
    7:
      name: Scratch
      base_cost: 90.0
      color: [0, 128, 255]
",
        )
        .unwrap();
        assert_eq!(config.web_bind.port(), 9000);
        assert_eq!(config.max_body_bytes, 1 << 20);
        assert_eq!(config.model.object_store.scheme(), "file");
        assert_eq!(config.model.input_size, 320);
        assert_eq!(config.model.confidence_threshold, 0.25);
        assert_eq!(config.probe.classes.keys().copied().collect::<Vec<_>>(), vec![7]);
        assert_eq!(config.probe.timeout_secs, 60);
    }

    #[test]
    fn env_overrides_bucket_and_table() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            "S3_BUCKET_MODELS" => Some("other-models".to_string()),
            "DYNAMODB_TABLE_NAME" => Some("OtherTable".to_string()),
            _ => None,
        });
        assert_eq!(config.model.bucket, "other-models");
        assert_eq!(config.table.name, "OtherTable");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.model.bucket, default_bucket());
        assert_eq!(config.table.name, default_table_name());
    }

    #[test]
    fn missing_optional_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("dmgscan-{}.yaml", uuid::Uuid::new_v4()));
        assert!(Config::load(&path, false).is_ok());
        assert!(Config::load(&path, true).is_err());
    }
}
