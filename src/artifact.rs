use std::{path::Path, sync::Arc, time::Duration};

use futures::StreamExt;
use log::{error, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{
    config::ModelConfig,
    detector::{Detect, DetectorError, DetectorParams, OnnxDetector},
};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("object request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid object location: {0}")]
    Location(#[from] url::ParseError),
    #[error("{0} does not name a local file")]
    NotLocal(Url),
    #[error("model construction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to construct detector: {0}")]
    Detector(#[from] DetectorError),
}

/// Path-style object address: `<endpoint>/<bucket>/<key>`.
pub fn object_url(endpoint: &Url, bucket: &str, key: &str) -> Result<Url, ArtifactError> {
    let mut endpoint = endpoint.clone();
    if !endpoint.path().ends_with('/') {
        let path = format!("{}/", endpoint.path());
        endpoint.set_path(&path);
    }
    Ok(endpoint.join(&format!("{bucket}/{}", key.trim_start_matches('/')))?)
}

/// Copies the configured model object to `local_path`, returning the number of bytes written.
pub async fn fetch_artifact(config: &ModelConfig) -> Result<u64, ArtifactError> {
    let url = object_url(&config.object_store, &config.bucket, &config.key)?;
    if let Some(parent) = config.local_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let partial = config.local_path.with_extension("part");

    let written = if url.scheme() == "file" {
        let source = url
            .to_file_path()
            .map_err(|_| ArtifactError::NotLocal(url.clone()))?;
        tokio::fs::copy(&source, &partial)
            .await
            .map_err(DownloadError::from)
    } else {
        download(
            &url,
            &partial,
            Duration::from_secs(config.download_timeout_secs),
        )
        .await
    };
    let written = match written {
        Ok(x) => x,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {cleanup}", partial.display());
                }
            }
            return Err(e.into());
        }
    };

    tokio::fs::rename(&partial, &config.local_path).await?;
    Ok(written)
}

#[derive(Debug, Error)]
enum DownloadError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

impl From<DownloadError> for ArtifactError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Io(e) => ArtifactError::Io(e),
            DownloadError::Http(e) => ArtifactError::Http(e),
        }
    }
}

async fn download(url: &Url, destination: &Path, timeout: Duration) -> Result<u64, DownloadError> {
    let response = reqwest::Client::builder()
        .timeout(timeout)
        .build()?
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?;

    let mut file = tokio::fs::File::create(destination).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn load(config: &ModelConfig) -> Result<Arc<dyn Detect>, ArtifactError> {
    let written = fetch_artifact(config).await?;
    info!(
        "fetched {written} bytes to {}",
        config.local_path.display()
    );

    let path = config.local_path.clone();
    let params = DetectorParams::from(config);
    let intra_threads = config.intra_threads;
    let detector =
        tokio::task::spawn_blocking(move || OnnxDetector::load(&path, params, intra_threads))
            .await??;
    Ok(Arc::new(detector))
}

/// Fetches and constructs the detector. Any failure is logged and yields `None`,
/// leaving the service up but unhealthy.
pub async fn load_model(config: &ModelConfig) -> Option<Arc<dyn Detect>> {
    let location = object_url(&config.object_store, &config.bucket, &config.key)
        .map(|x| x.to_string())
        .unwrap_or_else(|_| format!("{}{}/{}", config.object_store, config.bucket, config.key));
    info!(
        "downloading model from {location} to {}",
        config.local_path.display()
    );
    match load(config).await {
        Ok(detector) => {
            info!("model loaded");
            Some(detector)
        }
        Err(e) => {
            error!("FATAL: failed to load model from {location}: {e}");
            None
        }
    }
}
