use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use assessment::FsTable;
use clap::{Parser, Subcommand};
use config::CONFIG;
use log::{error, info};
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
    HistogramVec, IntCounterVec,
};
use url::Url;
use web::AppState;

mod artifact;
mod assessment;
mod config;
mod detection;
mod detector;
mod probe;
mod web;

lazy_static::lazy_static! {
    static ref INFERENCE_REQUESTS: IntCounterVec = register_int_counter_vec!("dmgscan_inference_requests", "inference requests by outcome", &["outcome"]).unwrap();
    static ref INFERENCE_LATENCY: HistogramVec = register_histogram_vec!("dmgscan_inference_latency_seconds", "inference request latency by outcome", &["outcome"]).unwrap();
    static ref DETECTIONS_PER_REQUEST: Histogram = register_histogram!("dmgscan_detections_per_request", "detections returned per completed request", vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 300.0]).unwrap();

    static ref ARGS: Args = Args::parse();
}

/// Damage detection inference service
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Loads the model and serves /health and /inference (default)
    Serve,
    /// Submits an image to a running service, estimates repair costs and draws the detections
    Probe {
        /// Image to submit
        #[clap(default_value = "car-damage.jpg")]
        image: PathBuf,
        /// Where to write the annotated image
        #[clap(short, long, default_value = "car_damage_detected.jpg")]
        output: PathBuf,
        /// Inference endpoint, overrides `probe.api_url`
        #[clap(short, long)]
        url: Option<Url>,
    },
    /// Prints an assessment persisted by `serve`
    Show {
        assessment_id: String,
    },
}

async fn serve() -> anyhow::Result<()> {
    if let Some(prometheus_bind) = CONFIG.prometheus_bind {
        prometheus_exporter::start(prometheus_bind)
            .context("failed to start prometheus exporter")?;
    }

    let detector = artifact::load_model(&CONFIG.model).await;
    let store = FsTable::open(&CONFIG.table.data_dir, &CONFIG.table.name)
        .await
        .context("failed to open assessment table")?;
    info!(
        "assessments persisted to table {} under {}",
        CONFIG.table.name,
        CONFIG.table.data_dir.display()
    );

    let state = AppState {
        detector,
        store: Arc::new(store),
    };

    async fn run(state: AppState) -> anyhow::Result<()> {
        let server = axum::Server::try_bind(&CONFIG.web_bind)?;
        info!("listening @ {}", CONFIG.web_bind);
        server
            .serve(
                web::service(state, CONFIG.max_body_bytes)
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
        Ok(())
    }
    loop {
        if let Err(e) = run(state.clone()).await {
            error!("failed to start api server: {:?}", e);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run_probe(image: &Path, output: &Path, url: Option<&Url>) -> anyhow::Result<()> {
    let options = probe::ProbeOptions {
        image: image.to_path_buf(),
        output: output.to_path_buf(),
        api_url: url.cloned().unwrap_or_else(|| CONFIG.probe.api_url.clone()),
        timeout: Duration::from_secs(CONFIG.probe.timeout_secs),
    };
    probe::run(&options, &CONFIG.probe).await?;
    Ok(())
}

async fn show(assessment_id: &str) -> anyhow::Result<()> {
    let table = FsTable::existing(&CONFIG.table.data_dir, &CONFIG.table.name)?;
    let record = table.get(assessment_id).await?.with_context(|| {
        format!(
            "assessment {assessment_id} not found in table {}",
            CONFIG.table.name
        )
    })?;
    let detections = record.detections()?;

    println!("Assessment ID: {}", record.assessment_id);
    println!("Timestamp: {}", record.timestamp);
    println!("Detections: {}", detections.len());
    for (i, detection) in detections.iter().enumerate() {
        let label = CONFIG
            .probe
            .classes
            .get(&detection.class_id)
            .map(|x| x.name.as_str())
            .unwrap_or("Unknown");
        println!(
            "  {}. {label} ({}), confidence {:.4}, box {:?}",
            i + 1,
            detection.class_id,
            detection.confidence,
            detection.bbox
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    lazy_static::initialize(&ARGS);

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let result = match &ARGS.command {
        None | Some(Command::Serve) => serve().await,
        Some(Command::Probe { image, output, url }) => {
            run_probe(image, output, url.as_ref()).await
        }
        Some(Command::Show { assessment_id }) => show(assessment_id).await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}
