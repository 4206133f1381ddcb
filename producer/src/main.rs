mod mjpeg;
mod upload;

use speed_trap_common::config::Config;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let Some(producer) = config.producer else {
        error!("no [producer] section in {}", config_path.display());
        std::process::exit(1);
    };

    info!(
        stream_url = producer.stream_url,
        mode = producer.mode,
        fps = producer.fps,
        upload_url = producer.upload_url,
        "starting speed-trap producer"
    );

    let uploader = match upload::Uploader::new(&producer.upload_url) {
        Ok(u) => u,
        Err(e) => {
            error!(error = %e, "failed to build upload client");
            std::process::exit(1);
        }
    };

    match producer.mode.as_str() {
        "mjpeg" => mjpeg::run_mjpeg_producer(&producer.stream_url, &uploader, producer.fps).await,
        "polling" => {
            mjpeg::run_polling_producer(&producer.stream_url, &uploader, producer.fps).await
        }
        other => {
            error!(mode = other, "unknown stream mode, expected 'mjpeg' or 'polling'");
            std::process::exit(1);
        }
    }
}
