mod db;
mod persist;
mod poller;
mod routes;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use speed_trap_common::config::{Config, StorageBackend};
use speed_trap_engine::emitter::{EvidenceRenderer, OverspeedEmitter};
use speed_trap_engine::limit::SpeedLimitRegister;
use speed_trap_engine::processor::Processor;
use speed_trap_engine::slot::FrameSlot;
use speed_trap_engine::vision::{MotionDetector, TemplateTrackerFactory};
use tracing::{error, info, warn};

use crate::db::EvidenceDb;
use crate::persist::EvidenceStore;
use crate::poller::LimitPoller;
use crate::routes::AppState;
use crate::storage::{ImageStore, LocalStore, S3Store};

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

    info!(
        port = config.server.port,
        width = config.ingest.width,
        height = config.ingest.height,
        line_y = config.tracking.line_y,
        detect_every = config.tracking.detect_every,
        speed_limit = config.speed_limit.initial,
        backend = ?config.evidence.backend,
        "starting speed-trap server"
    );

    let limit = match SpeedLimitRegister::new(config.speed_limit.initial) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "invalid initial speed limit");
            std::process::exit(1);
        }
    };

    // Evidence persistence: image store + SQLite index behind a bounded queue.
    let (images, local_images) = match config.evidence.backend {
        StorageBackend::Local => {
            let store = LocalStore::new(&config.evidence.dir, &config.server.public_base_url);
            let served = routes::LocalImages {
                root: store.root().to_path_buf(),
                prefix: config.evidence.prefix.clone(),
            };
            (ImageStore::Local(store), Some(served))
        }
        StorageBackend::S3 => {
            let Some(s3) = &config.s3 else {
                error!("evidence.backend = \"s3\" without an [s3] section");
                std::process::exit(1);
            };
            let store = S3Store::new(s3).await;
            if let Err(e) = store.ensure_bucket().await {
                error!(error = %e, endpoint = s3.endpoint, "failed to ensure evidence bucket exists");
                std::process::exit(1);
            }
            (ImageStore::S3(store), None)
        }
    };

    let db = match EvidenceDb::open(Path::new(&config.evidence.db_path)) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, path = config.evidence.db_path, "failed to open evidence database");
            std::process::exit(1);
        }
    };

    let evidence = Arc::new(EvidenceStore::new(db, images, config.evidence.prefix.clone()));
    let (sink, queue_rx) = persist::queue(config.evidence.queue_capacity);
    tokio::spawn(persist::run_worker(queue_rx, Arc::clone(&evidence)));

    // Remote speed-limit source.
    if let Some(url) = config.speed_limit.poll_url.clone() {
        match LimitPoller::new(
            url,
            Duration::from_secs(config.speed_limit.poll_interval_secs),
            Duration::from_secs(config.speed_limit.poll_timeout_secs),
            Arc::clone(&limit),
        ) {
            Ok(poller) => {
                tokio::spawn(poller.run());
            }
            Err(e) => {
                error!(error = %e, "failed to build speed limit poller");
                std::process::exit(1);
            }
        }
    }

    let font = match config.evidence.font_path.as_deref() {
        Some(path) => match EvidenceRenderer::load_font(Path::new(path)) {
            Ok(font) => Some(font),
            Err(e) => {
                warn!(error = %e, "evidence captions disabled");
                None
            }
        },
        None => None,
    };
    let emitter = OverspeedEmitter::new(
        Arc::clone(&limit),
        EvidenceRenderer::new(config.evidence.jpeg_quality, font),
        Box::new(sink),
    );
    let processor = Processor::new(
        &config.tracking,
        Box::new(MotionDetector::from_config(&config.detector)),
        Box::new(TemplateTrackerFactory::from_config(&config.tracker)),
        emitter,
    );
    let stats = processor.stats();

    // The processing loop is CPU-bound and never awaits, so it gets an OS thread.
    let slot = Arc::new(FrameSlot::new());
    let loop_slot = Arc::clone(&slot);
    if let Err(e) = std::thread::Builder::new()
        .name("processing".into())
        .spawn(move || {
            processor.run(loop_slot);
        })
    {
        error!(error = %e, "failed to start processing thread");
        std::process::exit(1);
    }

    let state = Arc::new(AppState {
        slot,
        limit,
        evidence,
        stats,
        ingest: config.ingest.clone(),
    });
    let app = routes::router(state, local_images);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!(addr, "speed-trap server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}
