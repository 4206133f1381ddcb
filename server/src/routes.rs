use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path as AxumPath, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use speed_trap_common::config::{IngestConfig, MAX_SPEED_LIMIT, MIN_SPEED_LIMIT};
use speed_trap_common::frame::Frame;
use speed_trap_engine::limit::SpeedLimitRegister;
use speed_trap_engine::processor::LoopStats;
use speed_trap_engine::slot::FrameSlot;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::persist::{EvidenceStore, PersistError};
use crate::poller::max_speed;
use crate::storage::LOCAL_MOUNT;

/// Largest accepted frame upload.
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

pub struct AppState {
    pub slot: Arc<FrameSlot>,
    pub limit: Arc<SpeedLimitRegister>,
    pub evidence: Arc<EvidenceStore>,
    pub stats: Arc<LoopStats>,
    pub ingest: IngestConfig,
}

#[derive(Debug, Serialize)]
struct OverspeedingCar {
    id: i64,
    track_id: i64,
    speed: f64,
    date: String,
    time: String,
    image_path: String,
}

/// Evidence images kept on disk: the store root and the key prefix every
/// image is written under.
pub struct LocalImages {
    pub root: PathBuf,
    pub prefix: String,
}

/// Mount point and directory to serve. Only the directory part of the key
/// prefix is exposed, so nothing else under the store root is reachable.
fn image_mount(root: &Path, prefix: &str) -> (String, PathBuf) {
    let dir = prefix.rfind('/').map_or("", |i| &prefix[..i]).trim_matches('/');
    if dir.is_empty() {
        (LOCAL_MOUNT.to_string(), root.to_path_buf())
    } else {
        (format!("{LOCAL_MOUNT}/{dir}"), root.join(dir))
    }
}

pub fn router(state: Arc<AppState>, local_images: Option<LocalImages>) -> Router {
    let mut app = Router::new()
        .route("/upload_video", post(upload_video))
        .route("/set_speed_limit", post(set_speed_limit))
        .route("/speed_limit", get(get_speed_limit))
        .route("/overspeeding_cars", get(list_overspeeding_cars))
        .route("/overspeeding_cars/:id", delete(delete_overspeeding_car))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state);

    if let Some(images) = local_images {
        let (mount, dir) = image_mount(&images.root, &images.prefix);
        app = app.nest_service(&mount, ServeDir::new(dir));
    }
    app.layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// POST /upload_video: one encoded frame, either as multipart field `video`
/// or as the raw request body.
async fn upload_video(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let payload = if is_multipart {
        match video_field(req).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return error_response(StatusCode::BAD_REQUEST, "missing multipart field 'video'"),
            Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
        }
    } else {
        match axum::body::to_bytes(req.into_body(), MAX_UPLOAD_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };

    let (width, height) = (state.ingest.width, state.ingest.height);
    let decoded =
        tokio::task::spawn_blocking(move || Frame::decode(&payload, width, height, 0)).await;

    match decoded {
        Ok(Ok(frame)) => {
            let stored = state.slot.put(frame);
            if stored.dropped {
                debug!(seq = stored.seq, "unprocessed frame replaced");
            }
            (StatusCode::OK, "Frame received").into_response()
        }
        Ok(Err(e)) => {
            debug!(error = %e, "rejected frame upload");
            (StatusCode::BAD_REQUEST, "Failed to decode frame").into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn video_field(req: Request) -> Result<Option<Bytes>, String> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| e.body_text())?;
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        if field.name() == Some("video") {
            return field.bytes().await.map(Some).map_err(|e| e.body_text());
        }
    }
    Ok(None)
}

/// POST /set_speed_limit  Body: { "max_speed": 50 }
async fn set_speed_limit(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(value) = serde_json::from_slice::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(max_speed)
    else {
        warn!("invalid speed limit request");
        return error_response(StatusCode::BAD_REQUEST, "Invalid speed limit value");
    };

    match state.limit.set(value) {
        Ok(change) => {
            info!(previous = change.previous, limit = change.current, "speed limit set via API");
            Json(json!({ "message": "Speed limit updated", "speedLimit": change.current }))
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "rejected speed limit");
            error_response(
                StatusCode::BAD_REQUEST,
                format!(
                    "Invalid speed limit range (must be between {MIN_SPEED_LIMIT} and {MAX_SPEED_LIMIT} km/h)"
                ),
            )
        }
    }
}

/// GET /speed_limit, in the same shape the poller consumes.
async fn get_speed_limit(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "max_speed": state.limit.get() }))
}

/// GET /overspeeding_cars
async fn list_overspeeding_cars(State(state): State<Arc<AppState>>) -> Response {
    match state.evidence.list().await {
        Ok(records) => {
            let cars: Vec<OverspeedingCar> = records
                .into_iter()
                .map(|r| OverspeedingCar {
                    image_path: state.evidence.images().public_url(&r.image_key),
                    id: r.id,
                    track_id: r.track_id,
                    speed: r.speed,
                    date: r.date,
                    time: r.time,
                })
                .collect();
            Json(json!({ "overspeeding_cars": cars })).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to list evidence");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// DELETE /overspeeding_cars/:id
async fn delete_overspeeding_car(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.evidence.delete(id).await {
        Ok(record) => Json(json!({ "message": "Evidence deleted", "id": record.id })).into_response(),
        Err(e) => {
            let status = delete_status(&e);
            if status.is_server_error() {
                error!(id, error = %e, "failed to delete evidence");
            }
            error_response(status, e.to_string())
        }
    }
}

fn delete_status(err: &PersistError) -> StatusCode {
    match err {
        PersistError::NotFound(_) => StatusCode::NOT_FOUND,
        PersistError::ImageDelete { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.stats.snapshot();
    Json(json!({
        "status": "ok",
        "tracks": stats.live_tracks,
        "frames": stats.frames,
        "dropped_frames": state.slot.overwritten(),
        "events": stats.events_submitted,
        "speed_limit": state.limit.get(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EvidenceDb;
    use crate::storage::{ImageStore, LocalStore};
    use axum::body::Body;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn state(name: &str) -> (Arc<AppState>, PathBuf) {
        let root = std::env::temp_dir().join(format!("speed-trap-routes-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let evidence = EvidenceStore::new(
            EvidenceDb::open_in_memory().unwrap(),
            ImageStore::Local(LocalStore::new(&root, "http://localhost:5000")),
            "cars/",
        );
        let state = AppState {
            slot: Arc::new(FrameSlot::new()),
            limit: Arc::new(SpeedLimitRegister::new(30).unwrap()),
            evidence: Arc::new(evidence),
            stats: Arc::default(),
            ingest: IngestConfig::default(),
        };
        (Arc::new(state), root)
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 200, 10]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
        buf.into_inner()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_request(field: &str, data: &[u8]) -> Request {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XBOUNDARY\r\n");
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"frame.jpg\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        Request::builder()
            .method("POST")
            .uri("/upload_video")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn multipart_upload_is_resized_into_slot() {
        let (state, _) = state("multipart");
        let resp = upload_video(State(Arc::clone(&state)), multipart_request("video", &jpeg(320, 240))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let frame = state.slot.take_copy().unwrap();
        assert_eq!((frame.width(), frame.height()), (640, 480));
    }

    #[tokio::test]
    async fn raw_body_upload_is_accepted() {
        let (state, _) = state("raw");
        let req = Request::builder()
            .method("POST")
            .uri("/upload_video")
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(Body::from(jpeg(640, 480)))
            .unwrap();
        let resp = upload_video(State(Arc::clone(&state)), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.slot.take_copy().is_some());
    }

    #[tokio::test]
    async fn undecodable_upload_leaves_slot_untouched() {
        let (state, _) = state("garbage");
        let resp = upload_video(State(Arc::clone(&state)), multipart_request("video", b"not a jpeg")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.slot.take_copy().is_none());

        let resp = upload_video(State(Arc::clone(&state)), multipart_request("image", &jpeg(8, 8))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.slot.take_copy().is_none());
    }

    fn event(track_id: u64) -> speed_trap_engine::emitter::OverspeedEvent {
        use chrono::{Local, TimeZone};
        speed_trap_engine::emitter::OverspeedEvent {
            track_id,
            speed_kmh: 45.5,
            limit_kmh: 30,
            image_jpeg: jpeg(16, 16),
            captured_at: Local.with_ymd_and_hms(2025, 3, 1, 14, 5, 9).unwrap(),
        }
    }

    #[tokio::test]
    async fn each_upload_gets_a_newer_seq() {
        let (state, _) = state("seq");
        let mut last = None;
        for _ in 0..3 {
            let resp = upload_video(State(Arc::clone(&state)), multipart_request("video", &jpeg(64, 48))).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let seq = state.slot.take_copy().unwrap().seq;
            assert!(last.map_or(true, |prev| seq > prev));
            last = Some(seq);
        }
    }

    #[test]
    fn image_mount_covers_only_the_prefix_directory() {
        let root = Path::new("/srv/evidence");
        assert_eq!(
            image_mount(root, "cars/"),
            ("/overspeeding/cars".to_string(), root.join("cars"))
        );
        assert_eq!(
            image_mount(root, "site/a/car_"),
            ("/overspeeding/site/a".to_string(), root.join("site/a"))
        );
        assert_eq!(image_mount(root, ""), ("/overspeeding".to_string(), root.to_path_buf()));
    }

    #[tokio::test]
    async fn images_are_served_but_not_the_rest_of_the_store() {
        let (state, root) = state("served");
        let reference = state.evidence.store(event(2)).await.unwrap();
        std::fs::write(root.join("evidence.db"), b"SQLite format 3\0").unwrap();

        let app = router(
            Arc::clone(&state),
            Some(LocalImages {
                root: root.clone(),
                prefix: "cars/".into(),
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let image = reqwest::get(format!("{base}/overspeeding/{}", reference.image_key))
            .await
            .unwrap();
        assert_eq!(image.status(), reqwest::StatusCode::OK);
        assert_eq!(image.bytes().await.unwrap(), jpeg(16, 16));

        let db = reqwest::get(format!("{base}/overspeeding/evidence.db")).await.unwrap();
        assert_eq!(db.status(), reqwest::StatusCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn set_speed_limit_reports_the_value_it_stored() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (state, _) = state("limit-race");
        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let limit = Arc::clone(&state.limit);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = limit.set(120);
                }
            })
        };

        for _ in 0..200 {
            let resp =
                set_speed_limit(State(Arc::clone(&state)), Bytes::from_static(br#"{"max_speed": 50}"#)).await;
            assert_eq!(body_json(resp).await["speedLimit"], 50);
        }
        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
    }

    #[tokio::test]
    async fn speed_limit_is_validated() {
        let (state, _) = state("limit");

        let resp = set_speed_limit(State(Arc::clone(&state)), Bytes::from_static(br#"{"max_speed": 50}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["speedLimit"], 50);

        for bad in [
            &br#"{"max_speed": 5}"#[..],
            br#"{"max_speed": 201}"#,
            br#"{"max_speed": "abc"}"#,
            br#"{"speed": 60}"#,
            b"not json",
        ] {
            let resp = set_speed_limit(State(Arc::clone(&state)), Bytes::from_static(bad)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.limit.get(), 50);

        let resp = get_speed_limit(State(Arc::clone(&state))).await;
        assert_eq!(resp.0, json!({ "max_speed": 50 }));
    }

    #[tokio::test]
    async fn listing_and_deleting_evidence() {
        let (state, root) = state("evidence");
        let reference = state.evidence.store(event(4)).await.unwrap();

        let resp = list_overspeeding_cars(State(Arc::clone(&state))).await;
        let doc = body_json(resp).await;
        let cars = doc["overspeeding_cars"].as_array().unwrap();
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0]["speed"], 45.5);
        assert_eq!(cars[0]["date"], "2025-03-01");
        assert_eq!(cars[0]["time"], "14:05:09");
        assert_eq!(
            cars[0]["image_path"],
            format!("http://localhost:5000/overspeeding/{}", reference.image_key)
        );

        let resp = delete_overspeeding_car(State(Arc::clone(&state)), AxumPath(reference.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!root.join(&reference.image_key).exists());

        let resp = delete_overspeeding_car(State(Arc::clone(&state)), AxumPath(reference.id)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn partial_delete_is_distinct_from_image_failure() {
        let partial = PersistError::PartialDelete {
            id: 1,
            image_key: "cars/a.jpeg".into(),
            reason: "disk I/O error".into(),
        };
        let image = PersistError::ImageDelete {
            id: 1,
            source: crate::storage::StorageError::Delete("denied".into()),
        };
        assert_eq!(delete_status(&partial), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(delete_status(&image), StatusCode::BAD_GATEWAY);
        assert!(partial.to_string().contains("record was not"));
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let (state, _) = state("health");
        let doc = health(State(state)).await.0;
        assert_eq!(doc["status"], "ok");
        assert_eq!(doc["tracks"], 0);
        assert_eq!(doc["speed_limit"], 30);
    }
}
