use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::upload::Uploader;
use crate::ProducerError;

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker, e.g. `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Splits a `multipart/x-mixed-replace` byte stream into JPEG payloads.
/// Chunks may cut markers anywhere.
pub struct MjpegSplitter {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegSplitter {
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        Self {
            marker: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Boundary named in a `Content-Type` header, if any.
    pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
        content_type.split(';').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
                .filter(|b| !b.is_empty())
        })
    }

    /// Feed a chunk; returns every JPEG it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let marker_len = self.marker.len();
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + marker_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > marker_len {
                            let _ = self.buffer.split_to(self.buffer.len() - marker_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], &self.marker)
                    else {
                        // Skip re-scanning what cannot hold the start of a marker.
                        self.jpeg_start = self.buffer.len().saturating_sub(marker_len);
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + marker_len);
                    part.truncate(end);
                    if !part.is_empty() {
                        frames.push(part.freeze());
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

/// Consume the MJPEG stream and upload frames, at most `fps` per second.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_producer(stream_url: &str, uploader: &Uploader, fps: f64) {
    let mut backoff = INITIAL_BACKOFF;
    let min_interval = frame_interval(fps);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, uploader, min_interval).await {
            Ok(frames) => {
                info!(frames, "stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn consume_stream(
    url: &str,
    uploader: &Uploader,
    min_interval: Duration,
) -> Result<u64, ProducerError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ProducerError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(ProducerError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(ProducerError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(MjpegSplitter::boundary_from_content_type)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
    info!(status = %response.status(), boundary, "connected to MJPEG stream");

    let mut splitter = MjpegSplitter::new(&boundary);
    let mut byte_stream = response.bytes_stream();
    let mut last_upload: Option<Instant> = None;
    let mut seq: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProducerError::HttpStream)?;
        for jpeg in splitter.push(&chunk) {
            if last_upload.is_some_and(|t| t.elapsed() < min_interval) {
                continue;
            }
            last_upload = Some(Instant::now());
            seq += 1;
            if let Err(e) = uploader.upload(seq, jpeg).await {
                warn!(error = %e, seq, "failed to upload frame");
            }
        }
    }

    Ok(seq)
}

/// Polling fallback: fetch single JPEG snapshots at `fps`.
pub async fn run_polling_producer(frame_url: &str, uploader: &Uploader, fps: f64) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(frame_interval(fps));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut seq: u64 = 0;

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(jpeg) => {
                    seq += 1;
                    if let Err(e) = uploader.upload(seq, jpeg).await {
                        warn!(error = %e, seq, "failed to upload frame");
                    }
                }
                Err(e) => warn!(error = %e, "failed to read camera frame"),
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
            }
            Err(e) => {
                debug!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}

fn frame_interval(fps: f64) -> Duration {
    if fps.is_finite() && fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::ZERO
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
