use std::io::Cursor;
use std::sync::Arc;

use ab_glyph::{FontArc, PxScale};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::geometry::BoundingBox;
use crate::limit::SpeedLimitRegister;
use crate::registry::TrackId;

const EVIDENCE_RED: Rgb<u8> = Rgb([255, 0, 0]);
const BORDER_PX: u32 = 3;

/// Evidence for one vehicle measured above the limit.
#[derive(Debug, Clone)]
pub struct OverspeedEvent {
    pub track_id: TrackId,
    pub speed_kmh: f64,
    /// Limit in force when the comparison was made.
    pub limit_kmh: u32,
    /// JPEG of the vehicle crop with the speed overlay.
    pub image_jpeg: Vec<u8>,
    pub captured_at: DateTime<Local>,
}

impl OverspeedEvent {
    /// e.g. "2025-03-01"
    pub fn date(&self) -> String {
        self.captured_at.format("%Y-%m-%d").to_string()
    }

    /// e.g. "14:05:09"
    pub fn time(&self) -> String {
        self.captured_at.format("%H:%M:%S").to_string()
    }
}

/// Where finished events go. Implementations must not block the caller for
/// long: the processing loop calls this inline.
pub trait EventSink: Send {
    fn submit(&self, event: OverspeedEvent) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("persistence queue is full")]
    Full,
    #[error("persistence queue is closed")]
    Closed,
}

/// Crops, annotates and encodes the evidence image.
pub struct EvidenceRenderer {
    jpeg_quality: u8,
    font: Option<FontArc>,
}

impl EvidenceRenderer {
    pub fn new(jpeg_quality: u8, font: Option<FontArc>) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
            font,
        }
    }

    /// Load the caption font from a TTF/OTF file.
    pub fn load_font(path: &std::path::Path) -> Result<FontArc, EmitError> {
        let bytes = std::fs::read(path)
            .map_err(|e| EmitError::Font(format!("{}: {e}", path.display())))?;
        FontArc::try_from_vec(bytes).map_err(|e| EmitError::Font(e.to_string()))
    }

    pub fn render(
        &self,
        frame: &RgbImage,
        bbox: &BoundingBox,
        speed_kmh: f64,
    ) -> Result<Vec<u8>, EmitError> {
        let region = bbox
            .clamp_to(frame.width(), frame.height())
            .ok_or(EmitError::DegenerateCrop { bbox: *bbox })?;

        let mut crop =
            image::imageops::crop_imm(frame, region.x, region.y, region.width, region.height)
                .to_image();

        for inset in 0..BORDER_PX {
            let (w, h) = (crop.width(), crop.height());
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at(inset as i32, inset as i32).of_size(w - 2 * inset, h - 2 * inset);
            draw_hollow_rect_mut(&mut crop, rect, EVIDENCE_RED);
        }

        if let Some(font) = &self.font {
            let scale = PxScale::from((crop.height() as f32 / 8.0).max(12.0));
            let caption = format!("OVERSPEEDING {speed_kmh} km/h");
            let offset = (BORDER_PX + 1) as i32;
            draw_text_mut(&mut crop, EVIDENCE_RED, offset, offset, scale, font, &caption);
        }

        let mut buf = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality)
            .encode_image(&crop)
            .map_err(|e| EmitError::Encode(e.to_string()))?;
        Ok(buf.into_inner())
    }
}

/// Outcome of checking one measurement against the limit.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    WithinLimit { limit_kmh: u32 },
    Submitted { limit_kmh: u32 },
    Skipped(EmitError),
}

/// Compares measurements with the live speed limit and hands evidence for
/// offenders to the sink.
pub struct OverspeedEmitter {
    limit: Arc<SpeedLimitRegister>,
    renderer: EvidenceRenderer,
    sink: Box<dyn EventSink>,
}

impl OverspeedEmitter {
    pub fn new(
        limit: Arc<SpeedLimitRegister>,
        renderer: EvidenceRenderer,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self {
            limit,
            renderer,
            sink,
        }
    }

    pub fn consider(
        &self,
        track_id: TrackId,
        speed_kmh: f64,
        bbox: &BoundingBox,
        frame: &RgbImage,
        captured_at: DateTime<Local>,
    ) -> EmitOutcome {
        // Read at comparison time so a limit change applies to the very next vehicle.
        let limit_kmh = self.limit.get();
        if speed_kmh <= f64::from(limit_kmh) {
            return EmitOutcome::WithinLimit { limit_kmh };
        }

        let image_jpeg = match self.renderer.render(frame, bbox, speed_kmh) {
            Ok(bytes) => bytes,
            Err(e @ EmitError::DegenerateCrop { .. }) => {
                debug!(track_id, ?bbox, "empty evidence crop, skipping event");
                return EmitOutcome::Skipped(e);
            }
            Err(e) => {
                warn!(track_id, error = %e, "failed to render evidence, skipping event");
                return EmitOutcome::Skipped(e);
            }
        };

        let event = OverspeedEvent {
            track_id,
            speed_kmh,
            limit_kmh,
            image_jpeg,
            captured_at,
        };

        match self.sink.submit(event) {
            Ok(()) => {
                info!(track_id, speed_kmh, limit_kmh, "vehicle overspeeding, evidence queued");
                EmitOutcome::Submitted { limit_kmh }
            }
            Err(e) => {
                warn!(track_id, speed_kmh, error = %e, "dropping overspeed event");
                EmitOutcome::Skipped(EmitError::Sink(e))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmitError {
    #[error("crop region {bbox:?} is empty")]
    DegenerateCrop { bbox: BoundingBox },
    #[error("failed to encode evidence JPEG: {0}")]
    Encode(String),
    #[error("failed to load overlay font: {0}")]
    Font(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
}
