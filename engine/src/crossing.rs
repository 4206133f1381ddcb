use std::time::{Duration, Instant};

use speed_trap_common::config::TrackingConfig;
use tracing::debug;

use crate::geometry::BoundingBox;
use crate::registry::TrackId;

/// Moment a track's box first straddled the reference line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingRecord {
    pub track_id: TrackId,
    pub started_at: Instant,
}

/// What one observation did to a track's crossing state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrossingStep {
    /// Nothing changed.
    None,
    /// A new record was opened.
    Entered,
    /// The box cleared the line; the record was consumed.
    Measured { speed_kmh: f64, elapsed: Duration },
}

/// Times a box's transit of a horizontal reference line and turns the
/// elapsed time into km/h.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    line_y: u32,
    distance_m: f64,
    calibration: f64,
    max_speed_kmh: f64,
}

impl SpeedEstimator {
    pub fn new(line_y: u32, distance_m: f64, calibration: f64, max_speed_kmh: f64) -> Self {
        Self {
            line_y,
            distance_m,
            calibration,
            max_speed_kmh,
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(
            config.line_y,
            config.distance_m,
            config.calibration,
            config.max_speed_kmh,
        )
    }

    pub fn line_y(&self) -> u32 {
        self.line_y
    }

    /// `(distance / elapsed) * calibration * 3.6`, capped and rounded to
    /// two decimals. Zero or negative elapsed time gives 0.
    pub fn speed_for(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
            return 0.0;
        }
        let raw = (self.distance_m / elapsed_secs) * self.calibration * 3.6;
        round2(raw.min(self.max_speed_kmh))
    }

    /// Advance the crossing state of one track after its box was updated.
    pub fn observe(
        &self,
        track_id: TrackId,
        record: &mut Option<CrossingRecord>,
        bbox: &BoundingBox,
        now: Instant,
    ) -> CrossingStep {
        match *record {
            None if bbox.straddles_row(self.line_y) => {
                *record = Some(CrossingRecord {
                    track_id,
                    started_at: now,
                });
                debug!(track_id, line_y = self.line_y, "track entered reference line");
                CrossingStep::Entered
            }
            Some(open) if bbox.is_past_row(self.line_y) => {
                let elapsed = now.saturating_duration_since(open.started_at);
                *record = None;
                CrossingStep::Measured {
                    speed_kmh: self.speed_for(elapsed.as_secs_f64()),
                    elapsed,
                }
            }
            _ => CrossingStep::None,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
