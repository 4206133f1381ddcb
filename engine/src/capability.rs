//! Contracts for the two vision capabilities the engine drives.
//!
//! The engine never looks inside a detector or tracker: anything satisfying
//! these traits can be plugged in, including the deterministic stubs used in
//! tests and the baseline implementations in [`crate::vision`].

use image::{GrayImage, RgbImage};

use crate::geometry::BoundingBox;

/// Finds vehicle-like regions in a single-channel frame.
pub trait Detector: Send {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>, CapabilityError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Result of one tracker step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    pub bbox: BoundingBox,
    /// Confidence that the target is still located; larger is better.
    pub quality: f64,
}

/// Follows one object from frame to frame.
pub trait Tracker: Send {
    fn update(&mut self, frame: &RgbImage) -> Result<TrackUpdate, CapabilityError>;
}

/// Creates a tracker locked onto `bbox` in `frame`.
pub trait TrackerFactory: Send {
    fn seed(
        &mut self,
        frame: &RgbImage,
        bbox: BoundingBox,
    ) -> Result<Box<dyn Tracker>, CapabilityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("detection failed: {0}")]
    Detect(String),
    #[error("failed to seed tracker: {0}")]
    Seed(String),
    #[error("tracker update failed: {0}")]
    Update(String),
}
