//! Baseline implementations of the detection and tracking capabilities.
//!
//! These need nothing beyond `image`/`imageproc` and are good enough for a
//! fixed camera over a road. Heavier detectors (cascade classifiers, neural
//! nets) and correlation trackers plug in through the same traits.

pub mod motion;
pub mod template;

pub use motion::MotionDetector;
pub use template::{TemplateTracker, TemplateTrackerFactory};
