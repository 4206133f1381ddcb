use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};
use speed_trap_common::config::DetectorConfig;
use tracing::debug;

use crate::capability::{CapabilityError, Detector};
use crate::geometry::BoundingBox;

/// Fragments closer than this many pixels are merged into one blob.
const MERGE_RADIUS: u8 = 2;

/// Foreground detector for a fixed camera.
///
/// Keeps a running-average background and reports the bounding boxes of
/// connected regions that differ from it by more than `diff_threshold`.
/// The background only learns when `detect` is called, i.e. on the
/// detection cadence, not every frame.
pub struct MotionDetector {
    background: Vec<f32>,
    dims: (u32, u32),
    diff_threshold: u8,
    min_width: u32,
    min_height: u32,
    learning_rate: f32,
}

impl MotionDetector {
    pub fn new(diff_threshold: u8, min_width: u32, min_height: u32, learning_rate: f32) -> Self {
        Self {
            background: Vec::new(),
            dims: (0, 0),
            diff_threshold,
            min_width,
            min_height,
            learning_rate: learning_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.diff_threshold,
            config.min_width,
            config.min_height,
            config.learning_rate,
        )
    }

    /// Pixels that differ from the background, then fold the frame into the
    /// background. `None` while the background is being (re)initialised.
    fn foreground_mask(&mut self, gray: &GrayImage) -> Option<GrayImage> {
        if self.dims != gray.dimensions() || self.background.is_empty() {
            debug!(width = gray.width(), height = gray.height(), "initialising background model");
            self.dims = gray.dimensions();
            self.background = gray.as_raw().iter().map(|&p| f32::from(p)).collect();
            return None;
        }

        let threshold = f32::from(self.diff_threshold);
        let alpha = self.learning_rate;
        let mut mask = GrayImage::new(gray.width(), gray.height());
        for ((bg, &px), out) in self
            .background
            .iter_mut()
            .zip(gray.as_raw().iter())
            .zip(mask.iter_mut())
        {
            let px = f32::from(px);
            if (px - *bg).abs() > threshold {
                *out = 255;
            }
            *bg = *bg * (1.0 - alpha) + px * alpha;
        }
        Some(mask)
    }
}

impl Detector for MotionDetector {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>, CapabilityError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Err(CapabilityError::Detect("empty frame".into()));
        }
        let Some(mask) = self.foreground_mask(gray) else {
            return Ok(Vec::new());
        };

        let mask = dilate(&mask, Norm::LInf, MERGE_RADIUS);
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        // label -> (min_x, min_y, max_x, max_y); labels follow raster order.
        let mut extents: BTreeMap<u32, (u32, u32, u32, u32)> = BTreeMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0];
            if label == 0 {
                continue;
            }
            extents
                .entry(label)
                .and_modify(|e| {
                    e.0 = e.0.min(x);
                    e.1 = e.1.min(y);
                    e.2 = e.2.max(x);
                    e.3 = e.3.max(y);
                })
                .or_insert((x, y, x, y));
        }

        let boxes: Vec<BoundingBox> = extents
            .values()
            .map(|&(x0, y0, x1, y1)| BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
            .filter(|b| b.width >= self.min_width && b.height >= self.min_height)
            .collect();

        debug!(blobs = extents.len(), kept = boxes.len(), "motion blobs");
        Ok(boxes)
    }

    fn name(&self) -> &str {
        "motion"
    }
}
