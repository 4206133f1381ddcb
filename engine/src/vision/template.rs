use image::imageops::{crop_imm, grayscale};
use image::{GrayImage, RgbImage};
use speed_trap_common::config::TrackerConfig;

use crate::capability::{CapabilityError, TrackUpdate, Tracker, TrackerFactory};
use crate::geometry::BoundingBox;

/// Top of the quality scale, so that the customary correlation-tracker
/// threshold of 7 separates a held target from a lost one.
const QUALITY_SCALE: f64 = 20.0;
/// Template is re-captured after updates at least this good.
const REFRESH_QUALITY: f64 = 10.0;
/// Offsets within this distance of the best match are not sidelobe.
const PEAK_EXCLUSION: u32 = 2;
/// Template pixels sampled on a grid of this pitch.
const SAMPLE_STEP: usize = 2;

pub struct TemplateTrackerFactory {
    search_margin: u32,
}

impl TemplateTrackerFactory {
    pub fn new(search_margin: u32) -> Self {
        Self { search_margin }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.search_margin)
    }
}

impl TrackerFactory for TemplateTrackerFactory {
    fn seed(
        &mut self,
        frame: &RgbImage,
        bbox: BoundingBox,
    ) -> Result<Box<dyn Tracker>, CapabilityError> {
        let region = bbox
            .clamp_to(frame.width(), frame.height())
            .ok_or_else(|| CapabilityError::Seed(format!("box {bbox:?} lies outside the frame")))?;
        let gray = grayscale(frame);
        let template = crop_imm(&gray, region.x, region.y, region.width, region.height).to_image();
        Ok(Box::new(TemplateTracker {
            template,
            bbox: region,
            search_margin: self.search_margin,
        }))
    }
}

/// Follows a fixed-size grey-level template by exhaustive
/// sum-of-absolute-differences search around the last position.
///
/// Quality combines how well the best offset matches (`1 - mad/255`) with
/// how much better it is than the surrounding offsets, scaled to
/// `0..=QUALITY_SCALE`. A target that vanished or blends into the road
/// scores near zero.
pub struct TemplateTracker {
    template: GrayImage,
    bbox: BoundingBox,
    search_margin: u32,
}

impl Tracker for TemplateTracker {
    fn update(&mut self, frame: &RgbImage) -> Result<TrackUpdate, CapabilityError> {
        let gray = grayscale(frame);
        let (tw, th) = self.template.dimensions();
        if gray.width() < tw || gray.height() < th {
            return Ok(TrackUpdate {
                bbox: self.bbox,
                quality: 0.0,
            });
        }

        let max_x = gray.width() - tw;
        let max_y = gray.height() - th;
        let m = self.search_margin;
        let (x_lo, x_hi) = (self.bbox.x.saturating_sub(m).min(max_x), (self.bbox.x + m).min(max_x));
        let (y_lo, y_hi) = (self.bbox.y.saturating_sub(m).min(max_y), (self.bbox.y + m).min(max_y));

        let mut scores = Vec::with_capacity(((x_hi - x_lo + 1) * (y_hi - y_lo + 1)) as usize);
        for y in y_lo..=y_hi {
            for x in x_lo..=x_hi {
                scores.push((x, y, mean_abs_diff(&gray, &self.template, x, y)));
            }
        }

        let Some(&(bx, by, best)) = scores.iter().min_by(|a, b| a.2.total_cmp(&b.2)) else {
            return Err(CapabilityError::Update("empty search window".into()));
        };

        let quality = match_quality(&scores, bx, by, best);
        self.bbox = BoundingBox::new(bx, by, tw, th);
        if quality >= REFRESH_QUALITY {
            self.template = crop_imm(&gray, bx, by, tw, th).to_image();
        }

        Ok(TrackUpdate {
            bbox: self.bbox,
            quality,
        })
    }
}

/// Mean absolute grey-level difference of the template placed at (ox, oy).
fn mean_abs_diff(gray: &GrayImage, template: &GrayImage, ox: u32, oy: u32) -> f64 {
    let mut sum = 0u64;
    let mut n = 0u64;
    for ty in (0..template.height()).step_by(SAMPLE_STEP) {
        for tx in (0..template.width()).step_by(SAMPLE_STEP) {
            let a = gray.get_pixel(ox + tx, oy + ty)[0];
            let b = template.get_pixel(tx, ty)[0];
            sum += u64::from(a.abs_diff(b));
            n += 1;
        }
    }
    if n == 0 {
        return 255.0;
    }
    sum as f64 / n as f64
}

fn match_quality(scores: &[(u32, u32, f64)], bx: u32, by: u32, best: f64) -> f64 {
    let (sum, count) = scores
        .iter()
        .filter(|(x, y, _)| x.abs_diff(bx) > PEAK_EXCLUSION || y.abs_diff(by) > PEAK_EXCLUSION)
        .fold((0.0, 0usize), |(s, c), &(_, _, v)| (s + v, c + 1));
    if count == 0 {
        return 0.0;
    }
    let sidelobe_mean = sum / count as f64;
    if sidelobe_mean <= f64::EPSILON {
        return 0.0;
    }
    let contrast = ((sidelobe_mean - best) / sidelobe_mean).clamp(0.0, 1.0);
    let fit = 1.0 - best / 255.0;
    QUALITY_SCALE * fit * contrast
}
