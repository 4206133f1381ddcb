use image::imageops::FilterType;
use image::{GrayImage, ImageReader, RgbImage};
use std::io::Cursor;

/// A decoded camera frame at the canonical processing resolution.
///
/// Frames are ordered by `seq`, which the ingestion path assigns on arrival;
/// there is no capture timestamp from the camera side.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub seq: u64,
    pub received_at_ms: i64,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            received_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...) and resize it to `width` x `height`.
    pub fn decode(data: &[u8], width: u32, height: u32, seq: u64) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?;

        let rgb = if img.width() == width && img.height() == height {
            img.to_rgb8()
        } else {
            img.resize_exact(width, height, FilterType::Triangle).to_rgb8()
        };
        Ok(Self::new(rgb, seq))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Single-channel intensity view, as fed to the detector.
    pub fn gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload is empty")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Decode(String),
}
