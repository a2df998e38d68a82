//! Captured frames.
//!
//! A `CapturedFrame` is produced once per successful preset visit and moved into
//! the pipeline. It is deliberately not `Clone`: after `submit` exactly one
//! worker owns the pixels.

use chrono::{DateTime, Local};
use image::RgbImage;

use crate::Preset;

pub struct CapturedFrame {
    preset: Preset,
    image: RgbImage,
    captured_at: DateTime<Local>,
}

impl CapturedFrame {
    pub fn new(preset: Preset, image: RgbImage) -> Self {
        Self::captured_at(preset, image, Local::now())
    }

    pub fn captured_at(preset: Preset, image: RgbImage, captured_at: DateTime<Local>) -> Self {
        Self {
            preset,
            image,
            captured_at,
        }
    }

    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn into_parts(self) -> (Preset, RgbImage, DateTime<Local>) {
        (self.preset, self.image, self.captured_at)
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("preset", &self.preset)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}
