use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend. Returns the same detections for every frame (none by default).
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    #[test]
    fn stub_backend_repeats_fixture() {
        let image = RgbImage::new(4, 4);
        assert!(StubBackend::new().detect(&image).unwrap().is_empty());

        let det = Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 0.8);
        let mut backend = StubBackend::with_detections(vec![det]);
        assert_eq!(backend.detect(&image).unwrap(), vec![det]);
        assert_eq!(backend.detect(&image).unwrap(), vec![det]);
    }
}
