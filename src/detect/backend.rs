use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Person detector backend.
///
/// `detect` is blocking and CPU-bound. It must not keep the image beyond the
/// call and must already apply the configured confidence and overlap
/// thresholds. Errors (and panics) are scoped to the one frame by the caller.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect people in a frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once per worker before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds one backend per worker thread.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn DetectorBackend>>;
}

impl<F> DetectorFactory for F
where
    F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn DetectorBackend>> {
        self()
    }
}
