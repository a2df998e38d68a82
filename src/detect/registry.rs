use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, DetectorFactory};
use super::backends::StubBackend;

/// Detector selection and thresholds, as configured.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    /// Minimum person score kept by the backend.
    pub confidence: f32,
    /// IoU above which overlapping boxes are suppressed.
    pub overlap: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            input_width: 640,
            input_height: 640,
            confidence: 0.25,
            overlap: 0.45,
        }
    }
}

type Builder = Arc<dyn Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Named detector backends.
///
/// Workers each need their own backend instance (`detect` takes `&mut self`),
/// so the registry hands out factories rather than shared backends.
pub struct BackendRegistry {
    builders: HashMap<String, Builder>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_| {
            Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>)
        });
        #[cfg(feature = "backend-tract")]
        registry.register("tract", |settings| {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires a model path"))?;
            let backend = super::backends::TractBackend::new(
                model_path,
                settings.input_width,
                settings.input_height,
            )?
            .with_thresholds(settings.confidence, settings.overlap);
            Ok(Box::new(backend) as Box<dyn DetectorBackend>)
        });
        registry
    }

    /// Register a backend builder under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Factory for the backend named in `settings`.
    pub fn factory(&self, settings: &DetectorSettings) -> Result<Arc<dyn DetectorFactory>> {
        let builder = self.builders.get(&settings.backend).cloned().ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (registered: {})",
                settings.backend,
                self.list().join(", ")
            )
        })?;
        let settings = settings.clone();
        let factory = move || builder(&settings);
        Ok(Arc::new(factory))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
