use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::ClusterParams;
use crate::control::ControlConfig;
use crate::detect::DetectorSettings;
use crate::ingest::SnapshotConfig;
use crate::orchestrator::CaptureSettings;
use crate::{HeadcountError, Preset, MAX_PRESET_NUMBER};

const DEFAULT_CAMERA_HOST: &str = "192.168.0.100";
const DEFAULT_CONTROL_PORT: u16 = 5678;
const DEFAULT_SNAPSHOT_PATH: &str = "/snapshot.jpg";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF_MS: u64 = 500;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_OVERLAP: f32 = 0.45;
const DEFAULT_CLUSTER_RADIUS: f32 = 50.0;
const DEFAULT_MIN_NEIGHBORS: usize = 2;
const DEFAULT_SETTLE_MS: u64 = 1_000;
const DEFAULT_RECALL_ATTEMPTS: u32 = 2;
const DEFAULT_RECALL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_DEPTH: usize = 4;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 120;
const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Debug, Deserialize, Default)]
struct HeadcountConfigFile {
    presets: Option<Vec<PresetEntry>>,
    preset_file: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    detector: Option<DetectorConfigFile>,
    clustering: Option<ClusteringConfigFile>,
    capture: Option<CaptureConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PresetFile {
    presets: Vec<PresetEntry>,
}

#[derive(Debug, Deserialize)]
struct PresetEntry {
    number: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    host: Option<String>,
    control_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    completion_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
    attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
    overlap_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClusteringConfigFile {
    radius: Option<f32>,
    min_neighbors: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    settle_ms: Option<u64>,
    recall_attempts: Option<u32>,
    recall_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    workers: Option<usize>,
    queue_depth: Option<usize>,
    drain_timeout_secs: Option<u64>,
}

/// Everything a run needs, resolved from file, environment and defaults.
#[derive(Debug, Clone)]
pub struct HeadcountConfig {
    pub presets: Vec<Preset>,
    pub control: ControlConfig,
    pub snapshot: SnapshotConfig,
    pub detector: DetectorSettings,
    pub clustering: ClusterParams,
    pub capture: CaptureSettings,
    pub workers: usize,
    pub queue_depth: usize,
    /// Longest wait for outstanding detections once the tour is over.
    pub drain_timeout: Duration,
    pub output_dir: PathBuf,
}

impl Default for HeadcountConfig {
    fn default() -> Self {
        Self {
            presets: Vec::new(),
            control: ControlConfig::default(),
            snapshot: SnapshotConfig {
                url: default_snapshot_url(DEFAULT_CAMERA_HOST),
                ..SnapshotConfig::default()
            },
            detector: DetectorSettings::default(),
            clustering: ClusterParams::default(),
            capture: CaptureSettings::default(),
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl HeadcountConfig {
    /// Loads from `HEADCOUNT_CONFIG` (if set), then applies environment overrides.
    pub fn load() -> Result<Self, HeadcountError> {
        let config_path = std::env::var("HEADCOUNT_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self, HeadcountError> {
        let (file_cfg, base_dir) = match path {
            Some(path) => (
                read_config_file::<HeadcountConfigFile>(path)?,
                path.parent().map(Path::to_path_buf),
            ),
            None => (HeadcountConfigFile::default(), None),
        };
        let mut cfg = Self::from_file(file_cfg, base_dir.as_deref())?;
        cfg.apply_env()?;
        if cfg.snapshot.url.is_empty() {
            cfg.snapshot.url = default_snapshot_url(&cfg.control.host);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HeadcountConfigFile, base_dir: Option<&Path>) -> Result<Self, HeadcountError> {
        let entries = match (file.presets, file.preset_file) {
            (Some(_), Some(_)) => {
                return Err(HeadcountError::config(
                    "set either presets or preset_file, not both",
                ))
            }
            (Some(entries), None) => entries,
            (None, Some(preset_file)) => {
                let resolved = match base_dir {
                    Some(dir) if preset_file.is_relative() => dir.join(&preset_file),
                    _ => preset_file,
                };
                read_config_file::<PresetFile>(&resolved)?.presets
            }
            (None, None) => Vec::new(),
        };
        let presets = entries
            .into_iter()
            .map(preset_from_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let camera = file.camera.unwrap_or_default();
        let control = ControlConfig {
            host: camera
                .host
                .unwrap_or_else(|| DEFAULT_CAMERA_HOST.to_string()),
            port: camera.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
            connect_timeout: Duration::from_millis(
                camera.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            command_timeout: Duration::from_millis(
                camera.command_timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            ),
            completion_timeout: Duration::from_millis(
                camera
                    .completion_timeout_ms
                    .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_MS),
            ),
        };

        let snapshot_file = file.snapshot.unwrap_or_default();
        let snapshot = SnapshotConfig {
            // Empty until the host is final; filled in by `load_from`.
            url: snapshot_file.url.unwrap_or_default(),
            username: camera.username,
            password: camera.password,
            timeout: Duration::from_millis(snapshot_file.timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS)),
            attempts: snapshot_file.attempts.unwrap_or(DEFAULT_FETCH_ATTEMPTS),
            backoff: Duration::from_millis(snapshot_file.backoff_ms.unwrap_or(DEFAULT_FETCH_BACKOFF_MS)),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
            confidence: detector_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE),
            overlap: detector_file.overlap_threshold.unwrap_or(DEFAULT_OVERLAP),
        };

        let clustering = file.clustering.unwrap_or_default();
        let clustering = ClusterParams {
            radius: clustering.radius.unwrap_or(DEFAULT_CLUSTER_RADIUS),
            min_neighbors: clustering.min_neighbors.unwrap_or(DEFAULT_MIN_NEIGHBORS),
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            settle: Duration::from_millis(capture_file.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
            recall_attempts: capture_file
                .recall_attempts
                .unwrap_or(DEFAULT_RECALL_ATTEMPTS),
            recall_backoff: Duration::from_millis(
                capture_file
                    .recall_backoff_ms
                    .unwrap_or(DEFAULT_RECALL_BACKOFF_MS),
            ),
        };

        let pipeline = file.pipeline.unwrap_or_default();
        Ok(Self {
            presets,
            control,
            snapshot,
            detector,
            clustering,
            capture,
            workers: pipeline.workers.unwrap_or(DEFAULT_WORKERS),
            queue_depth: pipeline.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            drain_timeout: Duration::from_secs(
                pipeline
                    .drain_timeout_secs
                    .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        })
    }

    fn apply_env(&mut self) -> Result<(), HeadcountError> {
        if let Some(host) = env_value("HEADCOUNT_CAMERA_HOST") {
            self.control.host = host;
        }
        if let Some(port) = env_value("HEADCOUNT_CONTROL_PORT") {
            self.control.port = port.parse().map_err(|_| {
                HeadcountError::config("HEADCOUNT_CONTROL_PORT must be a TCP port number")
            })?;
        }
        if let Some(url) = env_value("HEADCOUNT_SNAPSHOT_URL") {
            self.snapshot.url = url;
        }
        if let Some(user) = env_value("HEADCOUNT_CAMERA_USER") {
            self.snapshot.username = Some(user);
        }
        if let Some(pass) = env_value("HEADCOUNT_CAMERA_PASS") {
            self.snapshot.password = Some(pass);
        }
        if let Some(workers) = env_value("HEADCOUNT_WORKERS") {
            self.workers = workers.parse().map_err(|_| {
                HeadcountError::config("HEADCOUNT_WORKERS must be a positive integer")
            })?;
        }
        if let Some(dir) = env_value("HEADCOUNT_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_value("HEADCOUNT_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(backend) = env_value("HEADCOUNT_DETECTOR") {
            self.detector.backend = backend;
        }
        Ok(())
    }

    /// Checks every setting a run depends on.
    pub fn validate(&self) -> Result<(), HeadcountError> {
        if self.presets.is_empty() {
            return Err(HeadcountError::config("no presets configured"));
        }
        let mut seen = HashSet::new();
        for preset in &self.presets {
            if preset.number == 0 || preset.number > MAX_PRESET_NUMBER {
                return Err(HeadcountError::config(format!(
                    "preset number {} out of range 1..={}",
                    preset.number, MAX_PRESET_NUMBER
                )));
            }
            if !seen.insert(preset.number) {
                return Err(HeadcountError::config(format!(
                    "duplicate preset number {}",
                    preset.number
                )));
            }
            if preset.name.trim().is_empty() {
                return Err(HeadcountError::config(format!(
                    "preset {} has an empty name",
                    preset.number
                )));
            }
        }

        if self.control.host.trim().is_empty() {
            return Err(HeadcountError::config("camera host must not be empty"));
        }
        if self.control.port == 0 {
            return Err(HeadcountError::config("control port must not be 0"));
        }
        for (name, value) in [
            ("connect timeout", self.control.connect_timeout),
            ("command timeout", self.control.command_timeout),
            ("completion timeout", self.control.completion_timeout),
            ("snapshot timeout", self.snapshot.timeout),
            ("drain timeout", self.drain_timeout),
        ] {
            if value.is_zero() {
                return Err(HeadcountError::config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        match url::Url::parse(&self.snapshot.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(HeadcountError::config(format!(
                    "snapshot url scheme '{}' is not http(s)",
                    url.scheme()
                )))
            }
            Err(e) => {
                return Err(HeadcountError::config(format!(
                    "invalid snapshot url '{}': {}",
                    self.snapshot.url, e
                )))
            }
        }
        if self.snapshot.attempts == 0 {
            return Err(HeadcountError::config("snapshot attempts must be at least 1"));
        }
        if self.capture.recall_attempts == 0 {
            return Err(HeadcountError::config("recall attempts must be at least 1"));
        }

        for (name, value) in [
            ("confidence threshold", self.detector.confidence),
            ("overlap threshold", self.detector.overlap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HeadcountError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.detector.backend.trim().is_empty() {
            return Err(HeadcountError::config("detector backend must not be empty"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(HeadcountError::config("detector input size must be non-zero"));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(HeadcountError::config(
                "detector backend 'tract' requires a model path",
            ));
        }
        self.clustering
            .validate()
            .map_err(|e| HeadcountError::config(e.to_string()))?;

        if self.workers == 0 {
            return Err(HeadcountError::config("workers must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(HeadcountError::config("queue depth must be at least 1"));
        }
        Ok(())
    }
}

fn preset_from_entry(entry: PresetEntry) -> Result<Preset, HeadcountError> {
    let number = u16::try_from(entry.number)
        .ok()
        .filter(|n| (1..=MAX_PRESET_NUMBER).contains(n))
        .ok_or_else(|| {
            HeadcountError::config(format!(
                "preset number {} out of range 1..={}",
                entry.number, MAX_PRESET_NUMBER
            ))
        })?;
    let name = entry
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| Preset::default_name(number));
    Ok(Preset::new(number, name))
}

fn default_snapshot_url(host: &str) -> String {
    format!("http://{}{}", host, DEFAULT_SNAPSHOT_PATH)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, HeadcountError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        HeadcountError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        HeadcountError::config(format!("invalid config file {}: {}", path.display(), e))
    })
}
