//! PTZ Headcount
//!
//! Tours the presets of a pan-tilt-zoom camera, captures one still per preset,
//! runs person detection over the stills and turns raw detections into a
//! deduplicated head count per preset.
//!
//! # Architecture
//!
//! - `control`: VISCA codec and the control session state machine
//! - `ingest`: snapshot retrieval from the camera's HTTP endpoint
//! - `frame`: captured frames (owned, moved once into the pipeline)
//! - `detect`: detector contract, backends and registry
//! - `cluster`: density-based grouping of detections into people
//! - `pipeline`: bounded worker pool for detection + clustering
//! - `aggregate`: preset-ordered run result
//! - `orchestrator`: sequential preset tour and the run driver
//! - `config`, `export`: startup configuration and result artifacts
//!
//! Failures are scoped to the preset they happen on. A run always yields one
//! `PresetResult` per configured preset; only `ConfigInvalid` prevents a run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod aggregate;
pub mod annotate;
pub mod cluster;
pub mod config;
pub mod control;
pub mod detect;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod pipeline;

pub use aggregate::{Aggregator, PresetResult, RunResult};
pub use cluster::{ClusterAssignment, ClusterLabel, ClusterParams};
pub use config::HeadcountConfig;
pub use control::{ControlConfig, ControlSession, RecallOutcome, SessionState};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, DetectorFactory};
pub use export::{export_run, ExportSummary};
pub use frame::CapturedFrame;
pub use ingest::{SnapshotConfig, SnapshotFetcher};
pub use orchestrator::{CaptureOrchestrator, CaptureSettings, HeadcountRun};
pub use pipeline::{Dispatcher, PresetOutcome};

/// Highest preset number addressable by the one-byte VISCA memory field.
pub const MAX_PRESET_NUMBER: u16 = 255;

// -------------------- Presets --------------------

/// A named, numbered camera viewpoint the device can recall on command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub number: u16,
    pub name: String,
}

impl Preset {
    pub fn new(number: u16, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
        }
    }

    /// Name used when the configuration leaves it out.
    pub fn default_name(number: u16) -> String {
        format!("Preset {}", number)
    }

    /// Filesystem-friendly form of the name.
    pub fn file_stem(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}_{}", name, self.number)
    }
}

// -------------------- Errors --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionFailed,
    ProtocolTimeout,
    ProtocolRejected,
    ConnectionLost,
    FetchTimeout,
    FetchFailed,
    DetectionFailed,
    ConfigInvalid,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "ConnectionFailed",
            ErrorKind::ProtocolTimeout => "ProtocolTimeout",
            ErrorKind::ProtocolRejected => "ProtocolRejected",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::FetchTimeout => "FetchTimeout",
            ErrorKind::FetchFailed => "FetchFailed",
            ErrorKind::DetectionFailed => "DetectionFailed",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Control-protocol errors, as opposed to retrieval or inference errors.
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::ProtocolTimeout
                | ErrorKind::ProtocolRejected
                | ErrorKind::ConnectionLost
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error scoped to a preset (or, for `ConfigInvalid`, to startup).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadcountError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HeadcountError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled before preset completed")
    }
}

impl std::fmt::Display for HeadcountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HeadcountError {}

// -------------------- Cancellation --------------------

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Run-level cancellation signal shared by the orchestrator and the workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns false when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_kind_and_message() {
        let err = HeadcountError::new(ErrorKind::FetchFailed, "HTTP 503");
        assert_eq!(err.to_string(), "FetchFailed: HTTP 503");
    }

    #[test]
    fn protocol_kinds_are_classified() {
        assert!(ErrorKind::ProtocolTimeout.is_protocol());
        assert!(ErrorKind::ConnectionLost.is_protocol());
        assert!(!ErrorKind::FetchTimeout.is_protocol());
        assert!(!ErrorKind::DetectionFailed.is_protocol());
    }

    #[test]
    fn preset_file_stem_replaces_spaces() {
        let preset = Preset::new(7, "Main Hall/East");
        assert_eq!(preset.file_stem(), "Main_Hall_East_7");
    }

    #[test]
    fn cancel_token_interrupts_sleep() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn cancel_token_completes_uncancelled_sleep() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
    }
}
