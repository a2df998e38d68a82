//! Frame ingestion.
//!
//! The camera's control channel only moves it; stills come from a separate
//! HTTP image endpoint. Sources produce `CapturedFrame`s tagged with the preset
//! they were taken at.
//!
//! The ingestion layer MUST NOT:
//! - Touch the control session
//! - Write frames to disk (exporting is a separate, post-run step)

pub mod snapshot;

pub use snapshot::{SnapshotConfig, SnapshotFetcher};
