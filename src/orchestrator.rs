//! Sequential preset tour and the run driver.
//!
//! The camera is one physical resource, so visits never overlap: recall,
//! settle, fetch, then hand the frame to the detection pool and move on.
//! Every failure is recorded against the preset it happened on and the tour
//! continues with the next preset.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::aggregate::{Aggregator, RunResult};
use crate::config::HeadcountConfig;
use crate::control::{ControlSession, RecallOutcome};
use crate::detect::{BackendRegistry, DetectorFactory};
use crate::frame::CapturedFrame;
use crate::ingest::SnapshotFetcher;
use crate::pipeline::{Dispatcher, RecvTimeoutError};
use crate::{CancelToken, ErrorKind, HeadcountError, Preset};

/// Timing of one preset visit.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    /// Wait after a recall before fetching, for motion and exposure to settle.
    pub settle: Duration,
    /// Total recall attempts when the camera does not answer in time.
    pub recall_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub recall_backoff: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            recall_attempts: 2,
            recall_backoff: Duration::from_secs(1),
        }
    }
}

pub struct CaptureOrchestrator {
    session: ControlSession,
    fetcher: SnapshotFetcher,
    settings: CaptureSettings,
    cancel: CancelToken,
}

impl CaptureOrchestrator {
    pub fn new(
        session: ControlSession,
        fetcher: SnapshotFetcher,
        settings: CaptureSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            session,
            fetcher,
            settings,
            cancel,
        }
    }

    pub fn session(&self) -> &ControlSession {
        &self.session
    }

    /// Visits every preset in order, submitting frames and recording failures.
    pub fn run(&mut self, presets: &[Preset], dispatcher: &mut Dispatcher, aggregator: &mut Aggregator) {
        for (index, preset) in presets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "run cancelled; skipping {} remaining presets",
                    presets.len() - index
                );
                for skipped in &presets[index..] {
                    aggregator.record_failure(skipped, HeadcountError::cancelled());
                }
                break;
            }

            log::info!(
                "visiting preset {} ({}) [{}/{}]",
                preset.number,
                preset.name,
                index + 1,
                presets.len()
            );
            match self.visit(preset) {
                Ok(frame) => {
                    if let Err(err) = dispatcher.submit(frame) {
                        aggregator.record_failure(preset, err);
                    }
                }
                Err(err) => aggregator.record_failure(preset, err),
            }

            for outcome in dispatcher.try_outcomes() {
                aggregator.record_outcome(outcome);
            }
        }
    }

    /// Recall, settle and fetch one preset.
    pub fn visit(&mut self, preset: &Preset) -> Result<CapturedFrame, HeadcountError> {
        if !self.session.is_connected() {
            self.session.connect()?;
        }
        match self.recall(preset.number)? {
            RecallOutcome::Completed => log::debug!("preset {} recall completed", preset.number),
            RecallOutcome::Acknowledged => {
                log::debug!("preset {} recall acknowledged only", preset.number)
            }
        }
        if !self.cancel.sleep(self.settings.settle) {
            return Err(HeadcountError::cancelled());
        }
        self.fetcher.fetch(preset, &self.cancel)
    }

    /// Recall with in-place retries on timeout and one reconnect on a lost connection.
    fn recall(&mut self, number: u16) -> Result<RecallOutcome, HeadcountError> {
        let attempts = self.settings.recall_attempts.max(1);
        let mut attempt = 1;
        let mut reconnected = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(HeadcountError::cancelled());
            }
            let err = match self.session.recall_preset(number) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            match err.kind {
                ErrorKind::ProtocolTimeout if attempt < attempts => {
                    let delay = self
                        .settings
                        .recall_backoff
                        .saturating_mul(1u32 << (attempt - 1).min(16));
                    log::warn!(
                        "recall of preset {} timed out (attempt {}/{}); retrying in {:?}",
                        number,
                        attempt,
                        attempts,
                        delay
                    );
                    if !self.cancel.sleep(delay) {
                        return Err(HeadcountError::cancelled());
                    }
                    attempt += 1;
                }
                ErrorKind::ConnectionLost if !reconnected => {
                    reconnected = true;
                    log::warn!("reconnecting to {} after: {}", self.session.endpoint(), err.message);
                    if let Err(reconnect) = self.session.connect() {
                        return Err(HeadcountError::new(
                            ErrorKind::ConnectionLost,
                            format!("{}; reconnect failed: {}", err.message, reconnect.message),
                        ));
                    }
                }
                _ => return Err(err),
            }
        }
    }

    /// Closes the control connection.
    pub fn shutdown(&mut self) {
        self.session.disconnect();
    }
}

/// One complete run: tour, detection and aggregation.
pub struct HeadcountRun {
    config: HeadcountConfig,
    factory: Arc<dyn DetectorFactory>,
    cancel: CancelToken,
}

impl HeadcountRun {
    pub fn new(config: HeadcountConfig, factory: Arc<dyn DetectorFactory>, cancel: CancelToken) -> Self {
        Self {
            config,
            factory,
            cancel,
        }
    }

    /// Resolves the configured detector backend from `registry`.
    pub fn from_registry(
        config: HeadcountConfig,
        registry: &BackendRegistry,
        cancel: CancelToken,
    ) -> Result<Self, HeadcountError> {
        config.validate()?;
        let factory = registry
            .factory(&config.detector)
            .map_err(|e| HeadcountError::config(format!("{:#}", e)))?;
        Ok(Self::new(config, factory, cancel))
    }

    pub fn config(&self) -> &HeadcountConfig {
        &self.config
    }

    /// Runs the tour. Only `ConfigInvalid` is returned as an error; every
    /// other failure is recorded on its preset.
    pub fn execute(&self) -> Result<RunResult, HeadcountError> {
        self.config.validate()?;
        let presets = self.config.presets.clone();
        let started_at = Local::now();
        let mut aggregator = Aggregator::new(RunResult::run_id_for(&started_at), started_at, presets.clone());
        log::info!("run {} starting: {} presets", aggregator.run_id(), presets.len());

        let fetcher = SnapshotFetcher::new(self.config.snapshot.clone())
            .map_err(|e| HeadcountError::config(format!("snapshot source: {:#}", e)))?;

        let mut dispatcher = match Dispatcher::start(
            self.config.workers,
            self.config.queue_depth,
            Arc::clone(&self.factory),
            self.config.clustering,
            self.cancel.clone(),
        ) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                log::error!("detection pool unavailable: {:#}", err);
                for preset in &presets {
                    aggregator.record_failure(
                        preset,
                        HeadcountError::new(
                            ErrorKind::DetectionFailed,
                            format!("detection pool unavailable: {:#}", err),
                        ),
                    );
                }
                return Ok(aggregator.finish(Local::now()));
            }
        };

        let mut orchestrator = CaptureOrchestrator::new(
            ControlSession::new(self.config.control.clone()),
            fetcher,
            self.config.capture.clone(),
            self.cancel.clone(),
        );
        orchestrator.run(&presets, &mut dispatcher, &mut aggregator);
        orchestrator.shutdown();

        dispatcher.close();
        drain(&dispatcher, &mut aggregator, self.config.drain_timeout);
        if aggregator.is_complete() {
            dispatcher.join();
        } else {
            log::warn!(
                "{} presets still in detection after {:?}; detaching workers",
                aggregator.pending().len(),
                self.config.drain_timeout
            );
            drop(dispatcher);
        }

        let result = aggregator.finish(Local::now());
        log::info!(
            "run {} finished: total count {}, {} of {} presets failed",
            result.run_id,
            result.total_count(),
            result.failures().len(),
            result.results.len()
        );
        Ok(result)
    }
}

fn drain(dispatcher: &Dispatcher, aggregator: &mut Aggregator, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !aggregator.is_complete() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match dispatcher.recv_outcome_timeout(deadline - now) {
            Ok(outcome) => aggregator.record_outcome(outcome),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
