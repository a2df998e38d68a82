//! Bounded worker pool for detection and clustering.
//!
//! Frames go in over a bounded queue, so `submit` blocks the capture loop once
//! every worker is busy and the queue is full. Outcomes come back keyed by
//! preset number over an unbounded channel, in completion order.
//!
//! Each worker owns its own detector backend. A backend error or panic only
//! fails the frame being processed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};
use image::RgbImage;

pub use crossbeam_channel::RecvTimeoutError;

use crate::annotate::annotate;
use crate::cluster::{cluster_detections, ClusterParams};
use crate::detect::{DetectorBackend, DetectorFactory};
use crate::frame::CapturedFrame;
use crate::{CancelToken, ErrorKind, HeadcountError, Preset};

const SUBMIT_POLL: Duration = Duration::from_millis(100);

/// Result of processing one frame.
#[derive(Debug)]
pub struct PresetOutcome {
    pub preset: Preset,
    pub count: u32,
    pub detections: usize,
    pub annotated: Option<RgbImage>,
    pub error: Option<HeadcountError>,
}

impl PresetOutcome {
    pub fn failed(preset: Preset, error: HeadcountError) -> Self {
        Self {
            preset,
            count: 0,
            detections: 0,
            annotated: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Dispatcher {
    jobs: Option<Sender<CapturedFrame>>,
    outcomes: Receiver<PresetOutcome>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    submitted: usize,
}

impl Dispatcher {
    /// Spawns `workers` threads sharing a queue of `queue_depth` frames.
    pub fn start(
        workers: usize,
        queue_depth: usize,
        factory: Arc<dyn DetectorFactory>,
        clustering: ClusterParams,
        cancel: CancelToken,
    ) -> Result<Self> {
        let available = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let requested = workers.max(1);
        let workers = requested.min(available);
        if workers < requested {
            log::info!(
                "limiting detection pool to {} workers ({} requested, {} cpus)",
                workers,
                requested,
                available
            );
        }
        let (job_tx, job_rx) = bounded::<CapturedFrame>(queue_depth.max(1));
        let (outcome_tx, outcome_rx) = unbounded::<PresetOutcome>();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let jobs = job_rx.clone();
            let outcomes = outcome_tx.clone();
            let factory = Arc::clone(&factory);
            let handle = thread::Builder::new()
                .name(format!("headcount-worker-{}", index))
                .spawn(move || run_worker(index, jobs, outcomes, factory, clustering))
                .with_context(|| format!("spawn detection worker {}", index))?;
            handles.push(handle);
        }
        log::info!(
            "detection pool started: {} workers, queue depth {}",
            workers,
            queue_depth.max(1)
        );

        Ok(Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            workers: handles,
            cancel,
            submitted: 0,
        })
    }

    /// Number of worker threads actually spawned.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queues a frame, blocking while the queue is full.
    ///
    /// Once the run is cancelled the frame is dropped and `Cancelled` returned.
    pub fn submit(&mut self, frame: CapturedFrame) -> Result<(), HeadcountError> {
        let jobs = self.jobs.as_ref().ok_or_else(|| {
            HeadcountError::new(ErrorKind::DetectionFailed, "detection pool is closed")
        })?;
        let mut frame = frame;
        loop {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "dropping frame for preset {}: run cancelled",
                    frame.preset().number
                );
                return Err(HeadcountError::cancelled());
            }
            match jobs.send_timeout(frame, SUBMIT_POLL) {
                Ok(()) => {
                    self.submitted += 1;
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => frame = back,
                Err(SendTimeoutError::Disconnected(back)) => {
                    return Err(HeadcountError::new(
                        ErrorKind::DetectionFailed,
                        format!(
                            "no detection worker available for preset {}",
                            back.preset().number
                        ),
                    ));
                }
            }
        }
    }

    /// Frames accepted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Outcomes that are already available, without waiting.
    pub fn try_outcomes(&self) -> Vec<PresetOutcome> {
        self.outcomes.try_iter().collect()
    }

    /// Waits up to `timeout` for the next outcome. `Disconnected` means every
    /// worker has exited and nothing is left to read.
    pub fn recv_outcome_timeout(&self, timeout: Duration) -> Result<PresetOutcome, RecvTimeoutError> {
        self.outcomes.recv_timeout(timeout)
    }

    /// Stops accepting frames; workers finish what is queued and exit.
    pub fn close(&mut self) {
        if self.jobs.take().is_some() {
            log::debug!("detection pool closed after {} frames", self.submitted);
        }
    }

    /// Closes the pool and waits for every worker to exit.
    pub fn join(mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{} exited abnormally", name);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Unjoined workers are detached; they exit once the queue drains.
        self.close();
    }
}

fn run_worker(
    index: usize,
    jobs: Receiver<CapturedFrame>,
    outcomes: Sender<PresetOutcome>,
    factory: Arc<dyn DetectorFactory>,
    clustering: ClusterParams,
) {
    let mut backend = match build_backend(factory.as_ref()) {
        Ok(backend) => {
            log::debug!("worker {} using backend {}", index, backend.name());
            Ok(backend)
        }
        Err(err) => {
            log::error!("worker {}: detector unavailable: {:#}", index, err);
            Err(format!("detector unavailable: {:#}", err))
        }
    };

    for frame in jobs.iter() {
        let outcome = match backend.as_mut() {
            Ok(backend) => process_frame(&mut **backend, frame, &clustering),
            Err(message) => {
                let (preset, _, _) = frame.into_parts();
                PresetOutcome::failed(
                    preset,
                    HeadcountError::new(ErrorKind::DetectionFailed, message.clone()),
                )
            }
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    log::debug!("worker {} exiting", index);
}

fn build_backend(factory: &dyn DetectorFactory) -> Result<Box<dyn DetectorBackend>> {
    let mut backend = factory.create()?;
    backend.warm_up().context("detector warm-up")?;
    Ok(backend)
}

fn process_frame(
    backend: &mut dyn DetectorBackend,
    frame: CapturedFrame,
    clustering: &ClusterParams,
) -> PresetOutcome {
    let (preset, image, _) = frame.into_parts();
    let detected = panic::catch_unwind(AssertUnwindSafe(|| backend.detect(&image)));
    let detections = match detected {
        Ok(Ok(detections)) => detections,
        Ok(Err(err)) => {
            log::warn!("detection failed for preset {}: {:#}", preset.number, err);
            return PresetOutcome::failed(
                preset,
                HeadcountError::new(ErrorKind::DetectionFailed, format!("{:#}", err)),
            );
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("detector panicked on preset {}: {}", preset.number, reason);
            return PresetOutcome::failed(
                preset,
                HeadcountError::new(
                    ErrorKind::DetectionFailed,
                    format!("detector panicked: {}", reason),
                ),
            );
        }
    };

    let assignment = cluster_detections(&detections, clustering);
    let count = assignment.count();
    log::info!(
        "preset {} ({}): {} detections, {} people",
        preset.number,
        preset.name,
        detections.len(),
        count
    );
    let annotated = annotate(&image, &detections, count);
    PresetOutcome {
        preset,
        count: count as u32,
        detections: detections.len(),
        annotated: Some(annotated),
        error: None,
    }
}
