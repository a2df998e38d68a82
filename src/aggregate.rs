//! Preset-ordered run result.
//!
//! Outcomes arrive in completion order from the detection pool and from the
//! capture loop (for presets that never produced a frame). The aggregator slots
//! each one by preset number; the first report for a preset wins.

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::Serialize;

use crate::pipeline::PresetOutcome;
use crate::{ErrorKind, HeadcountError, Preset};

/// Final outcome for one configured preset.
#[derive(Clone, Debug)]
pub struct PresetResult {
    pub preset: Preset,
    pub count: u32,
    pub detections: usize,
    pub annotated_image: Option<RgbImage>,
    pub error: Option<HeadcountError>,
}

impl PresetResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(preset: Preset, error: HeadcountError) -> Self {
        Self {
            preset,
            count: 0,
            detections: 0,
            annotated_image: None,
            error: Some(error),
        }
    }
}

impl From<PresetOutcome> for PresetResult {
    fn from(outcome: PresetOutcome) -> Self {
        match outcome.error {
            Some(error) => Self::failed(outcome.preset, error),
            None => Self {
                preset: outcome.preset,
                count: outcome.count,
                detections: outcome.detections,
                annotated_image: outcome.annotated,
                error: None,
            },
        }
    }
}

/// One run over every configured preset, in configured order.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub results: Vec<PresetResult>,
}

impl RunResult {
    /// Run identifier derived from the start time.
    pub fn run_id_for(started_at: &DateTime<Local>) -> String {
        started_at.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Sum of counts over presets without an error.
    pub fn total_count(&self) -> u64 {
        self.results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| r.count as u64)
            .sum()
    }

    pub fn failures(&self) -> Vec<&PresetResult> {
        self.results.iter().filter(|r| !r.is_ok()).collect()
    }

    pub fn get(&self, number: u16) -> Option<&PresetResult> {
        self.results.iter().find(|r| r.preset.number == number)
    }

    /// Serializable view without image buffers.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            total_count: self.total_count(),
            failed_presets: self.failures().len(),
            results: self
                .results
                .iter()
                .map(|r| PresetSummary {
                    number: r.preset.number,
                    name: r.preset.name.clone(),
                    count: r.count,
                    detections: r.detections,
                    error_kind: r.error.as_ref().map(|e| e.kind),
                    error: r.error.as_ref().map(|e| e.message.clone()),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_count: u64,
    pub failed_presets: usize,
    pub results: Vec<PresetSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PresetSummary {
    pub number: u16,
    pub name: String,
    pub count: u32,
    pub detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Aggregator {
    run_id: String,
    started_at: DateTime<Local>,
    presets: Vec<Preset>,
    slots: Vec<Option<PresetResult>>,
}

impl Aggregator {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Local>, presets: Vec<Preset>) -> Self {
        let slots = presets.iter().map(|_| None).collect();
        Self {
            run_id: run_id.into(),
            started_at,
            presets,
            slots,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record_outcome(&mut self, outcome: PresetOutcome) {
        let number = outcome.preset.number;
        self.record(number, PresetResult::from(outcome));
    }

    /// Records a capture-stage failure (no frame was produced).
    pub fn record_failure(&mut self, preset: &Preset, error: HeadcountError) {
        log::warn!(
            "preset {} ({}) failed: {}",
            preset.number,
            preset.name,
            error
        );
        self.record(preset.number, PresetResult::failed(preset.clone(), error));
    }

    fn record(&mut self, number: u16, mut result: PresetResult) {
        let Some(index) = self.presets.iter().position(|p| p.number == number) else {
            log::warn!("ignoring outcome for unconfigured preset {}", number);
            return;
        };
        if self.slots[index].is_some() {
            log::warn!("ignoring duplicate outcome for preset {}", number);
            return;
        }
        result.preset = self.presets[index].clone();
        self.slots[index] = Some(result);
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Presets that have not reported yet, in configured order.
    pub fn pending(&self) -> Vec<&Preset> {
        self.presets
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(preset, _)| preset)
            .collect()
    }

    pub fn finish(self, finished_at: DateTime<Local>) -> RunResult {
        let results = self
            .presets
            .into_iter()
            .zip(self.slots)
            .map(|(preset, slot)| {
                slot.unwrap_or_else(|| {
                    log::error!("preset {} produced no outcome before the drain deadline", preset.number);
                    PresetResult::failed(
                        preset,
                        HeadcountError::new(
                            ErrorKind::DetectionFailed,
                            "no outcome before drain deadline",
                        ),
                    )
                })
            })
            .collect();
        RunResult {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presets() -> Vec<Preset> {
        vec![
            Preset::new(3, "Stage"),
            Preset::new(1, "Entrance"),
            Preset::new(2, "Hallway"),
        ]
    }

    fn ok(number: u16, count: u32) -> PresetOutcome {
        PresetOutcome {
            preset: Preset::new(number, Preset::default_name(number)),
            count,
            detections: count as usize,
            annotated: Some(RgbImage::new(2, 2)),
            error: None,
        }
    }

    #[test]
    fn restores_configured_order() {
        let mut agg = Aggregator::new("20260101_120000", Local::now(), presets());
        agg.record_outcome(ok(2, 4));
        agg.record_outcome(ok(3, 1));
        assert!(!agg.is_complete());
        assert_eq!(agg.pending(), vec![&Preset::new(1, "Entrance")]);
        agg.record_failure(
            &Preset::new(1, "Entrance"),
            HeadcountError::new(ErrorKind::FetchTimeout, "no response"),
        );
        assert!(agg.is_complete());

        let run = agg.finish(Local::now());
        let numbers: Vec<u16> = run.results.iter().map(|r| r.preset.number).collect();
        assert_eq!(numbers, vec![3, 1, 2]);
        assert_eq!(run.results[0].preset.name, "Stage");
        assert_eq!(run.total_count(), 5);
        assert_eq!(run.failures().len(), 1);
        assert_eq!(run.results[1].count, 0);
        assert!(run.results[1].annotated_image.is_none());
    }

    #[test]
    fn first_report_wins_and_unknown_is_ignored() {
        let mut agg = Aggregator::new("r", Local::now(), presets());
        agg.record_outcome(ok(1, 2));
        agg.record_outcome(ok(1, 9));
        agg.record_outcome(ok(42, 1));
        let run = agg.finish(Local::now());
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.get(1).unwrap().count, 2);
        assert!(run.get(42).is_none());
    }

    #[test]
    fn finish_fills_missing_presets() {
        let agg = Aggregator::new("r", Local::now(), presets());
        let run = agg.finish(Local::now());
        assert_eq!(run.results.len(), 3);
        for result in &run.results {
            assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::DetectionFailed);
            assert_eq!(result.count, 0);
        }
        assert_eq!(run.total_count(), 0);
    }

    #[test]
    fn failed_outcome_drops_image_and_count() {
        let mut outcome = ok(2, 3);
        outcome.error = Some(HeadcountError::new(ErrorKind::DetectionFailed, "bad"));
        let result = PresetResult::from(outcome);
        assert_eq!(result.count, 0);
        assert!(result.annotated_image.is_none());
    }

    #[test]
    fn summary_serializes_without_images() {
        let mut agg = Aggregator::new("20260101_120000", Local::now(), presets());
        agg.record_outcome(ok(3, 2));
        let run = agg.finish(Local::now());
        let json = serde_json::to_value(run.summary()).unwrap();
        assert_eq!(json["run_id"], "20260101_120000");
        assert_eq!(json["total_count"], 2);
        assert_eq!(json["results"][0]["count"], 2);
        assert!(json["results"][0].get("error").is_none());
        assert_eq!(json["results"][1]["error_kind"], "DetectionFailed");
    }

    #[test]
    fn run_id_format() {
        let ts = chrono::TimeZone::with_ymd_and_hms(&Local, 2026, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(RunResult::run_id_for(&ts), "20260309_070501");
    }
}
