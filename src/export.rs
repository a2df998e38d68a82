//! Writes a finished run to disk.
//!
//! Layout under the output directory:
//!
//! ```text
//! run_<run_id>/
//!   annotated_images/<Name>_<number>.jpg
//!   results/count_results.csv
//!   results/run_summary.json
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::aggregate::RunResult;

const JPEG_QUALITY: u8 = 70;

#[derive(Clone, Debug)]
pub struct ExportSummary {
    pub run_dir: PathBuf,
    pub images: Vec<PathBuf>,
    pub csv_path: PathBuf,
    pub summary_path: PathBuf,
    pub total_count: u64,
}

pub fn export_run(run: &RunResult, output_dir: &Path) -> Result<ExportSummary> {
    let run_dir = output_dir.join(format!("run_{}", run.run_id));
    let images_dir = run_dir.join("annotated_images");
    let results_dir = run_dir.join("results");
    fs::create_dir_all(&images_dir)
        .with_context(|| format!("create {}", images_dir.display()))?;
    fs::create_dir_all(&results_dir)
        .with_context(|| format!("create {}", results_dir.display()))?;

    let mut images = Vec::new();
    for result in &run.results {
        if let Some(image) = result.annotated_image.as_ref() {
            let path = images_dir.join(format!("{}.jpg", result.preset.file_stem()));
            write_jpeg(image, &path)?;
            images.push(path);
        }
    }

    let csv_path = results_dir.join("count_results.csv");
    write_csv(run, &csv_path)?;

    let summary_path = results_dir.join("run_summary.json");
    let file = File::create(&summary_path)
        .with_context(|| format!("create {}", summary_path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &run.summary())
        .with_context(|| format!("write {}", summary_path.display()))?;

    log::info!(
        "exported run {} to {} ({} images, total count {})",
        run.run_id,
        run_dir.display(),
        images.len(),
        run.total_count()
    );
    Ok(ExportSummary {
        run_dir,
        images,
        csv_path,
        summary_path,
        total_count: run.total_count(),
    })
}

fn write_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .with_context(|| format!("encode {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn write_csv(run: &RunResult, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "Preset,Name,Count,Error")?;
    for result in &run.results {
        let error = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        writeln!(
            out,
            "{},{},{},{}",
            result.preset.number,
            csv_field(&result.preset.name),
            result.count,
            csv_field(&error)
        )?;
    }
    out.flush()
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_fields_that_need_it() {
        assert_eq!(csv_field("Entrance"), "Entrance");
        assert_eq!(csv_field("Hall, East"), "\"Hall, East\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
