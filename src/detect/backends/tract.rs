#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};

const PERSON_CLASS: usize = 0;
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// Tract-based backend for YOLOv8-style ONNX person detectors.
///
/// Expects one `[1, 4 + classes, anchors]` output with `cx, cy, w, h` rows
/// followed by per-class scores. Frames are letterboxed to the model input.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    overlap_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.25,
            overlap_threshold: 0.45,
        })
    }

    /// Override the default confidence and overlap thresholds.
    pub fn with_thresholds(mut self, confidence: f32, overlap: f32) -> Self {
        self.confidence_threshold = confidence;
        self.overlap_threshold = overlap;
        self
    }

    /// Resizes preserving aspect ratio and pads; returns the tensor and scale.
    fn build_input(&self, image: &RgbImage) -> Result<(Tensor, f32)> {
        let (w0, h0) = image.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("empty frame"));
        }
        let ratio = (self.width as f32 / w0 as f32).min(self.height as f32 / h0 as f32);
        let new_w = ((w0 as f32 * ratio).round() as u32).clamp(1, self.width);
        let new_h = ((h0 as f32 * ratio).round() as u32).clamp(1, self.height);
        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| {
                if (x as u32) < new_w && (y as u32) < new_h {
                    resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
                } else {
                    LETTERBOX_FILL
                }
            },
        );
        Ok((input.into_tensor(), ratio))
    }

    fn decode(&self, outputs: TVec<TValue>, ratio: f32, frame: (u32, u32)) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 + PERSON_CLASS {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let anchors = shape[2];
        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let score = preds[[0, 4 + PERSON_CLASS, anchor]];
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let cx = preds[[0, 0, anchor]] / ratio;
            let cy = preds[[0, 1, anchor]] / ratio;
            let w = preds[[0, 2, anchor]] / ratio;
            let h = preds[[0, 3, anchor]] / ratio;
            let bbox = BoundingBox::from_center(cx, cy, w, h).clamp_to(frame.0, frame.1);
            if bbox.area() <= 0.0 {
                continue;
            }
            detections.push(Detection::new(bbox, score));
        }
        non_max_suppression(&mut detections, self.overlap_threshold);
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (input, ratio) = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, ratio, image.dimensions())
    }
}
