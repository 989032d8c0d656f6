//! Subject/background segmentation via U²-Net-family ONNX models.
//!
//! A single [`U2NetSegmenter`] produces a saliency mask. [`EnsembleSegmenter`]
//! combines several: the intersection of the consensus models (portrait and
//! general), then the union with an optional recovery model that brings back
//! clothing and hair edges.

use crate::refine::MaskRefinement;
use crate::types::SegmentationMask;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const U2NET_INPUT_SIZE: u32 = 320;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Floor for the min-max range so a flat saliency map does not divide by zero.
const SALIENCY_RANGE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug, Clone)]
pub enum SegmentationError {
    #[error("segmentation model not found: {0}; install the background-removal models")]
    ModelMissing(String),
    #[error("segmentation inference failed: {0}")]
    InferenceFailure(String),
}

impl From<ort::Error> for SegmentationError {
    fn from(e: ort::Error) -> Self {
        SegmentationError::InferenceFailure(e.to_string())
    }
}

/// Produces a full-resolution alpha mask for an image.
pub trait Segmenter: Send {
    fn segment(&mut self, image: &RgbImage) -> Result<SegmentationMask, SegmentationError>;
}

/// U²-Net saliency model.
pub struct U2NetSegmenter {
    session: Session,
    name: String,
}

impl U2NetSegmenter {
    /// Load a U²-Net-family ONNX model. Fails with `ModelMissing` if absent.
    pub fn load(model_path: &Path) -> Result<Self, SegmentationError> {
        if !model_path.exists() {
            return Err(SegmentationError::ModelMissing(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.display().to_string());

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            outputs = session.outputs().len(),
            "loaded segmentation model"
        );

        Ok(Self { session, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Segmenter for U2NetSegmenter {
    fn segment(&mut self, image: &RgbImage) -> Result<SegmentationMask, SegmentationError> {
        let input = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, saliency) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            SegmentationError::InferenceFailure(format!("{}: saliency output: {e}", self.name))
        })?;

        let plane = (U2NET_INPUT_SIZE * U2NET_INPUT_SIZE) as usize;
        if saliency.len() < plane {
            return Err(SegmentationError::InferenceFailure(format!(
                "{}: unexpected output shape {shape:?}",
                self.name
            )));
        }

        let mask = saliency_to_mask(
            &saliency[..plane],
            U2NET_INPUT_SIZE,
            U2NET_INPUT_SIZE,
            image.width(),
            image.height(),
        );
        tracing::debug!(model = %self.name, coverage = mask.coverage(), "segmentation complete");
        Ok(mask)
    }
}

/// Resize to the model input and normalize into an NCHW tensor.
///
/// Pixels are divided by the image's maximum value, then standardized with
/// the ImageNet mean and std.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let size = U2NET_INPUT_SIZE;
    let resized = imageops::resize(image, size, size, FilterType::Lanczos3);
    let max = resized.as_raw().iter().copied().max().unwrap_or(0).max(1) as f32;

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (px[c] as f32 / max - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

/// Min-max normalize a saliency map and resize it (bilinear) to the source size.
pub fn saliency_to_mask(
    saliency: &[f32],
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
) -> SegmentationMask {
    let (lo, hi) = saliency
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = (hi - lo).max(SALIENCY_RANGE_EPSILON);

    let small = GrayImage::from_fn(width, height, |x, y| {
        let v = saliency[(y * width + x) as usize];
        Luma([((v - lo) / range * 255.0).round().clamp(0.0, 255.0) as u8])
    });

    SegmentationMask::new(imageops::resize(
        &small,
        target_width,
        target_height,
        FilterType::Triangle,
    ))
}

/// Pixel-wise minimum across `consensus`, then pixel-wise maximum with `recovery`.
pub fn combine_masks(
    consensus: &[SegmentationMask],
    recovery: Option<&SegmentationMask>,
) -> Result<SegmentationMask, SegmentationError> {
    let (first, rest) = consensus.split_first().ok_or_else(|| {
        SegmentationError::InferenceFailure("no consensus masks to combine".into())
    })?;

    let mut combined = first.alpha().clone();
    for mask in rest.iter().chain(recovery) {
        if mask.alpha().dimensions() != combined.dimensions() {
            return Err(SegmentationError::InferenceFailure(format!(
                "mask size {:?} does not match {:?}",
                mask.alpha().dimensions(),
                combined.dimensions()
            )));
        }
    }

    for mask in rest {
        for (acc, px) in combined.pixels_mut().zip(mask.alpha().pixels()) {
            acc.0[0] = acc.0[0].min(px.0[0]);
        }
    }
    if let Some(mask) = recovery {
        for (acc, px) in combined.pixels_mut().zip(mask.alpha().pixels()) {
            acc.0[0] = acc.0[0].max(px.0[0]);
        }
    }
    Ok(SegmentationMask::new(combined))
}

/// Multi-model segmentation: (consensus ∩) ∪ recovery, then optional refinement.
pub struct EnsembleSegmenter {
    consensus: Vec<Box<dyn Segmenter>>,
    recovery: Option<Box<dyn Segmenter>>,
    refinement: Option<MaskRefinement>,
}

impl EnsembleSegmenter {
    pub fn new(
        consensus: Vec<Box<dyn Segmenter>>,
        recovery: Option<Box<dyn Segmenter>>,
    ) -> Result<Self, SegmentationError> {
        if consensus.is_empty() {
            return Err(SegmentationError::ModelMissing(
                "no consensus segmentation model".into(),
            ));
        }
        Ok(Self {
            consensus,
            recovery,
            refinement: None,
        })
    }

    /// Clean up and matte the combined mask before returning it.
    pub fn with_refinement(mut self, refinement: MaskRefinement) -> Self {
        self.refinement = Some(refinement);
        self
    }

    /// Load the named models from `model_dir`, skipping any that are missing.
    ///
    /// Fails with `ModelMissing` only when no consensus model could be loaded.
    pub fn load(
        model_dir: &Path,
        consensus: &[String],
        recovery: Option<&str>,
    ) -> Result<Self, SegmentationError> {
        let mut loaded: Vec<Box<dyn Segmenter>> = Vec::new();
        let mut missing = Vec::new();
        for file in consensus {
            let path = model_dir.join(file);
            match U2NetSegmenter::load(&path) {
                Ok(model) => loaded.push(Box::new(model)),
                Err(SegmentationError::ModelMissing(p)) => {
                    tracing::warn!(path = %p, "consensus model missing, skipping");
                    missing.push(p);
                }
                Err(e) => return Err(e),
            }
        }
        if loaded.is_empty() {
            return Err(SegmentationError::ModelMissing(if missing.is_empty() {
                model_dir.display().to_string()
            } else {
                missing.join(", ")
            }));
        }

        let recovery: Option<Box<dyn Segmenter>> = match recovery {
            Some(file) => match U2NetSegmenter::load(&model_dir.join(file)) {
                Ok(model) => Some(Box::new(model)),
                Err(e) => {
                    tracing::warn!(error = %e, "recovery model unavailable, continuing without it");
                    None
                }
            },
            None => None,
        };

        tracing::info!(
            consensus = loaded.len(),
            recovery = recovery.is_some(),
            "segmentation ensemble ready"
        );
        Ok(Self::new(loaded, recovery)?.with_refinement(MaskRefinement::default()))
    }
}

impl Segmenter for EnsembleSegmenter {
    fn segment(&mut self, image: &RgbImage) -> Result<SegmentationMask, SegmentationError> {
        let masks = self
            .consensus
            .iter_mut()
            .map(|model| model.segment(image))
            .collect::<Result<Vec<_>, _>>()?;

        let recovered = match self.recovery.as_mut() {
            Some(model) => match model.segment(image) {
                Ok(mask) => Some(mask),
                Err(e) => {
                    tracing::warn!(error = %e, "recovery model failed; using consensus mask only");
                    None
                }
            },
            None => None,
        };

        let combined = combine_masks(&masks, recovered.as_ref())?;
        Ok(match &self.refinement {
            Some(refinement) => refinement.refine(&combined),
            None => combined,
        })
    }
}

/// Stand-in used when no model could be loaded. Every call reports the
/// original load failure so the pipeline degrades to an unmasked composite.
pub struct UnavailableSegmenter {
    reason: SegmentationError,
}

impl UnavailableSegmenter {
    pub fn new(reason: SegmentationError) -> Self {
        Self { reason }
    }
}

impl Segmenter for UnavailableSegmenter {
    fn segment(&mut self, _: &RgbImage) -> Result<SegmentationMask, SegmentationError> {
        Err(self.reason.clone())
    }
}
