use image::RgbImage;
use passport_core::{make_thumbnail, AnalysisResult, SegmentationMask};
use std::sync::Arc;
use uuid::Uuid;

/// Segmentation outcome for the active job.
#[derive(Debug, Clone)]
pub enum MaskState {
    Pending,
    Ready(Arc<SegmentationMask>),
    /// Model missing or inference failed; compose without a mask.
    Unavailable,
}

impl MaskState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, MaskState::Pending)
    }

    pub fn mask(&self) -> Option<Arc<SegmentationMask>> {
        match self {
            MaskState::Ready(mask) => Some(Arc::clone(mask)),
            _ => None,
        }
    }
}

/// One working session on one source image.
#[derive(Debug, Clone)]
pub struct PhotoJob {
    pub id: Uuid,
    pub generation: u64,
    /// Full-resolution source, orientation already applied. Never mutated.
    pub source: Arc<RgbImage>,
    pub thumbnail: Arc<RgbImage>,
    pub mask: MaskState,
    /// Latest accepted suggestion; replaced, never edited.
    pub analysis: Option<AnalysisResult>,
}

impl PhotoJob {
    pub fn new(generation: u64, source: RgbImage, thumbnail_max_side: u32) -> Self {
        let thumbnail = make_thumbnail(&source, thumbnail_max_side);
        Self {
            id: Uuid::new_v4(),
            generation,
            source: Arc::new(source),
            thumbnail: Arc::new(thumbnail),
            mask: MaskState::Pending,
            analysis: None,
        }
    }

    pub fn source_size(&self) -> (u32, u32) {
        self.source.dimensions()
    }

    pub fn thumbnail_size(&self) -> (u32, u32) {
        self.thumbnail.dimensions()
    }
}
