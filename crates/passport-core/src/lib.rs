//! passport-core — Passport photo composition engine.
//!
//! Background segmentation with U²-Net models via ONNX Runtime, AI framing
//! suggestions from a Gemini-compatible endpoint, and deterministic 3:4
//! composition with provenance-tracked parameters.

pub mod analysis;
pub mod compositor;
pub mod export;
pub mod params;
pub mod refine;
pub mod segmenter;
pub mod source;
pub mod types;

use std::path::PathBuf;

pub use analysis::{make_thumbnail, AnalysisError, Analyzer, GeminiClient};
pub use compositor::{compose, Framing};
pub use export::{export_png, ExportError};
pub use params::{Applied, ParamError, ParameterDefaults, ParameterStore, Stage};
pub use refine::MaskRefinement;
pub use segmenter::{
    EnsembleSegmenter, SegmentationError, Segmenter, U2NetSegmenter, UnavailableSegmenter,
};
pub use source::{load_source, SourceError};
pub use types::{
    AnalysisResult, Anchors, BorderColor, Color, CompositionWarning, Field, OutputCanvas,
    ParamValue, Parameters, Provenance, SegmentationMask, Tagged,
};

/// Default directory for the segmentation models
/// (`$XDG_DATA_HOME/passport/models`, falling back to `~/.local/share`).
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("passport")
        .join("models")
}
