//! Parameter store with provenance and per-stage staleness.

use crate::compositor::Framing;
use crate::types::{
    Anchors, BorderColor, Color, Field, ParamValue, Parameters, Provenance, Tagged,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default border width in output pixels.
pub const DEFAULT_BORDER_WIDTH_PX: u32 = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("crop_top_y ({top}) must be above crop_bottom_y ({bottom})")]
    InvalidCrop { top: f32, bottom: f32 },
    #[error("{field} = {value} is outside 0..={limit}")]
    OutOfBounds { field: Field, value: f32, limit: f32 },
}

/// Pipeline stages whose inputs the store tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Segmentation,
    Composition,
}

impl Stage {
    fn index(self) -> usize {
        match self {
            Stage::Analysis => 0,
            Stage::Segmentation => 1,
            Stage::Composition => 2,
        }
    }

    fn depends_on_params(self) -> bool {
        matches!(self, Stage::Composition)
    }
}

/// Outcome of a provenance-gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Value stored; the parameter revision advanced.
    Written,
    /// Same value and provenance as before; nothing changed.
    Unchanged,
    /// The field holds a higher-ranked provenance and was left alone.
    Ignored { current: Provenance },
}

/// Configurable defaults for the non-geometric fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefaults {
    pub background_color: Color,
    pub border_width_px: u32,
    pub border_color: BorderColor,
}

impl Default for ParameterDefaults {
    fn default() -> Self {
        Self {
            background_color: Color::WHITE,
            border_width_px: DEFAULT_BORDER_WIDTH_PX,
            border_color: BorderColor::Black,
        }
    }
}

/// Default parameters for a `width × height` source: the largest centered
/// 3:4 crop, all fields tagged [`Provenance::Default`].
pub fn defaults_for(
    width: u32,
    height: u32,
    framing: &Framing,
    defaults: &ParameterDefaults,
) -> Parameters {
    let anchors = framing.default_anchors(width, height);
    Parameters {
        background_color: Tagged::default_value(defaults.background_color),
        crop_top_y: Tagged::default_value(anchors.head_top_y),
        crop_bottom_y: Tagged::default_value(anchors.chest_y),
        crop_center_x: Tagged::default_value(anchors.center_x),
        border_width_px: Tagged::default_value(defaults.border_width_px),
        border_color: Tagged::default_value(defaults.border_color),
    }
}

/// Source revision and parameter revision a stage last consumed.
type Consumed = Option<(u64, u64)>;

/// Current parameters for one job.
///
/// A new store is created per source image, so a new image invalidates every
/// stage. Parameter writes advance `revision`, which only Composition
/// depends on.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    params: Parameters,
    defaults: Parameters,
    image_size: (u32, u32),
    source_revision: u64,
    revision: u64,
    consumed: [Consumed; 3],
}

impl ParameterStore {
    pub fn new(width: u32, height: u32, framing: &Framing, defaults: &ParameterDefaults) -> Self {
        let params = defaults_for(width, height, framing, defaults);
        Self {
            params,
            defaults: params,
            image_size: (width, height),
            source_revision: 1,
            revision: 0,
            consumed: [None; 3],
        }
    }

    pub fn get(&self) -> &Parameters {
        &self.params
    }

    pub fn defaults(&self) -> &Parameters {
        &self.defaults
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    /// Parameter revision; bumped on every effective write.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn source_revision(&self) -> u64 {
        self.source_revision
    }

    /// Write one field if `provenance` ranks at least the field's current one.
    pub fn set(&mut self, value: ParamValue, provenance: Provenance) -> Result<Applied, ParamError> {
        let current = self.params.provenance(value.field());
        if provenance < current {
            tracing::debug!(field = %value.field(), ?current, ?provenance, "write ignored: lower provenance");
            return Ok(Applied::Ignored { current });
        }
        let mut candidate = self.params;
        candidate.write(value, provenance);
        self.commit(candidate)
    }

    /// Write several fields atomically: either every eligible field is
    /// stored or none is. Fields held by a higher provenance are skipped.
    pub fn set_many(
        &mut self,
        values: &[ParamValue],
        provenance: Provenance,
    ) -> Result<Vec<Field>, ParamError> {
        let mut candidate = self.params;
        let mut written = Vec::new();
        for value in values {
            if provenance >= candidate.provenance(value.field()) {
                candidate.write(*value, provenance);
                written.push(value.field());
            }
        }
        match self.commit(candidate)? {
            Applied::Written => Ok(written),
            _ => Ok(Vec::new()),
        }
    }

    /// Return a field to its default value and provenance.
    pub fn reset(&mut self, field: Field) -> Result<Applied, ParamError> {
        let mut candidate = self.params;
        candidate.write(self.defaults.value(field), Provenance::Default);
        self.commit(candidate)
    }

    /// Merge AI suggestions into fields that are not user overridden.
    ///
    /// The crop anchors move as a group: if the merged crop would violate an
    /// invariant against a user override, none of them are applied. Returns
    /// the fields that were written.
    pub fn apply_analysis(&mut self, anchors: &Anchors, background: Color) -> Vec<Field> {
        let mut candidate = self.params;
        let mut applied = Vec::new();

        if candidate.background_color.provenance <= Provenance::AiSuggested {
            candidate.write(ParamValue::BackgroundColor(background), Provenance::AiSuggested);
            applied.push(Field::BackgroundColor);
        }

        let mut with_crop = candidate;
        let mut crop_fields = Vec::new();
        for value in [
            ParamValue::CropTopY(anchors.head_top_y),
            ParamValue::CropBottomY(anchors.chest_y),
            ParamValue::CropCenterX(anchors.center_x),
        ] {
            if with_crop.provenance(value.field()) <= Provenance::AiSuggested {
                with_crop.write(value, Provenance::AiSuggested);
                crop_fields.push(value.field());
            }
        }

        match self.validate(&with_crop) {
            Ok(()) => {
                candidate = with_crop;
                applied.extend(crop_fields);
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI crop suggestion conflicts with user override; keeping current crop");
            }
        }

        // The candidate is valid: color carries no invariant and the crop
        // was either validated above or left as it was.
        if candidate != self.params {
            self.params = candidate;
            self.revision += 1;
        }
        applied
    }

    pub fn is_stale(&self, stage: Stage) -> bool {
        match self.consumed[stage.index()] {
            None => true,
            Some((source, params)) => {
                source != self.source_revision
                    || (stage.depends_on_params() && params != self.revision)
            }
        }
    }

    /// Record that `stage` has consumed the current inputs.
    pub fn mark_fresh(&mut self, stage: Stage) {
        self.consumed[stage.index()] = Some((self.source_revision, self.revision));
    }

    /// Record that `stage` consumed a specific parameter revision.
    ///
    /// Composition results arrive asynchronously; a result for an older
    /// revision leaves the stage stale.
    pub fn mark_fresh_at(&mut self, stage: Stage, revision: u64) {
        self.consumed[stage.index()] = Some((self.source_revision, revision));
    }

    fn commit(&mut self, candidate: Parameters) -> Result<Applied, ParamError> {
        if candidate == self.params {
            return Ok(Applied::Unchanged);
        }
        self.validate(&candidate)?;
        self.params = candidate;
        self.revision += 1;
        Ok(Applied::Written)
    }

    fn validate(&self, p: &Parameters) -> Result<(), ParamError> {
        let (width, height) = (self.image_size.0 as f32, self.image_size.1 as f32);
        let in_range = |field: Field, value: f32, limit: f32| {
            if value.is_finite() && (0.0..=limit).contains(&value) {
                Ok(())
            } else {
                Err(ParamError::OutOfBounds { field, value, limit })
            }
        };

        let top = p.crop_top_y.value;
        let bottom = p.crop_bottom_y.value;
        in_range(Field::CropTopY, top, height)?;
        in_range(Field::CropBottomY, bottom, height)?;
        in_range(Field::CropCenterX, p.crop_center_x.value, width)?;
        if top >= bottom {
            return Err(ParamError::InvalidCrop { top, bottom });
        }
        Ok(())
    }
}
