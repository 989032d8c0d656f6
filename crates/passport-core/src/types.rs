use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 8-bit sRGB color, serialized as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(255, 255, 255);
    pub const BLACK: Color = Color::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_rgb(self) -> image::Rgb<u8> {
        image::Rgb([self.r, self.g, self.b])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid color {0:?}: expected #RRGGBB")]
pub struct ColorParseError(pub String);

impl FromStr for Color {
    type Err = ColorParseError;

    /// Parse `#RRGGBB` (the leading `#` is optional for hand-typed input).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ColorParseError(s.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ColorParseError(s.to_string()))
        };
        Ok(Color::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl TryFrom<String> for Color {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

/// Border ink. Passport borders are either white or black, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorderColor {
    White,
    Black,
}

impl BorderColor {
    pub fn color(self) -> Color {
        match self {
            BorderColor::White => Color::WHITE,
            BorderColor::Black => Color::BLACK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid border color {0:?}: expected \"white\" or \"black\"")]
pub struct BorderColorParseError(pub String);

impl FromStr for BorderColor {
    type Err = BorderColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "white" => Ok(BorderColor::White),
            "black" => Ok(BorderColor::Black),
            _ => Err(BorderColorParseError(s.to_string())),
        }
    }
}

impl fmt::Display for BorderColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BorderColor::White => f.write_str("white"),
            BorderColor::Black => f.write_str("black"),
        }
    }
}

/// Where a parameter value came from.
///
/// Ordered by authority: a write is accepted only when its provenance is at
/// least the field's current provenance, so a user override can never be
/// replaced by a later AI suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Default,
    AiSuggested,
    UserOverridden,
}

/// A parameter value together with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    pub value: T,
    pub provenance: Provenance,
}

impl<T> Tagged<T> {
    pub fn new(value: T, provenance: Provenance) -> Self {
        Self { value, provenance }
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, Provenance::Default)
    }

    pub fn is_overridden(&self) -> bool {
        self.provenance == Provenance::UserOverridden
    }
}

/// Names of the individually addressable pipeline parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    BackgroundColor,
    CropTopY,
    CropBottomY,
    CropCenterX,
    BorderWidth,
    BorderColor,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::BackgroundColor,
        Field::CropTopY,
        Field::CropBottomY,
        Field::CropCenterX,
        Field::BorderWidth,
        Field::BorderColor,
    ];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::BackgroundColor => "background_color",
            Field::CropTopY => "crop_top_y",
            Field::CropBottomY => "crop_bottom_y",
            Field::CropCenterX => "crop_center_x",
            Field::BorderWidth => "border_width_px",
            Field::BorderColor => "border_color",
        };
        f.write_str(name)
    }
}

/// A value for exactly one [`Field`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    BackgroundColor(Color),
    CropTopY(f32),
    CropBottomY(f32),
    CropCenterX(f32),
    BorderWidth(u32),
    BorderColor(BorderColor),
}

impl ParamValue {
    pub fn field(&self) -> Field {
        match self {
            ParamValue::BackgroundColor(_) => Field::BackgroundColor,
            ParamValue::CropTopY(_) => Field::CropTopY,
            ParamValue::CropBottomY(_) => Field::CropBottomY,
            ParamValue::CropCenterX(_) => Field::CropCenterX,
            ParamValue::BorderWidth(_) => Field::BorderWidth,
            ParamValue::BorderColor(_) => Field::BorderColor,
        }
    }
}

/// Full parameter set for one photo job. Crop coordinates are in
/// full-resolution source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub background_color: Tagged<Color>,
    pub crop_top_y: Tagged<f32>,
    pub crop_bottom_y: Tagged<f32>,
    pub crop_center_x: Tagged<f32>,
    pub border_width_px: Tagged<u32>,
    pub border_color: Tagged<BorderColor>,
}

impl Parameters {
    pub fn provenance(&self, field: Field) -> Provenance {
        match field {
            Field::BackgroundColor => self.background_color.provenance,
            Field::CropTopY => self.crop_top_y.provenance,
            Field::CropBottomY => self.crop_bottom_y.provenance,
            Field::CropCenterX => self.crop_center_x.provenance,
            Field::BorderWidth => self.border_width_px.provenance,
            Field::BorderColor => self.border_color.provenance,
        }
    }

    pub fn value(&self, field: Field) -> ParamValue {
        match field {
            Field::BackgroundColor => ParamValue::BackgroundColor(self.background_color.value),
            Field::CropTopY => ParamValue::CropTopY(self.crop_top_y.value),
            Field::CropBottomY => ParamValue::CropBottomY(self.crop_bottom_y.value),
            Field::CropCenterX => ParamValue::CropCenterX(self.crop_center_x.value),
            Field::BorderWidth => ParamValue::BorderWidth(self.border_width_px.value),
            Field::BorderColor => ParamValue::BorderColor(self.border_color.value),
        }
    }

    /// Overwrite one field unconditionally. Callers validate first.
    pub(crate) fn write(&mut self, value: ParamValue, provenance: Provenance) {
        match value {
            ParamValue::BackgroundColor(v) => self.background_color = Tagged::new(v, provenance),
            ParamValue::CropTopY(v) => self.crop_top_y = Tagged::new(v, provenance),
            ParamValue::CropBottomY(v) => self.crop_bottom_y = Tagged::new(v, provenance),
            ParamValue::CropCenterX(v) => self.crop_center_x = Tagged::new(v, provenance),
            ParamValue::BorderWidth(v) => self.border_width_px = Tagged::new(v, provenance),
            ParamValue::BorderColor(v) => self.border_color = Tagged::new(v, provenance),
        }
    }
}

/// A point normalized to [0, 1] in the thumbnail's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
}

/// Suggestions returned by the remote analysis service.
///
/// Coordinates are normalized to the thumbnail that was submitted; use
/// [`AnalysisResult::anchors`] before feeding them to the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub background_color: Color,
    pub head_top: NormalizedPoint,
    pub chest: NormalizedPoint,
}

/// Crop anchors in full-resolution source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchors {
    pub head_top_y: f32,
    pub chest_y: f32,
    pub center_x: f32,
}

impl AnalysisResult {
    /// Rescale thumbnail-normalized anchors to full-resolution pixels.
    ///
    /// Goes through thumbnail pixels first, then applies the
    /// `full / thumbnail` scale factor per axis.
    pub fn anchors(&self, thumbnail: (u32, u32), full: (u32, u32)) -> Anchors {
        let (thumb_w, thumb_h) = (thumbnail.0.max(1) as f32, thumbnail.1.max(1) as f32);
        let scale_x = full.0 as f32 / thumb_w;
        let scale_y = full.1 as f32 / thumb_h;

        let center_norm = (self.head_top.x + self.chest.x) / 2.0;

        Anchors {
            head_top_y: self.head_top.y * thumb_h * scale_y,
            chest_y: self.chest.y * thumb_h * scale_y,
            center_x: center_norm * thumb_w * scale_x,
        }
    }
}

/// Full-resolution single-channel alpha mask (255 = subject).
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    alpha: GrayImage,
}

impl SegmentationMask {
    pub fn new(alpha: GrayImage) -> Self {
        Self { alpha }
    }

    pub fn width(&self) -> u32 {
        self.alpha.width()
    }

    pub fn height(&self) -> u32 {
        self.alpha.height()
    }

    pub fn alpha(&self) -> &GrayImage {
        &self.alpha
    }

    pub fn into_inner(self) -> GrayImage {
        self.alpha
    }

    /// Fraction of pixels that are predominantly subject (alpha ≥ 128).
    pub fn coverage(&self) -> f32 {
        let total = self.alpha.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        let fg = self.alpha.as_raw().iter().filter(|&&a| a >= 128).count();
        fg as f32 / total as f32
    }
}

/// Informational flags attached to a rendered canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionWarning {
    /// The requested crop reached past the source bounds and was clamped.
    Clamped,
    /// No mask was available; the subject was pasted without matting.
    DegradedNoMask,
}

impl fmt::Display for CompositionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositionWarning::Clamped => f.write_str("crop clamped to image bounds"),
            CompositionWarning::DegradedNoMask => {
                f.write_str("background removal unavailable; subject pasted without matting")
            }
        }
    }
}

/// Rendered 3:4 passport image with its composition warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCanvas {
    pub image: RgbImage,
    pub warnings: Vec<CompositionWarning>,
}

impl OutputCanvas {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn has_warning(&self, warning: CompositionWarning) -> bool {
        self.warnings.contains(&warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_parse_with_and_without_hash() {
        assert_eq!("#E8EEF2".parse::<Color>().unwrap(), Color::new(0xE8, 0xEE, 0xF2));
        assert_eq!("e8eef2".parse::<Color>().unwrap(), Color::new(0xE8, 0xEE, 0xF2));
    }

    #[test]
    fn test_color_parse_rejects_garbage() {
        assert!("#FFF".parse::<Color>().is_err());
        assert!("#GGGGGG".parse::<Color>().is_err());
        assert!("".parse::<Color>().is_err());
        assert!("#FFFFFFF".parse::<Color>().is_err());
    }

    #[test]
    fn test_color_display_is_uppercase_hex() {
        assert_eq!(Color::new(10, 171, 255).to_string(), "#0AABFF");
    }

    #[test]
    fn test_color_serde_as_string() {
        let json = serde_json::to_string(&Color::new(255, 0, 16)).unwrap();
        assert_eq!(json, "\"#FF0010\"");
        let back: Color = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Color::new(255, 0, 16));
        assert!(serde_json::from_str::<Color>("\"red\"").is_err());
    }

    #[test]
    fn test_border_color_parse() {
        assert_eq!("White".parse::<BorderColor>().unwrap(), BorderColor::White);
        assert_eq!(" black ".parse::<BorderColor>().unwrap(), BorderColor::Black);
        assert!("grey".parse::<BorderColor>().is_err());
    }

    #[test]
    fn test_provenance_ordering() {
        assert!(Provenance::Default < Provenance::AiSuggested);
        assert!(Provenance::AiSuggested < Provenance::UserOverridden);
    }

    #[test]
    fn test_param_value_field_mapping() {
        assert_eq!(ParamValue::CropTopY(1.0).field(), Field::CropTopY);
        assert_eq!(ParamValue::BorderWidth(3).field(), Field::BorderWidth);
        assert_eq!(
            ParamValue::BorderColor(BorderColor::White).field(),
            Field::BorderColor
        );
    }

    #[test]
    fn test_anchors_rescale_to_full_resolution() {
        // 2000x3000 source, 200x300 thumbnail: anchors 0.10 / 0.55 → 300 / 1650.
        let result = AnalysisResult {
            background_color: Color::WHITE,
            head_top: NormalizedPoint { x: 0.5, y: 0.10 },
            chest: NormalizedPoint { x: 0.5, y: 0.55 },
        };
        let anchors = result.anchors((200, 300), (2000, 3000));
        assert!((anchors.head_top_y - 300.0).abs() < 1e-2, "head_top_y = {}", anchors.head_top_y);
        assert!((anchors.chest_y - 1650.0).abs() < 1e-2, "chest_y = {}", anchors.chest_y);
        assert!((anchors.center_x - 1000.0).abs() < 1e-2, "center_x = {}", anchors.center_x);
    }

    #[test]
    fn test_anchors_center_is_mean_of_x() {
        let result = AnalysisResult {
            background_color: Color::WHITE,
            head_top: NormalizedPoint { x: 0.4, y: 0.2 },
            chest: NormalizedPoint { x: 0.6, y: 0.7 },
        };
        let anchors = result.anchors((100, 100), (1000, 1000));
        assert!((anchors.center_x - 500.0).abs() < 1e-2);
    }

    #[test]
    fn test_mask_coverage() {
        let mut alpha = GrayImage::new(4, 1);
        alpha.put_pixel(0, 0, image::Luma([255]));
        alpha.put_pixel(1, 0, image::Luma([200]));
        let mask = SegmentationMask::new(alpha);
        assert!((mask.coverage() - 0.5).abs() < 1e-6);
    }
}
