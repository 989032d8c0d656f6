//! Passport canvas composition.
//!
//! Pure function of (source, mask, parameters, framing): fills a fixed 3:4
//! canvas with the background color, places the subject so the head-to-chest
//! span occupies a fixed fraction of the frame, and draws the border last.

use crate::types::{Anchors, Color, CompositionWarning, OutputCanvas, Parameters, SegmentationMask};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const ASPECT_WIDTH: u32 = 3;
pub const ASPECT_HEIGHT: u32 = 4;
/// Long edge of the exported canvas; 1200 px covers a 35×45 mm print at 600+ dpi.
pub const DEFAULT_CANVAS_HEIGHT: u32 = 1200;
/// Upper bound on the canvas height; keeps the RGB buffer well inside `usize`.
pub const MAX_CANVAS_HEIGHT: u32 = 16384;
/// Where the top of the head lands, as a fraction of frame height.
pub const DEFAULT_HEAD_TOP_FRACTION: f32 = 0.10;
/// Fraction of frame height occupied by the head-top → chest-line span.
pub const DEFAULT_SPAN_FRACTION: f32 = 0.75;
/// Crop spans shorter than this (source pixels) cannot be framed.
const MIN_SPAN_PX: f32 = 1.0;
/// Sub-pixel overhang below this is rounding noise, not clamping.
const CLAMP_TOLERANCE_PX: f32 = 0.5;
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramingError {
    #[error("canvas height {0} is smaller than 4 px")]
    CanvasTooSmall(u32),
    #[error("canvas height {0} exceeds 16384 px")]
    CanvasTooLarge(u32),
    #[error("head top fraction {0} must lie in [0, 1)")]
    HeadTopFraction(f32),
    #[error("span fraction {0} must lie in (0, 1]")]
    SpanFraction(f32),
    #[error("head top fraction {head_top} + span fraction {span} exceeds the frame")]
    Overflow { head_top: f32, span: f32 },
}

/// Canvas geometry and the regulatory framing ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Framing {
    pub canvas_height: u32,
    pub head_top_fraction: f32,
    pub span_fraction: f32,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            canvas_height: DEFAULT_CANVAS_HEIGHT,
            head_top_fraction: DEFAULT_HEAD_TOP_FRACTION,
            span_fraction: DEFAULT_SPAN_FRACTION,
        }
    }
}

impl Framing {
    pub fn new(
        canvas_height: u32,
        head_top_fraction: f32,
        span_fraction: f32,
    ) -> Result<Self, FramingError> {
        if canvas_height < ASPECT_HEIGHT {
            return Err(FramingError::CanvasTooSmall(canvas_height));
        }
        if canvas_height > MAX_CANVAS_HEIGHT {
            return Err(FramingError::CanvasTooLarge(canvas_height));
        }
        if !(0.0..1.0).contains(&head_top_fraction) {
            return Err(FramingError::HeadTopFraction(head_top_fraction));
        }
        if !(span_fraction > 0.0 && span_fraction <= 1.0) {
            return Err(FramingError::SpanFraction(span_fraction));
        }
        if head_top_fraction + span_fraction > 1.0 {
            return Err(FramingError::Overflow {
                head_top: head_top_fraction,
                span: span_fraction,
            });
        }
        Ok(Self {
            canvas_height,
            head_top_fraction,
            span_fraction,
        })
    }

    /// Exact 3:4 canvas dimensions (width, height).
    ///
    /// The configured height is rounded down to a multiple of 4 so the ratio
    /// holds in whole pixels.
    pub fn canvas_size(&self) -> (u32, u32) {
        let units = (self.canvas_height / ASPECT_HEIGHT).max(1);
        (units * ASPECT_WIDTH, units * ASPECT_HEIGHT)
    }

    /// Largest centered 3:4 rectangle that fits inside a `width × height` source.
    pub fn fit_rect(&self, width: u32, height: u32) -> SourceRect {
        let (iw, ih) = (width as f32, height as f32);
        let aspect = ASPECT_WIDTH as f32 / ASPECT_HEIGHT as f32;
        let rect_w = iw.min(ih * aspect);
        let rect_h = rect_w / aspect;
        SourceRect {
            x: (iw - rect_w) / 2.0,
            y: (ih - rect_h) / 2.0,
            width: rect_w,
            height: rect_h,
        }
    }

    /// Anchors that reproduce [`Framing::fit_rect`] when composed.
    ///
    /// Used as the neutral starting point before any suggestion or edit.
    pub fn default_anchors(&self, width: u32, height: u32) -> Anchors {
        let rect = self.fit_rect(width, height);
        let head_top_y = rect.y + self.head_top_fraction * rect.height;
        Anchors {
            head_top_y,
            chest_y: head_top_y + self.span_fraction * rect.height,
            center_x: rect.x + rect.width / 2.0,
        }
    }
}

/// Axis-aligned rectangle in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl SourceRect {
    fn right(&self) -> f32 {
        self.x + self.width
    }

    fn bottom(&self) -> f32 {
        self.y + self.height
    }

    fn intersects(&self, width: u32, height: u32) -> bool {
        self.x < width as f32 && self.right() > 0.0 && self.y < height as f32 && self.bottom() > 0.0
    }
}

/// Integer source window and its footprint on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Paste {
    src_x: u32,
    src_y: u32,
    src_w: u32,
    src_h: u32,
    dst_x: u32,
    dst_y: u32,
    dst_w: u32,
    dst_h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    rect: SourceRect,
    clamped: bool,
    paste: Option<Paste>,
}

/// The source rectangle the parameters ask for, before clamping.
///
/// `None` when the crop span is degenerate or non-finite.
pub fn requested_rect(params: &Parameters, framing: &Framing) -> Option<SourceRect> {
    let (cw, ch) = framing.canvas_size();
    let top = params.crop_top_y.value;
    let center = params.crop_center_x.value;
    let span = params.crop_bottom_y.value - top;
    if !(span.is_finite() && span >= MIN_SPAN_PX && top.is_finite() && center.is_finite()) {
        return None;
    }

    let scale = framing.span_fraction * ch as f32 / span;
    let width = cw as f32 / scale;
    let height = ch as f32 / scale;
    Some(SourceRect {
        x: center - width / 2.0,
        y: top - framing.head_top_fraction * ch as f32 / scale,
        width,
        height,
    })
}

fn layout(params: &Parameters, width: u32, height: u32, framing: &Framing) -> Layout {
    let (cw, ch) = framing.canvas_size();

    let (rect, mut clamped) = match requested_rect(params, framing).filter(|r| r.intersects(width, height)) {
        Some(rect) => (rect, false),
        None => (framing.fit_rect(width, height), true),
    };

    let visible_x0 = rect.x.max(0.0);
    let visible_y0 = rect.y.max(0.0);
    let visible_x1 = rect.right().min(width as f32);
    let visible_y1 = rect.bottom().min(height as f32);

    if visible_x0 - rect.x > CLAMP_TOLERANCE_PX
        || visible_y0 - rect.y > CLAMP_TOLERANCE_PX
        || rect.right() - visible_x1 > CLAMP_TOLERANCE_PX
        || rect.bottom() - visible_y1 > CLAMP_TOLERANCE_PX
    {
        clamped = true;
    }

    let src_x = visible_x0.floor() as u32;
    let src_y = visible_y0.floor() as u32;
    let src_x1 = (visible_x1.ceil() as u32).min(width);
    let src_y1 = (visible_y1.ceil() as u32).min(height);
    if src_x1 <= src_x || src_y1 <= src_y {
        return Layout { rect, clamped, paste: None };
    }

    let scale = cw as f32 / rect.width;
    let to_canvas = |s: u32, origin: f32, extent: u32| -> u32 {
        ((s as f32 - origin) * scale).round().clamp(0.0, extent as f32) as u32
    };
    let dst_x = to_canvas(src_x, rect.x, cw);
    let dst_x1 = to_canvas(src_x1, rect.x, cw);
    let dst_y = to_canvas(src_y, rect.y, ch);
    let dst_y1 = to_canvas(src_y1, rect.y, ch);
    if dst_x1 <= dst_x || dst_y1 <= dst_y {
        return Layout { rect, clamped, paste: None };
    }

    Layout {
        rect,
        clamped,
        paste: Some(Paste {
            src_x,
            src_y,
            src_w: src_x1 - src_x,
            src_h: src_y1 - src_y,
            dst_x,
            dst_y,
            dst_w: dst_x1 - dst_x,
            dst_h: dst_y1 - dst_y,
        }),
    }
}

/// Render the passport canvas.
///
/// Always produces an image of exactly [`Framing::canvas_size`]. A missing
/// (or mismatched) mask degrades to an opaque paste; a crop reaching past
/// the source is letterboxed with the background color and flagged.
pub fn compose(
    source: &RgbImage,
    mask: Option<&SegmentationMask>,
    params: &Parameters,
    framing: &Framing,
) -> OutputCanvas {
    let (cw, ch) = framing.canvas_size();
    let background = params.background_color.value.to_rgb();
    let mut canvas = RgbImage::from_pixel(cw, ch, background);
    let mut warnings = Vec::new();

    let mask = match mask {
        Some(m) if m.width() == source.width() && m.height() == source.height() => Some(m),
        Some(m) => {
            tracing::warn!(
                mask = ?(m.width(), m.height()),
                source = ?source.dimensions(),
                "mask dimensions do not match source; compositing without mask"
            );
            None
        }
        None => None,
    };
    if mask.is_none() {
        warnings.push(CompositionWarning::DegradedNoMask);
    }

    let plan = layout(params, source.width(), source.height(), framing);
    if plan.clamped {
        warnings.push(CompositionWarning::Clamped);
    }
    tracing::debug!(rect = ?plan.rect, clamped = plan.clamped, "composition layout");

    if let Some(p) = plan.paste {
        let subject = imageops::resize(
            &imageops::crop_imm(source, p.src_x, p.src_y, p.src_w, p.src_h).to_image(),
            p.dst_w,
            p.dst_h,
            RESAMPLE_FILTER,
        );
        let alpha = mask.map(|m| {
            imageops::resize(
                &imageops::crop_imm(m.alpha(), p.src_x, p.src_y, p.src_w, p.src_h).to_image(),
                p.dst_w,
                p.dst_h,
                RESAMPLE_FILTER,
            )
        });

        for (x, y, fg) in subject.enumerate_pixels() {
            let a = alpha.as_ref().map_or(255, |al| al.get_pixel(x, y).0[0]);
            let dst = canvas.get_pixel_mut(p.dst_x + x, p.dst_y + y);
            *dst = blend(*fg, *dst, a);
        }
    }

    draw_border(
        &mut canvas,
        params.border_width_px.value,
        params.border_color.value.color(),
    );

    OutputCanvas {
        image: canvas,
        warnings,
    }
}

/// Integer "over" blend; exact and platform independent.
fn blend(fg: Rgb<u8>, bg: Rgb<u8>, alpha: u8) -> Rgb<u8> {
    let a = alpha as u32;
    let mix = |f: u8, b: u8| ((f as u32 * a + b as u32 * (255 - a) + 127) / 255) as u8;
    Rgb([mix(fg[0], bg[0]), mix(fg[1], bg[1]), mix(fg[2], bg[2])])
}

/// Solid border flush against all four edges, capped at half the short side.
fn draw_border(canvas: &mut RgbImage, width: u32, color: Color) {
    let (w, h) = canvas.dimensions();
    let bw = width.min(w.min(h) / 2);
    if bw == 0 {
        return;
    }
    let ink = color.to_rgb();
    for (x, y, px) in canvas.enumerate_pixels_mut() {
        if x < bw || y < bw || x >= w - bw || y >= h - bw {
            *px = ink;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BorderColor, Provenance, Tagged};
    use image::{GrayImage, Luma};

    const RED: Rgb<u8> = Rgb([220, 20, 20]);
    const BLUE: Rgb<u8> = Rgb([20, 20, 220]);

    fn params(top: f32, bottom: f32, center: f32, border: u32, ink: BorderColor) -> Parameters {
        let t = |v| Tagged::new(v, Provenance::UserOverridden);
        Parameters {
            background_color: Tagged::new(Color::new(200, 220, 240), Provenance::Default),
            crop_top_y: t(top),
            crop_bottom_y: t(bottom),
            crop_center_x: t(center),
            border_width_px: Tagged::new(border, Provenance::Default),
            border_color: Tagged::new(ink, Provenance::Default),
        }
    }

    fn small_framing() -> Framing {
        Framing::new(400, DEFAULT_HEAD_TOP_FRACTION, DEFAULT_SPAN_FRACTION).unwrap()
    }

    fn full_mask(w: u32, h: u32) -> SegmentationMask {
        SegmentationMask::new(GrayImage::from_pixel(w, h, Luma([255])))
    }

    #[test]
    fn test_canvas_size_is_exact_three_by_four() {
        assert_eq!(Framing::default().canvas_size(), (900, 1200));
        let odd = Framing::new(1203, 0.1, 0.75).unwrap();
        assert_eq!(odd.canvas_size(), (900, 1200));
        let tiny = Framing::new(4, 0.1, 0.75).unwrap();
        assert_eq!(tiny.canvas_size(), (3, 4));
    }

    #[test]
    fn test_framing_rejects_invalid_fractions() {
        assert!(Framing::new(2, 0.1, 0.75).is_err());
        assert!(Framing::new(1200, -0.1, 0.75).is_err());
        assert!(Framing::new(1200, 0.1, 0.0).is_err());
        assert!(Framing::new(1200, 0.3, 0.8).is_err());
    }

    #[test]
    fn test_framing_rejects_oversized_canvas() {
        assert_eq!(
            Framing::new(u32::MAX, 0.1, 0.75),
            Err(FramingError::CanvasTooLarge(u32::MAX))
        );
        assert_eq!(
            Framing::new(MAX_CANVAS_HEIGHT + 1, 0.1, 0.75),
            Err(FramingError::CanvasTooLarge(MAX_CANVAS_HEIGHT + 1))
        );
        let largest = Framing::new(MAX_CANVAS_HEIGHT, 0.1, 0.75).unwrap();
        assert_eq!(largest.canvas_size(), (12288, 16384));
    }

    #[test]
    fn test_output_ratio_and_border_for_various_inputs() {
        let framing = small_framing();
        let cases = [
            (600u32, 800u32, 80.0f32, 500.0f32, 300.0f32, 6u32),
            (1600, 900, 100.0, 600.0, 800.0, 1),
            (300, 300, 10.0, 290.0, 150.0, 12),
            (50, 2000, 0.0, 1999.0, 25.0, 3),
        ];
        for (w, h, top, bottom, center, border) in cases {
            let source = RgbImage::from_pixel(w, h, RED);
            let p = params(top, bottom, center, border, BorderColor::Black);
            let out = compose(&source, Some(&full_mask(w, h)), &p, &framing);
            assert_eq!(out.width() * ASPECT_HEIGHT, out.height() * ASPECT_WIDTH, "{w}x{h}");
            assert_eq!((out.width(), out.height()), framing.canvas_size());

            // Border pixels are ink, the first pixel inside is not.
            let mid_y = out.height() / 2;
            for x in 0..border {
                assert_eq!(*out.image.get_pixel(x, mid_y), Rgb([0, 0, 0]));
                assert_eq!(*out.image.get_pixel(out.width() - 1 - x, mid_y), Rgb([0, 0, 0]));
            }
            assert_ne!(*out.image.get_pixel(border, mid_y), Rgb([0, 0, 0]));
        }
    }

    #[test]
    fn test_compose_is_byte_identical_across_calls() {
        let framing = small_framing();
        let mut source = RgbImage::new(320, 480);
        for (x, y, px) in source.enumerate_pixels_mut() {
            *px = Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
        }
        let mut alpha = GrayImage::new(320, 480);
        for (x, _, px) in alpha.enumerate_pixels_mut() {
            *px = Luma([if x > 100 && x < 220 { 255 } else { 0 }]);
        }
        let mask = SegmentationMask::new(alpha);
        let p = params(60.0, 380.0, 160.0, 4, BorderColor::White);

        let a = compose(&source, Some(&mask), &p, &framing);
        let b = compose(&source, Some(&mask), &p, &framing);
        assert_eq!(a.image.as_raw(), b.image.as_raw());
        assert_eq!(a.warnings, b.warnings);
    }

    #[test]
    fn test_head_top_lands_at_regulation_fraction() {
        // 2000x3000 source, anchors 300 / 1650 → head top at 10% of 1200 = row 120.
        let framing = Framing::default();
        let mut source = RgbImage::from_pixel(2000, 3000, BLUE);
        for y in 0..300 {
            for x in 0..2000 {
                source.put_pixel(x, y, RED);
            }
        }
        let p = params(300.0, 1650.0, 1000.0, 0, BorderColor::Black);
        let out = compose(&source, Some(&full_mask(2000, 3000)), &p, &framing);

        assert!(!out.has_warning(CompositionWarning::Clamped));
        let expected_row = (framing.head_top_fraction * 1200.0) as u32;
        assert_eq!(expected_row, 120);
        assert_eq!(*out.image.get_pixel(450, expected_row - 6), RED);
        assert_eq!(*out.image.get_pixel(450, expected_row + 6), BLUE);
    }

    #[test]
    fn test_mask_composites_subject_over_background() {
        let framing = small_framing();
        let source = RgbImage::from_pixel(300, 400, RED);
        let mut alpha = GrayImage::new(300, 400);
        for y in 0..400 {
            for x in 100..200 {
                alpha.put_pixel(x, y, Luma([255]));
            }
        }
        let mask = SegmentationMask::new(alpha);
        let rect = framing.fit_rect(300, 400);
        let anchors = framing.default_anchors(300, 400);
        assert_eq!(rect.width, 300.0);
        let p = params(anchors.head_top_y, anchors.chest_y, anchors.center_x, 0, BorderColor::Black);
        let out = compose(&source, Some(&mask), &p, &framing);

        assert!(out.warnings.is_empty(), "{:?}", out.warnings);
        let (cw, ch) = framing.canvas_size();
        // Center column is subject, far left column is background fill.
        assert_eq!(*out.image.get_pixel(cw / 2, ch / 2), RED);
        assert_eq!(*out.image.get_pixel(5, ch / 2), Color::new(200, 220, 240).to_rgb());
    }

    #[test]
    fn test_missing_mask_degrades_and_keeps_fill() {
        // Crop reaches above the image: letterbox band shows background fill.
        let framing = small_framing();
        let source = RgbImage::from_pixel(300, 400, RED);
        let p = params(5.0, 205.0, 150.0, 0, BorderColor::Black);
        let out = compose(&source, None, &p, &framing);

        assert!(out.has_warning(CompositionWarning::DegradedNoMask));
        assert!(out.has_warning(CompositionWarning::Clamped));
        let fill = Color::new(200, 220, 240).to_rgb();
        assert_eq!(*out.image.get_pixel(150, 0), fill, "letterbox band keeps fill");
        // Subject pasted opaquely, without matting.
        let (cw, ch) = framing.canvas_size();
        assert_eq!(*out.image.get_pixel(cw / 2, ch / 2), RED);
    }

    #[test]
    fn test_crop_outside_image_falls_back_to_fit_rect() {
        let framing = small_framing();
        let source = RgbImage::from_pixel(300, 400, RED);
        let p = params(5000.0, 6000.0, 150.0, 0, BorderColor::Black);
        let out = compose(&source, Some(&full_mask(300, 400)), &p, &framing);
        assert!(out.has_warning(CompositionWarning::Clamped));
        assert_eq!((out.width(), out.height()), framing.canvas_size());
        assert!(out.image.pixels().all(|px| *px == RED));
    }

    #[test]
    fn test_degenerate_span_falls_back() {
        let framing = small_framing();
        let p = params(100.0, 100.5, 150.0, 0, BorderColor::Black);
        assert!(requested_rect(&p, &framing).is_none());
        let source = RgbImage::from_pixel(300, 400, RED);
        let out = compose(&source, None, &p, &framing);
        assert!(out.has_warning(CompositionWarning::Clamped));
    }

    #[test]
    fn test_landscape_source_is_letterboxed_not_stretched() {
        let framing = small_framing();
        let source = RgbImage::from_pixel(1600, 400, RED);
        let anchors = framing.default_anchors(1600, 400);
        let p = params(anchors.head_top_y, anchors.chest_y, anchors.center_x, 0, BorderColor::Black);
        let out = compose(&source, Some(&full_mask(1600, 400)), &p, &framing);
        assert!(!out.has_warning(CompositionWarning::Clamped));
        assert!(out.image.pixels().all(|px| *px == RED));
    }

    #[test]
    fn test_mismatched_mask_is_ignored() {
        let framing = small_framing();
        let source = RgbImage::from_pixel(300, 400, RED);
        let anchors = framing.default_anchors(300, 400);
        let p = params(anchors.head_top_y, anchors.chest_y, anchors.center_x, 0, BorderColor::Black);
        let out = compose(&source, Some(&full_mask(10, 10)), &p, &framing);
        assert!(out.has_warning(CompositionWarning::DegradedNoMask));
    }

    #[test]
    fn test_border_is_capped_at_half_short_side() {
        let framing = Framing::new(8, 0.1, 0.75).unwrap();
        let source = RgbImage::from_pixel(30, 40, RED);
        let p = params(4.0, 34.0, 15.0, 1000, BorderColor::White);
        let out = compose(&source, None, &p, &framing);
        assert!(out.image.pixels().all(|px| *px == Rgb([255, 255, 255])));
    }

    #[test]
    fn test_blend_extremes() {
        assert_eq!(blend(RED, BLUE, 255), RED);
        assert_eq!(blend(RED, BLUE, 0), BLUE);
        let half = blend(Rgb([255, 0, 0]), Rgb([0, 0, 255]), 128);
        assert_eq!(half, Rgb([128, 0, 127]));
    }
}
