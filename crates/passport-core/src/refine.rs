//! Mask refinement applied after the ensemble combines its masks.
//!
//! Two passes. Cleanup: a morphological opening removes speckle, then a blur
//! and re-threshold smooths the outline into a hard 0/255 mask. Matting: the
//! certain foreground and background are shrunk by `erode_px`, and the band
//! left between them takes a feathered alpha so hair and shoulders blend
//! into the new background instead of showing a cut edge.

use crate::types::SegmentationMask;
use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_erode, grayscale_open, Mask};

pub const DEFAULT_OPEN_RADIUS: u8 = 1;
pub const DEFAULT_CLEANUP_SIGMA: f32 = 2.0;
/// Cleanup cut: blurred values at or above this become foreground.
pub const DEFAULT_CUT_THRESHOLD: u8 = 127;
pub const DEFAULT_FOREGROUND_THRESHOLD: u8 = 240;
pub const DEFAULT_BACKGROUND_THRESHOLD: u8 = 10;
pub const DEFAULT_ERODE_PX: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskRefinement {
    /// Opening radius in pixels; 0 disables speckle removal.
    pub open_radius: u8,
    pub cleanup_sigma: f32,
    pub cut_threshold: u8,
    /// Alpha strictly above this is certain foreground.
    pub foreground_threshold: u8,
    /// Alpha strictly below this is certain background.
    pub background_threshold: u8,
    /// Width of the matting band on each side of the edge; 0 keeps a hard edge.
    pub erode_px: u8,
}

impl Default for MaskRefinement {
    fn default() -> Self {
        Self {
            open_radius: DEFAULT_OPEN_RADIUS,
            cleanup_sigma: DEFAULT_CLEANUP_SIGMA,
            cut_threshold: DEFAULT_CUT_THRESHOLD,
            foreground_threshold: DEFAULT_FOREGROUND_THRESHOLD,
            background_threshold: DEFAULT_BACKGROUND_THRESHOLD,
            erode_px: DEFAULT_ERODE_PX,
        }
    }
}

impl MaskRefinement {
    pub fn refine(&self, mask: &SegmentationMask) -> SegmentationMask {
        let cleaned = self.cleanup(mask.alpha());
        SegmentationMask::new(self.feather(&cleaned))
    }

    /// Opening, blur, re-threshold. Output is strictly 0 or 255.
    pub fn cleanup(&self, alpha: &GrayImage) -> GrayImage {
        let opened = if self.open_radius > 0 {
            grayscale_open(alpha, &Mask::disk(self.open_radius))
        } else {
            alpha.clone()
        };
        let smoothed = gaussian_blur(&opened, self.cleanup_sigma);
        let cut = self.cut_threshold;
        GrayImage::from_fn(alpha.width(), alpha.height(), |x, y| {
            Luma([if smoothed.get_pixel(x, y).0[0] >= cut { 255 } else { 0 }])
        })
    }

    /// Trimap matting: certain regions keep 0/255, the band gets a soft ramp.
    pub fn feather(&self, alpha: &GrayImage) -> GrayImage {
        if self.erode_px == 0 {
            return alpha.clone();
        }
        let (fg_cut, bg_cut) = (self.foreground_threshold, self.background_threshold);
        let foreground = select(alpha, |v| v > fg_cut);
        let background = select(alpha, |v| v < bg_cut);

        let shrink = Mask::disk(self.erode_px);
        let foreground = grayscale_erode(&foreground, &shrink);
        let background = grayscale_erode(&background, &shrink);
        let soft = gaussian_blur(alpha, self.erode_px as f32 / 2.0);

        GrayImage::from_fn(alpha.width(), alpha.height(), |x, y| {
            if foreground.get_pixel(x, y).0[0] > 0 {
                Luma([255])
            } else if background.get_pixel(x, y).0[0] > 0 {
                Luma([0])
            } else {
                *soft.get_pixel(x, y)
            }
        })
    }
}

fn select(alpha: &GrayImage, keep: impl Fn(u8) -> bool) -> GrayImage {
    GrayImage::from_fn(alpha.width(), alpha.height(), |x, y| {
        Luma([if keep(alpha.get_pixel(x, y).0[0]) { 255 } else { 0 }])
    })
}

/// `gaussian_blur_f32` panics on non-positive sigma.
fn gaussian_blur(image: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    imageproc::filter::gaussian_blur_f32(image, sigma)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Left half subject, everything else background.
    fn half_subject(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([if x < width / 2 { 255 } else { 0 }]))
    }

    #[test]
    fn test_isolated_speckle_removed() {
        let mut alpha = half_subject(100, 60);
        alpha.put_pixel(80, 30, Luma([255]));
        alpha.put_pixel(70, 20, Luma([200]));

        let refined = MaskRefinement::default().refine(&SegmentationMask::new(alpha));
        assert_eq!(refined.alpha().get_pixel(80, 30).0[0], 0);
        assert_eq!(refined.alpha().get_pixel(70, 20).0[0], 0);
    }

    #[test]
    fn test_interior_and_far_background_stay_certain() {
        let refined =
            MaskRefinement::default().refine(&SegmentationMask::new(half_subject(100, 60)));
        assert_eq!(refined.alpha().get_pixel(25, 30).0[0], 255);
        assert_eq!(refined.alpha().get_pixel(75, 30).0[0], 0);
    }

    #[test]
    fn test_edge_band_is_soft() {
        let refined =
            MaskRefinement::default().refine(&SegmentationMask::new(half_subject(100, 60)));
        let edge = refined.alpha().get_pixel(49, 30).0[0];
        assert!(edge > 0 && edge < 255, "edge alpha {edge}");
        // Monotone across the edge along one row.
        let row: Vec<u8> = (0..100).map(|x| refined.alpha().get_pixel(x, 30).0[0]).collect();
        assert!(row[25..75].windows(2).all(|w| w[0] >= w[1]), "{row:?}");
    }

    #[test]
    fn test_cleanup_is_binary() {
        let alpha = GrayImage::from_fn(20, 20, |x, y| Luma([((x * 13 + y * 7) % 256) as u8]));
        let cleaned = MaskRefinement::default().cleanup(&alpha);
        assert!(cleaned.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn test_zero_erode_keeps_hard_edge() {
        let refinement = MaskRefinement {
            erode_px: 0,
            ..MaskRefinement::default()
        };
        let refined = refinement.refine(&SegmentationMask::new(half_subject(40, 10)));
        assert!(refined.alpha().pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(refined.alpha().get_pixel(19, 5).0[0], 255);
        assert_eq!(refined.alpha().get_pixel(20, 5).0[0], 0);
    }

    #[test]
    fn test_refine_is_deterministic() {
        let mask = SegmentationMask::new(half_subject(32, 32));
        let refinement = MaskRefinement::default();
        assert_eq!(refinement.refine(&mask), refinement.refine(&mask));
    }
}
