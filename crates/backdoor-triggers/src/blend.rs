//! Blended (alpha-blend) trigger.
//!
//! The pattern image is resized to the input with bicubic (Catmull-Rom)
//! filtering and mixed in as `a + alpha * (b - a)`, truncated toward zero and
//! clipped to `0..=255`.
//!
//! # Reference
//!
//! Chen, X., et al. (2017). Targeted Backdoor Attacks on Deep Learning
//! Systems Using Data Poisoning. arXiv:1712.05526.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array3, ArrayD, ArrayView3, Ix3, Zip};
use tracing::debug;

use crate::error::{TriggerError, TriggerResult};
use crate::trigger::Trigger;

/// The Blend trigger.
///
/// # Example
///
/// ```
/// use backdoor_triggers::blend::Blend;
/// use image::{Rgb, RgbImage};
/// use ndarray::Array3;
///
/// let pattern = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
/// let blend = Blend::from_image(pattern, 0.5).unwrap();
/// let poisoned = blend.blend(Array3::<u8>::zeros((2, 2, 3)).view()).unwrap();
/// assert_eq!(poisoned[[0, 0, 0]], 127);
/// ```
#[derive(Debug, Clone)]
pub struct Blend {
    pattern: RgbImage,
    alpha: f32,
}

impl Blend {
    /// Weight of the pattern when none is configured.
    pub const DEFAULT_ALPHA: f32 = 0.1;

    /// Loads the pattern from an image file and converts it to RGB.
    pub fn open(path: impl AsRef<Path>, alpha: f32) -> TriggerResult<Self> {
        let path = path.as_ref();
        let pattern = image::open(path)?.to_rgb8();
        debug!(
            path = %path.display(),
            width = pattern.width(),
            height = pattern.height(),
            alpha,
            "loaded blend pattern"
        );
        Self::from_image(pattern, alpha)
    }

    /// Uses an in-memory RGB image as the pattern.
    ///
    /// # Errors
    ///
    /// Fails when `alpha` is not finite. Factors outside `[0, 1]` extrapolate
    /// and are clipped per pixel.
    pub fn from_image(pattern: RgbImage, alpha: f32) -> TriggerResult<Self> {
        if !alpha.is_finite() {
            return Err(TriggerError::InvalidAlpha { alpha });
        }
        Ok(Self { pattern, alpha })
    }

    /// Returns the pattern image.
    pub fn pattern(&self) -> &RgbImage {
        &self.pattern
    }

    /// Returns the blend factor.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Blends an array of any rank, rejecting anything but `(H, W, 3)`.
    pub fn blend_trigger(&self, image: &ArrayD<u8>) -> TriggerResult<Array3<u8>> {
        if image.ndim() != 3 {
            return Err(TriggerError::shape(
                image.shape(),
                "expected an (H, W, C) image",
            ));
        }
        let view = image
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| TriggerError::shape(image.shape(), e.to_string()))?;
        self.blend(view)
    }

    /// Blends the pattern into an `(H, W, 3)` image and returns a new array.
    pub fn blend(&self, image: ArrayView3<'_, u8>) -> TriggerResult<Array3<u8>> {
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(TriggerError::shape(
                image.shape(),
                "expected 3 channels (H, W, 3)",
            ));
        }

        let pattern = self.resized_pattern(width, height)?;
        let alpha = self.alpha;
        let mut out = Array3::<u8>::zeros((height, width, channels));
        Zip::indexed(&mut out)
            .and(&image)
            .for_each(|(row, col, c), dst, &src| {
                let trigger = pattern.get_pixel(col as u32, row as u32).0[c];
                *dst = mix(src, trigger, alpha);
            });
        Ok(out)
    }

    fn resized_pattern(&self, width: usize, height: usize) -> TriggerResult<RgbImage> {
        let too_large = || TriggerError::shape(&[height, width, 3], "image is too large");
        let w = u32::try_from(width).map_err(|_| too_large())?;
        let h = u32::try_from(height).map_err(|_| too_large())?;
        if self.pattern.dimensions() == (w, h) {
            Ok(self.pattern.clone())
        } else {
            Ok(imageops::resize(&self.pattern, w, h, FilterType::CatmullRom))
        }
    }
}

fn mix(a: u8, b: u8, alpha: f32) -> u8 {
    let (a, b) = (f32::from(a), f32::from(b));
    // `as` truncates toward zero and saturates at the u8 bounds.
    (a + alpha * (b - a)) as u8
}

impl Trigger for Blend {
    fn apply(&self, image: Array3<u8>) -> TriggerResult<Array3<u8>> {
        self.blend(image.view())
    }

    fn name(&self) -> &str {
        "Blend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::IxDyn;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn test_identical_colors_are_unchanged() {
        let color = [120, 30, 200];
        let blend = Blend::from_image(solid(8, 8, color), 0.1).unwrap();
        let mut image = Array3::<u8>::zeros((4, 6, 3));
        for (i, &v) in color.iter().enumerate() {
            image.slice_mut(ndarray::s![.., .., i]).fill(v);
        }
        let poisoned = blend.apply(image.clone()).unwrap();
        assert_eq!(poisoned, image);
    }

    #[test]
    fn test_mix_truncates() {
        assert_eq!(mix(0, 255, 0.1), 25);
        assert_eq!(mix(255, 0, 0.1), 229);
        assert_eq!(mix(100, 200, 0.0), 100);
        assert_eq!(mix(100, 200, 1.0), 200);
    }

    #[test]
    fn test_extrapolation_is_clipped() {
        assert_eq!(mix(200, 250, 2.0), 255);
        assert_eq!(mix(10, 200, -1.0), 0);
    }

    #[test]
    fn test_pattern_resized_to_input() {
        let blend = Blend::from_image(solid(3, 3, [255, 255, 255]), 0.1).unwrap();
        let poisoned = blend.apply(Array3::zeros((5, 7, 3))).unwrap();
        assert_eq!(poisoned.dim(), (5, 7, 3));
        assert!(poisoned.iter().all(|&v| v == 25));
    }

    #[test]
    fn test_pattern_pixels_follow_image_coordinates() {
        let mut pattern = solid(2, 3, [0, 0, 0]);
        pattern.put_pixel(1, 2, Rgb([200, 100, 50]));
        let blend = Blend::from_image(pattern, 1.0).unwrap();
        let poisoned = blend.apply(Array3::zeros((3, 2, 3))).unwrap();
        assert_eq!(poisoned[[2, 1, 0]], 200);
        assert_eq!(poisoned[[2, 1, 2]], 50);
        assert_eq!(poisoned[[0, 0, 0]], 0);
    }

    #[test]
    fn test_rejects_wrong_rank_and_channels() {
        let blend = Blend::from_image(solid(2, 2, [0, 0, 0]), 0.1).unwrap();
        let flat = ArrayD::<u8>::zeros(IxDyn(&[4, 4]));
        assert!(matches!(
            blend.blend_trigger(&flat),
            Err(TriggerError::InvalidShape { .. })
        ));

        let rgba = ArrayD::<u8>::zeros(IxDyn(&[4, 4, 4]));
        assert!(blend.blend_trigger(&rgba).is_err());

        let rgb = ArrayD::<u8>::zeros(IxDyn(&[4, 4, 3]));
        assert_eq!(blend.blend_trigger(&rgb).unwrap().dim(), (4, 4, 3));
    }

    #[test]
    fn test_alpha_must_be_finite() {
        let pattern = solid(1, 1, [0, 0, 0]);
        assert!(matches!(
            Blend::from_image(pattern.clone(), f32::NAN),
            Err(TriggerError::InvalidAlpha { .. })
        ));
        assert!(Blend::from_image(pattern, 1.5).is_ok());
    }
}
