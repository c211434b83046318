//! BadNets patch trigger.
//!
//! Paints a white `size x size` square into every channel, one pixel away
//! from the bottom and right borders: rows `[H-1-size, H-1)` and columns
//! `[W-1-size, W-1)`.
//!
//! # Reference
//!
//! Gu, T., et al. (2019). BadNets: Evaluating Backdooring Attacks on Deep
//! Neural Networks. IEEE Access.

use std::ops::Range;

use ndarray::{s, Array3, ArrayBase, DataMut, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::{TriggerError, TriggerResult};
use crate::trigger::Trigger;

/// The BadNets patch trigger.
///
/// # Example
///
/// ```
/// use backdoor_triggers::badnets::BadNets;
/// use ndarray::Array3;
///
/// let mut image = Array3::<f32>::zeros((10, 10, 3));
/// BadNets::new(3).add_trigger(&mut image).unwrap();
/// assert_eq!(image[[6, 6, 0]], 255.0);
/// assert_eq!(image[[9, 9, 0]], 0.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadNets {
    trigger_size: usize,
}

impl BadNets {
    /// Creates a trigger with a `trigger_size x trigger_size` patch.
    pub fn new(trigger_size: usize) -> Self {
        Self { trigger_size }
    }

    /// Returns the side length of the patch.
    pub fn trigger_size(&self) -> usize {
        self.trigger_size
    }

    /// Rows and columns covered by the patch in an image of `height x width`.
    pub fn patch(&self, height: usize, width: usize) -> TriggerResult<(Range<usize>, Range<usize>)> {
        let span = |extent: usize| {
            let end = extent.checked_sub(1)?;
            let start = end.checked_sub(self.trigger_size)?;
            Some(start..end)
        };
        match (span(height), span(width)) {
            (Some(rows), Some(cols)) => Ok((rows, cols)),
            _ => Err(TriggerError::TriggerTooLarge {
                size: self.trigger_size,
                height,
                width,
            }),
        }
    }

    /// Paints the patch into `image` in place.
    ///
    /// Works for any pixel type that can represent the value 255.
    ///
    /// # Errors
    ///
    /// Fails when the patch does not fit, i.e. `trigger_size + 1` exceeds the
    /// height or width.
    pub fn add_trigger<A, S>(&self, image: &mut ArrayBase<S, Ix3>) -> TriggerResult<()>
    where
        A: Clone + From<u8>,
        S: DataMut<Elem = A>,
    {
        let (height, width, _) = image.dim();
        let (rows, cols) = self.patch(height, width)?;
        image
            .slice_mut(s![rows, cols, ..])
            .fill(A::from(u8::MAX));
        Ok(())
    }
}

impl Trigger for BadNets {
    fn apply(&self, mut image: Array3<u8>) -> TriggerResult<Array3<u8>> {
        self.add_trigger(&mut image)?;
        Ok(image)
    }

    fn name(&self) -> &str {
        "BadNets"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_location() {
        let image = BadNets::new(3).apply(Array3::zeros((10, 10, 3))).unwrap();
        for ((row, col, _), &value) in image.indexed_iter() {
            let inside = (6..9).contains(&row) && (6..9).contains(&col);
            assert_eq!(value, if inside { 255 } else { 0 }, "pixel ({row}, {col})");
        }
    }

    #[test]
    fn test_non_square_image() {
        let trigger = BadNets::new(2);
        let (rows, cols) = trigger.patch(5, 8).unwrap();
        assert_eq!(rows, 2..4);
        assert_eq!(cols, 5..7);
    }

    #[test]
    fn test_largest_fitting_trigger() {
        // size + 1 == side: the patch starts at row/col 0
        let image = BadNets::new(4).apply(Array3::zeros((5, 5, 1))).unwrap();
        assert_eq!(image[[0, 0, 0]], 255);
        assert_eq!(image[[4, 4, 0]], 0);
    }

    #[test]
    fn test_trigger_too_large() {
        let result = BadNets::new(5).apply(Array3::zeros((5, 5, 3)));
        assert!(matches!(
            result,
            Err(TriggerError::TriggerTooLarge { size: 5, height: 5, width: 5 })
        ));
        assert!(BadNets::new(0).patch(0, 4).is_err());
    }

    #[test]
    fn test_zero_size_is_noop() {
        let image = BadNets::new(0).apply(Array3::zeros((4, 4, 3))).unwrap();
        assert!(image.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_float_pixels() {
        let mut image = Array3::<f64>::from_elem((6, 6, 3), 0.5);
        BadNets::new(2).add_trigger(&mut image).unwrap();
        assert_eq!(image[[3, 4, 2]], 255.0);
        assert_eq!(image[[5, 5, 2]], 0.5);
    }

    #[test]
    fn test_mutates_view_in_place() {
        let mut image = Array3::<u8>::zeros((4, 4, 3));
        let mut view = image.view_mut();
        BadNets::new(1).add_trigger(&mut view).unwrap();
        assert_eq!(image[[2, 2, 1]], 255);
    }
}
