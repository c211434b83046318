//! Pixel-space backdoor triggers.
//!
//! This crate turns clean `(H, W, C)` images into poisoned ones:
//!
//! - **BadNets**: a white square patch near the bottom-right corner
//! - **Blend**: an alpha blend with a pattern image
//!
//! Both implement the [`Trigger`] trait; [`TriggerConfig`] describes either
//! one in JSON.
//!
//! # Quick Start
//!
//! ```
//! use backdoor_triggers::prelude::*;
//! use image::{Rgb, RgbImage};
//! use ndarray::Array3;
//!
//! let clean = Array3::<u8>::zeros((32, 32, 3));
//!
//! let badnets = BadNets::new(3);
//! let patched = badnets.apply(clean.clone()).unwrap();
//! assert_eq!(patched[[30, 30, 0]], 255);
//!
//! let pattern = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
//! let blend = Blend::from_image(pattern, Blend::DEFAULT_ALPHA).unwrap();
//! let blended = blend.apply(clean).unwrap();
//! assert_eq!(blended[[0, 0, 0]], 25);
//! ```

#![warn(missing_docs)]

pub mod badnets;
pub mod blend;
pub mod convert;
pub mod error;
pub mod trigger;

pub use badnets::BadNets;
pub use blend::Blend;
pub use convert::{array_to_rgb, rgb_to_array};
pub use error::{TriggerError, TriggerResult};
pub use trigger::{Trigger, TriggerConfig};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::badnets::BadNets;
    pub use crate::blend::Blend;
    pub use crate::convert::{array_to_rgb, rgb_to_array};
    pub use crate::error::{TriggerError, TriggerResult};
    pub use crate::trigger::{Trigger, TriggerConfig};
}
