//! The [`Trigger`] trait and serializable trigger configuration.
//!
//! # Example
//!
//! ```
//! use backdoor_triggers::trigger::{Trigger, TriggerConfig};
//! use ndarray::Array3;
//!
//! let config: TriggerConfig = serde_json::from_str(r#"{"kind": "badnets", "trigger_size": 3}"#).unwrap();
//! let trigger = config.build().unwrap();
//! let poisoned = trigger.apply(Array3::zeros((10, 10, 3))).unwrap();
//! assert_eq!(poisoned[[8, 8, 0]], 255);
//! ```

use std::path::PathBuf;

use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::badnets::BadNets;
use crate::blend::Blend;
use crate::convert::{array_to_rgb, rgb_to_array};
use crate::error::TriggerResult;

/// A backdoor trigger that turns a clean `(H, W, C)` image into a poisoned one.
pub trait Trigger: Send + Sync {
    /// Applies the trigger to an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image layout is not supported by the trigger.
    fn apply(&self, image: Array3<u8>) -> TriggerResult<Array3<u8>>;

    /// Applies the trigger to an RGB image buffer.
    fn apply_rgb(&self, image: &RgbImage) -> TriggerResult<RgbImage> {
        let poisoned = self.apply(rgb_to_array(image)?)?;
        array_to_rgb(poisoned.view())
    }

    /// Returns the name of this trigger for debugging purposes.
    fn name(&self) -> &str {
        "Trigger"
    }
}

/// Serializable description of a trigger.
///
/// Tagged by `kind`: `{"kind": "badnets", "trigger_size": 3}` or
/// `{"kind": "blend", "trigger_path": "hello_kitty.png", "alpha": 0.1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerConfig {
    /// White square patch near the bottom-right corner.
    BadNets {
        /// Side length of the patch.
        trigger_size: usize,
    },
    /// Alpha blend with a pattern image.
    Blend {
        /// Path of the pattern image.
        trigger_path: PathBuf,
        /// Weight of the pattern (default: 0.1).
        #[serde(default = "default_alpha")]
        alpha: f32,
    },
}

fn default_alpha() -> f32 {
    Blend::DEFAULT_ALPHA
}

impl TriggerConfig {
    /// Builds the configured trigger, loading pattern images from disk.
    pub fn build(&self) -> TriggerResult<Box<dyn Trigger>> {
        Ok(match self {
            TriggerConfig::BadNets { trigger_size } => Box::new(BadNets::new(*trigger_size)),
            TriggerConfig::Blend {
                trigger_path,
                alpha,
            } => Box::new(Blend::open(trigger_path, *alpha)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tags() {
        let badnets = TriggerConfig::BadNets { trigger_size: 3 };
        let json = serde_json::to_value(&badnets).unwrap();
        assert_eq!(json["kind"], "badnets");
        assert_eq!(json["trigger_size"], 3);

        let blend: TriggerConfig =
            serde_json::from_str(r#"{"kind": "blend", "trigger_path": "pattern.png"}"#).unwrap();
        assert_eq!(
            blend,
            TriggerConfig::Blend {
                trigger_path: PathBuf::from("pattern.png"),
                alpha: 0.1,
            }
        );

        assert!(serde_json::from_str::<TriggerConfig>(r#"{"kind": "wanet"}"#).is_err());
    }

    #[test]
    fn test_build_badnets() {
        let trigger = TriggerConfig::BadNets { trigger_size: 2 }.build().unwrap();
        assert_eq!(trigger.name(), "BadNets");
    }

    #[test]
    fn test_build_blend_missing_file() {
        let config = TriggerConfig::Blend {
            trigger_path: PathBuf::from("/nonexistent/trigger.png"),
            alpha: 0.1,
        };
        assert!(config.build().is_err());
    }

    #[test]
    fn test_apply_rgb() {
        let trigger = BadNets::new(1);
        let image = RgbImage::new(4, 4);
        let poisoned = trigger.apply_rgb(&image).unwrap();
        assert_eq!(poisoned.get_pixel(2, 2).0, [255, 255, 255]);
        assert_eq!(poisoned.get_pixel(3, 3).0, [0, 0, 0]);
    }
}
