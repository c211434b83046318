//! CLI Command Implementations
//!
//! - [`poison`]: Trigger injection into image files
//! - [`inspect`]: Gate inspection on a gated wide residual network

mod inspect;
mod poison;

pub use inspect::{GateStats, InspectCommand, InspectReport};
pub use poison::{PoisonCommand, TriggerKind};
