//! LoRA (Low-Rank Adaptation) support.
//!
//! Adapters are loaded from PEFT directories and attached to the model's
//! projections without merging into the base weights.

mod linear;
mod loader;
mod types;

pub use linear::LinearWithLora;
pub use loader::{load_config, parse_weight_name, LoraLoadError, LoraLoader};
pub use types::{LoraAdapter, LoraConfig, LoraModel, TargetModules};
