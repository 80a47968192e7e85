//! Single-sequence generation engine.
//!
//! One model, one request at a time: the prompt is tokenized, prefilled,
//! then decoded token by token until a stop token or the new-token budget.
//!
//! ```ignore
//! let engine = LlmEngine::new(model, tokenizer, stop_token_ids);
//! let result = engine.generate(&GenerationRequest::new(prompt, 512, params))?;
//! ```

mod model_forward;
mod standard;
mod types;

pub use model_forward::ModelForward;
pub use standard::{LlmEngine, TextGenerator};
pub use types::{EngineError, FinishReason, GenerationRequest, GenerationResult};
