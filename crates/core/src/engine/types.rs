//! Core types for the generation engine.

use serde::Serialize;
use thiserror::Error;

use crate::sampling::SamplingParams;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tokenization error: {0}")]
    Tokenization(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("prompt has {prompt_len} tokens, model accepts at most {max_positions}")]
    PromptTooLong {
        prompt_len: usize,
        max_positions: usize,
    },
    #[error("prompt encodes to no tokens")]
    EmptyPrompt,
}

impl From<candle_core::Error> for EngineError {
    fn from(e: candle_core::Error) -> Self {
        EngineError::Model(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token was produced.
    Eos,
    /// The new-token budget or the model's context ran out.
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_new_tokens: usize,
    pub sampling_params: SamplingParams,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        max_new_tokens: usize,
        sampling_params: SamplingParams,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens,
            sampling_params,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Decoded new tokens, special tokens suppressed.
    pub generated_text: String,
    /// New token ids only; includes the stop token when one ended generation.
    pub generated_token_ids: Vec<u32>,
    pub prompt_len: usize,
    pub finish_reason: FinishReason,
}
