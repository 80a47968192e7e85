//! The chat pipeline shared by every transport: format → generate → decode.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::engine::{EngineError, GenerationRequest, TextGenerator};
use crate::prompt::PromptFormatter;
use crate::sampling::SamplingParams;

/// Default cap on generated tokens per reply.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 512;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("prompt template failed: {0}")]
    Template(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Explicit context object handed to each transport: everything needed to
/// answer one user message, built once at startup.
pub struct ChatService {
    formatter: PromptFormatter,
    generator: Arc<dyn TextGenerator>,
    max_new_tokens: usize,
    sampling_params: SamplingParams,
}

impl ChatService {
    pub fn new(formatter: PromptFormatter, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            formatter,
            generator,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            sampling_params: SamplingParams::greedy(),
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling_params(mut self, sampling_params: SamplingParams) -> Self {
        self.sampling_params = sampling_params;
        self
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    /// Answer one user message in character. Blocks for the whole generation.
    pub fn reply(&self, user_text: &str) -> Result<String, ChatError> {
        let started = Instant::now();
        let prompt = self
            .formatter
            .render(user_text)
            .map_err(|e| ChatError::Template(e.to_string()))?;

        let request = GenerationRequest::new(
            prompt,
            self.max_new_tokens,
            self.sampling_params.clone(),
        );
        let result = self.generator.generate(&request)?;

        info!(
            input_chars = user_text.chars().count(),
            generated_tokens = result.generated_token_ids.len(),
            finish_reason = ?result.finish_reason,
            latency_ms = started.elapsed().as_millis() as u64,
            "reply generated"
        );
        Ok(result.generated_text)
    }
}
