//! Standard autoregressive generation on a single model.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::sampling::{self, SamplerState};
use crate::tokenizer::TokenizerWrapper;

use super::model_forward::ModelForward;
use super::types::{EngineError, FinishReason, GenerationRequest, GenerationResult};

/// Anything that turns a rendered prompt into a completion.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, EngineError>;
}

/// Owns the model and serializes generations on it: the KV cache is
/// per-sequence state, so only one request runs at a time.
pub struct LlmEngine<M: ModelForward> {
    model: Mutex<M>,
    tokenizer: Arc<TokenizerWrapper>,
    stop_token_ids: Vec<u32>,
}

impl<M: ModelForward> LlmEngine<M> {
    pub fn new(model: M, tokenizer: Arc<TokenizerWrapper>, stop_token_ids: Vec<u32>) -> Self {
        Self {
            model: Mutex::new(model),
            tokenizer,
            stop_token_ids,
        }
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    fn run(
        &self,
        model: &mut M,
        prompt_ids: &[u32],
        request: &GenerationRequest,
    ) -> Result<(Vec<u32>, FinishReason), EngineError> {
        let prompt_len = prompt_ids.len();
        let budget = request
            .max_new_tokens
            .min(model.max_positions().saturating_sub(prompt_len));
        let device = model.device().clone();
        let params = &request.sampling_params;
        let mut sampler_state = SamplerState::new(params.seed);

        model.clear_kv_cache();

        let mut sequence = prompt_ids.to_vec();
        let mut input = prompt_ids.to_vec();
        let mut seqlen_offset = 0;
        let mut finish_reason = FinishReason::Length;

        for _ in 0..budget {
            let input_ids = Tensor::new(input.as_slice(), &device)?.unsqueeze(0)?;
            let logits = model.forward(&input_ids, seqlen_offset)?;
            let logits: Vec<f32> = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()?;
            seqlen_offset += input.len();

            let next = sampling::sample(&logits, params, &sequence, &mut sampler_state);
            sequence.push(next);
            if self.stop_token_ids.contains(&next) {
                finish_reason = FinishReason::Eos;
                break;
            }
            input = vec![next];
        }

        // Keep only what follows the prompt.
        let generated = sequence.split_off(prompt_len);
        Ok((generated, finish_reason))
    }
}

impl<M: ModelForward> TextGenerator for LlmEngine<M> {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, EngineError> {
        let started = Instant::now();
        let prompt_ids = self
            .tokenizer
            .encode(&request.prompt)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        if prompt_ids.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| EngineError::Model("model lock poisoned".to_string()))?;

        let max_positions = model.max_positions();
        if prompt_ids.len() >= max_positions {
            return Err(EngineError::PromptTooLong {
                prompt_len: prompt_ids.len(),
                max_positions,
            });
        }

        let (generated_token_ids, finish_reason) =
            self.run(&mut *model, &prompt_ids, request)?;
        drop(model);

        let generated_text = self
            .tokenizer
            .decode(&generated_token_ids)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        debug!(
            prompt_tokens = prompt_ids.len(),
            generated_tokens = generated_token_ids.len(),
            finish_reason = ?finish_reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );

        Ok(GenerationResult {
            generated_text,
            generated_token_ids,
            prompt_len: prompt_ids.len(),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingParams;
    use crate::testing::ScriptedModel;

    const EOT: u32 = 32;

    fn engine(model: ScriptedModel) -> LlmEngine<ScriptedModel> {
        let tokenizer = Arc::new(TokenizerWrapper::for_testing(32));
        LlmEngine::new(model, tokenizer, vec![EOT])
    }

    fn greedy(prompt: &str, max_new_tokens: usize) -> GenerationRequest {
        GenerationRequest::new(prompt, max_new_tokens, SamplingParams::greedy())
    }

    #[test]
    fn stops_on_stop_token_and_strips_prompt() {
        let model = ScriptedModel::new(33, vec![5, 6, EOT, 7]);
        let calls = model.calls();
        let engine = engine(model);

        let result = engine.generate(&greedy("t1 t2 t3", 16)).unwrap();
        assert_eq!(result.generated_token_ids, vec![5, 6, EOT]);
        assert_eq!(result.generated_text, "t5 t6");
        assert_eq!(result.prompt_len, 3);
        assert_eq!(result.finish_reason, FinishReason::Eos);

        // Prefill with the whole prompt, then one token per step.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!((calls[0].input_len, calls[0].seqlen_offset), (3, 0));
        assert_eq!((calls[1].input_len, calls[1].seqlen_offset), (1, 3));
        assert_eq!((calls[2].input_len, calls[2].seqlen_offset), (1, 4));
    }

    #[test]
    fn stops_at_max_new_tokens() {
        let engine = engine(ScriptedModel::new(33, vec![4, 4, 4, 4, 4]));
        let result = engine.generate(&greedy("t1", 2)).unwrap();
        assert_eq!(result.generated_token_ids, vec![4, 4]);
        assert_eq!(result.finish_reason, FinishReason::Length);
    }

    #[test]
    fn stops_at_model_context() {
        let engine = engine(ScriptedModel::new(33, vec![4; 10]).with_max_positions(5));
        let result = engine.generate(&greedy("t1 t2 t3", 512)).unwrap();
        assert_eq!(result.generated_token_ids.len(), 2);
        assert_eq!(result.finish_reason, FinishReason::Length);
    }

    #[test]
    fn rejects_prompt_at_context_limit() {
        let engine = engine(ScriptedModel::new(33, vec![4]).with_max_positions(3));
        let err = engine.generate(&greedy("t1 t2 t3", 8)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PromptTooLong {
                prompt_len: 3,
                max_positions: 3
            }
        ));
    }

    #[test]
    fn rejects_empty_prompt() {
        let engine = engine(ScriptedModel::new(33, vec![4]));
        assert!(matches!(
            engine.generate(&greedy("", 8)).unwrap_err(),
            EngineError::EmptyPrompt
        ));
    }

    #[test]
    fn cache_is_reset_between_generations() {
        let model = ScriptedModel::new(33, vec![5, EOT]);
        let calls = model.calls();
        let engine = engine(model);

        let first = engine.generate(&greedy("t1 t2", 8)).unwrap();
        let second = engine.generate(&greedy("t1 t2", 8)).unwrap();
        assert_eq!(first.generated_text, second.generated_text);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2].seqlen_offset, 0);
    }
}
