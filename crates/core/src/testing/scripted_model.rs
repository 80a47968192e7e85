use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};

use crate::engine::ModelForward;

/// One recorded `forward` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardCall {
    pub input_len: usize,
    pub seqlen_offset: usize,
}

/// Emits a fixed token script regardless of input: the n-th forward since
/// the last cache reset returns one-hot logits for `script[n]`, repeating
/// the final entry once the script runs out.
pub struct ScriptedModel {
    vocab_size: usize,
    script: Vec<u32>,
    step: usize,
    max_positions: usize,
    calls: Arc<Mutex<Vec<ForwardCall>>>,
    device: Device,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, script: Vec<u32>) -> Self {
        Self {
            vocab_size,
            script,
            step: 0,
            max_positions: 4096,
            calls: Arc::new(Mutex::new(Vec::new())),
            device: Device::Cpu,
        }
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    /// Shared log of forward calls, readable after the model moves into an engine.
    pub fn calls(&self) -> Arc<Mutex<Vec<ForwardCall>>> {
        Arc::clone(&self.calls)
    }
}

impl ModelForward for ScriptedModel {
    fn forward(
        &mut self,
        input_ids: &Tensor,
        seqlen_offset: usize,
    ) -> candle_core::Result<Tensor> {
        let (_b, input_len) = input_ids.dims2()?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ForwardCall {
                input_len,
                seqlen_offset,
            });
        }

        let idx = self.step.min(self.script.len().saturating_sub(1));
        self.step += 1;
        let mut logits = vec![0f32; self.vocab_size];
        if let Some(&token) = self.script.get(idx) {
            logits[token as usize] = 1.0;
        }
        Tensor::from_vec(logits, (1, self.vocab_size), &self.device)?.to_dtype(DType::F32)
    }

    fn clear_kv_cache(&mut self) {
        self.step = 0;
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_script_and_repeats_last() {
        let mut model = ScriptedModel::new(4, vec![2, 3]);
        let ids = Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap();
        let picks: Vec<u32> = (0..3)
            .map(|_| {
                model
                    .forward(&ids, 0)
                    .unwrap()
                    .squeeze(0)
                    .unwrap()
                    .argmax(0)
                    .unwrap()
                    .to_scalar::<u32>()
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![2, 3, 3]);
        assert_eq!(model.calls().lock().unwrap().len(), 3);
    }
}
