use candle_core::{Device, Tensor};

/// A causal LM that keeps its own KV cache for the sequence in flight.
pub trait ModelForward: Send + 'static {
    /// Run `input_ids` [1, seq] at positions starting from `seqlen_offset`
    /// and return logits for the last position, [1, vocab].
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize)
        -> candle_core::Result<Tensor>;

    /// Drop all cached keys/values before a new sequence.
    fn clear_kv_cache(&mut self);

    /// Largest position the model can attend to.
    fn max_positions(&self) -> usize;

    fn device(&self) -> &Device;
}
