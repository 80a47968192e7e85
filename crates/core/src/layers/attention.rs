use candle_core::{DType, Result, Tensor};

/// Per-layer key/value history for one sequence, grown by concatenation
/// along the sequence axis. Layout: [b, kv_heads, seq, head_dim].
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    kv: Option<(Tensor, Tensor)>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached positions.
    pub fn len(&self) -> usize {
        self.kv
            .as_ref()
            .and_then(|(k, _)| k.dims().get(2).copied())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append new keys/values and return the full history.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match &self.kv {
            None => (k.contiguous()?, v.contiguous()?),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?.contiguous()?,
                Tensor::cat(&[prev_v, v], 2)?.contiguous()?,
            ),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn clear(&mut self) {
        self.kv = None;
    }
}

/// Grouped-query scaled dot-product attention over the full history.
///
/// q: [b, heads, q_len, head_dim]; k, v: [b, kv_heads, kv_len, head_dim].
/// Returns [b, q_len, heads * head_dim].
pub fn grouped_attention(
    q: &Tensor,
    k: Tensor,
    v: Tensor,
    attention_mask: Option<&Tensor>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Result<Tensor> {
    let (b_sz, _num_heads, q_len, _head_dim) = q.dims4()?;
    let dtype = q.dtype();

    let num_kv_groups = num_heads / num_kv_heads;
    let k = repeat_kv(k, num_kv_groups)?.contiguous()?;
    let v = repeat_kv(v, num_kv_groups)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.contiguous()?.matmul(&k.t()?)? * scale)?;
    let attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None => attn_weights,
    };
    // Softmax in f32 for bf16/f16 stability.
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights.to_dtype(DType::F32)?)?
        .to_dtype(dtype)?;
    let attn_output = attn_weights.matmul(&v)?;

    attn_output
        .transpose(1, 2)?
        .reshape((b_sz, q_len, num_heads * head_dim))
}

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}
