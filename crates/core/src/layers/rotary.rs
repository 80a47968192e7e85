use candle_core::{DType, Device, Result, Tensor};

use crate::config::RopeScaling;

pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::with_scaling(head_dim, max_seq_len, rope_theta, None, dtype, device)
    }

    /// Like [`RotaryEmbedding::new`], rescaling inverse frequencies when a
    /// `llama3` rope scaling block is given.
    pub fn with_scaling(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        scaling: Option<&RopeScaling>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut inv_freq = inverse_frequencies(head_dim, rope_theta);
        if let Some(scaling) = scaling.filter(|s| s.is_llama3()) {
            inv_freq = llama3_scale(&inv_freq, scaling);
        }
        let inv_freq: Vec<f32> = inv_freq.into_iter().map(|f| f as f32).collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// q, k: [b, heads, seq, head_dim]; positions start at `seqlen_offset`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, seqlen_offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = self.sin.narrow(0, seqlen_offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

fn inverse_frequencies(head_dim: usize, rope_theta: f64) -> Vec<f64> {
    (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / rope_theta.powf(i as f64 / head_dim as f64))
        .collect()
}

/// Llama 3.1 frequency-banded scaling: high frequencies kept, low
/// frequencies divided by `factor`, a linear blend in between.
fn llama3_scale(inv_freq: &[f64], scaling: &RopeScaling) -> Vec<f64> {
    let original = scaling.original_max_position_embeddings as f64;
    let low_freq_wavelen = original / scaling.low_freq_factor;
    let high_freq_wavelen = original / scaling.high_freq_factor;

    inv_freq
        .iter()
        .map(|&freq| {
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scaling.factor
            } else {
                let smooth = (original / wavelen - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                (1.0 - smooth) * freq / scaling.factor + smooth * freq
            }
        })
        .collect()
}
