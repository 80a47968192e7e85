use std::sync::Arc;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::{causal_mask, grouped_attention, KvCache, RotaryEmbedding, SwiGluMlp};
use crate::lora::{LinearWithLora, LoraModel};

// ─── Attention ───────────────────────────────────────────────────────────────

struct LlamaAttention {
    q_proj: LinearWithLora,
    k_proj: LinearWithLora,
    v_proj: LinearWithLora,
    o_proj: LinearWithLora,
    rotary_emb: Arc<RotaryEmbedding>,
    kv_cache: KvCache,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl LlamaAttention {
    fn new(cfg: &ModelConfig, rotary_emb: Arc<RotaryEmbedding>, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();

        let q_proj = LinearWithLora::new(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj =
            LinearWithLora::new(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj =
            LinearWithLora::new(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = LinearWithLora::new(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            kv_cache: KvCache::new(),
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn projection_mut(&mut self, name: &str) -> Option<&mut LinearWithLora> {
        match name {
            "q_proj" => Some(&mut self.q_proj),
            "k_proj" => Some(&mut self.k_proj),
            "v_proj" => Some(&mut self.v_proj),
            "o_proj" => Some(&mut self.o_proj),
            _ => None,
        }
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;

        let q = self.q_proj.forward(xs)?;
        let k = self.k_proj.forward(xs)?;
        let v = self.v_proj.forward(xs)?;

        let q = q
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = self.rotary_emb.apply(&q, &k, seqlen_offset)?;
        let (k, v) = self.kv_cache.append(&k, &v)?;

        let attn_output = grouped_attention(
            &q,
            k,
            v,
            attention_mask,
            self.num_heads,
            self.num_kv_heads,
            self.head_dim,
        )?;

        attn_output.apply(&self.o_proj)
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

struct LlamaDecoderLayer {
    self_attn: LlamaAttention,
    mlp: SwiGluMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    fn new(cfg: &ModelConfig, rotary_emb: Arc<RotaryEmbedding>, vb: VarBuilder) -> Result<Self> {
        let self_attn = LlamaAttention::new(cfg, rotary_emb, vb.pp("self_attn"))?;
        let mlp = SwiGluMlp::new(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp"))?;
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, attention_mask, seqlen_offset)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = self
            .post_attention_layernorm
            .forward(&xs)?
            .apply(&self.mlp)?;
        residual + xs
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

/// Outcome of attaching an adapter to the model.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoraAttachment {
    /// Projections that received an adapter.
    pub applied: usize,
    /// Adapter modules with no matching projection.
    pub skipped: Vec<String>,
}

pub struct LlamaForCausalLM {
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    max_position_embeddings: usize,
    device: Device,
    dtype: DType,
}

impl LlamaForCausalLM {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;

        // One sin/cos table for every layer.
        let rotary_emb = Arc::new(RotaryEmbedding::with_scaling(
            cfg.head_dim(),
            cfg.max_position_embeddings,
            cfg.rope_theta,
            cfg.rope_scaling.as_ref(),
            vb.dtype(),
            vb.device(),
        )?);

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_l = vb_m.pp("layers");
        for i in 0..cfg.num_hidden_layers {
            layers.push(LlamaDecoderLayer::new(cfg, rotary_emb.clone(), vb_l.pp(i))?);
        }

        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;

        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            max_position_embeddings: cfg.max_position_embeddings,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Attach every adapter module of `lora` to its projection
    /// (`layers.{i}.self_attn.{q,k,v,o}_proj`, `layers.{i}.mlp.{gate,up,down}_proj`).
    ///
    /// Modules the model does not have are reported in `skipped`; an adapter
    /// whose dimensions do not fit its projection is an error.
    pub fn register_lora(&mut self, lora: &LoraModel) -> Result<LoraAttachment> {
        let mut attachment = LoraAttachment::default();

        for module in lora.module_names() {
            let Some(adapter) = lora.get_adapter(module) else {
                continue;
            };
            match self.projection_mut(module) {
                Some(proj) => {
                    proj.set_adapter(adapter.clone())
                        .map_err(|e| candle_core::Error::Msg(format!("{module}: {e}")))?;
                    attachment.applied += 1;
                }
                None => attachment.skipped.push(module.to_string()),
            }
        }

        Ok(attachment)
    }

    fn projection_mut(&mut self, module: &str) -> Option<&mut LinearWithLora> {
        let mut parts = module.split('.');
        if parts.next()? != "layers" {
            return None;
        }
        let idx: usize = parts.next()?.parse().ok()?;
        let block = parts.next()?;
        let proj = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let layer = self.layers.get_mut(idx)?;
        match block {
            "self_attn" => layer.self_attn.projection_mut(proj),
            "mlp" => layer.mlp.projection_mut(proj),
            _ => None,
        }
    }

    /// Run `input_ids` [b, seq] at positions starting from `seqlen_offset`
    /// and return logits for the last position, [b, vocab].
    pub fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let (_b_size, seq_len) = input_ids.dims2()?;
        let attention_mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?)
        };

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, attention_mask.as_ref(), seqlen_offset)?;
        }
        let xs = xs.narrow(1, seq_len - 1, 1)?;
        let xs = self.norm.forward(&xs)?;
        xs.apply(&self.lm_head)?.squeeze(1)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.kv_cache.clear();
        }
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl crate::engine::ModelForward for LlamaForCausalLM {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        self.forward(input_ids, seqlen_offset)
    }

    fn clear_kv_cache(&mut self) {
        self.clear_kv_cache()
    }

    fn max_positions(&self) -> usize {
        self.max_position_embeddings
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::LoraAdapter;
    use crate::testing::tiny_llama_config;

    fn zero_model(cfg: &ModelConfig) -> LlamaForCausalLM {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        LlamaForCausalLM::new(cfg, vb).unwrap()
    }

    #[test]
    fn test_prefill_then_decode_shapes() {
        let cfg = tiny_llama_config();
        let mut model = zero_model(&cfg);

        let prompt = Tensor::new(&[[1u32, 5, 7, 9]], &Device::Cpu).unwrap();
        let logits = model.forward(&prompt, 0).unwrap();
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
        assert_eq!(model.layers[0].self_attn.kv_cache.len(), 4);

        let next = Tensor::new(&[[3u32]], &Device::Cpu).unwrap();
        let logits = model.forward(&next, 4).unwrap();
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
        assert_eq!(model.layers[0].self_attn.kv_cache.len(), 5);

        model.clear_kv_cache();
        assert!(model.layers.iter().all(|l| l.self_attn.kv_cache.is_empty()));
    }

    #[test]
    fn test_layers_share_rotary_table() {
        let cfg = tiny_llama_config();
        let model = zero_model(&cfg);
        let first = &model.layers[0].self_attn.rotary_emb;
        assert!(cfg.num_hidden_layers > 1);
        assert!(model
            .layers
            .iter()
            .all(|layer| Arc::ptr_eq(first, &layer.self_attn.rotary_emb)));
    }

    #[test]
    fn test_tied_embeddings_and_gqa() {
        let mut cfg = tiny_llama_config();
        cfg.tie_word_embeddings = true;
        cfg.num_attention_heads = 8;
        cfg.num_key_value_heads = Some(2);
        let mut model = zero_model(&cfg);

        let ids = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();
        assert_eq!(model.forward(&ids, 0).unwrap().dims(), &[1, cfg.vocab_size]);
    }

    #[test]
    fn test_register_lora_matches_and_skips() {
        let cfg = tiny_llama_config();
        let mut model = zero_model(&cfg);
        let device = Device::Cpu;
        let hidden = cfg.hidden_size;

        let mut lora = LoraModel::new("test", 4, 8.0);
        let a = Tensor::zeros((4, hidden), DType::F32, &device).unwrap();
        let b = Tensor::zeros((hidden, 4), DType::F32, &device).unwrap();
        lora.add_adapter("layers.0.self_attn.q_proj", LoraAdapter::new(a.clone(), b.clone(), 4, 2.0));
        lora.add_adapter("layers.1.self_attn.o_proj", LoraAdapter::new(a.clone(), b.clone(), 4, 2.0));
        lora.add_adapter("layers.99.self_attn.q_proj", LoraAdapter::new(a.clone(), b.clone(), 4, 2.0));
        lora.add_adapter("layers.0.self_attn.rotary", LoraAdapter::new(a, b, 4, 2.0));

        let attachment = model.register_lora(&lora).unwrap();
        assert_eq!(attachment.applied, 2);
        assert_eq!(
            attachment.skipped,
            vec!["layers.0.self_attn.rotary", "layers.99.self_attn.q_proj"]
        );
        assert!(model.layers[0].self_attn.q_proj.has_adapter());
        assert!(!model.layers[0].self_attn.k_proj.has_adapter());
    }

    #[test]
    fn test_register_lora_dimension_mismatch() {
        let cfg = tiny_llama_config();
        let mut model = zero_model(&cfg);
        let device = Device::Cpu;

        let mut lora = LoraModel::new("bad", 4, 8.0);
        let a = Tensor::zeros((4, cfg.hidden_size + 1), DType::F32, &device).unwrap();
        let b = Tensor::zeros((cfg.intermediate_size, 4), DType::F32, &device).unwrap();
        lora.add_adapter("layers.0.mlp.up_proj", LoraAdapter::new(a, b, 4, 2.0));

        assert!(model.register_lora(&lora).is_err());
    }

    #[test]
    fn test_zero_weights_give_zero_logits() {
        let cfg = tiny_llama_config();
        let mut model = zero_model(&cfg);
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let logits: Vec<f32> = model.forward(&ids, 0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(logits.iter().all(|&v| v == 0.0));
    }
}
