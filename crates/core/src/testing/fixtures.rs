use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::tokenizer::TokenizerWrapper;

use super::tiny_config::{tiny_llama_config, LLAMA3_CHAT_TEMPLATE};

/// Base model id written into adapter configs produced by [`write_tiny_adapter`].
pub const TINY_BASE_MODEL: &str = "tiny-llama";

/// Write a loadable zero-weight model directory matching [`tiny_llama_config`]:
/// config, tokenizer, tokenizer config with chat template, generation config
/// and a single `model.safetensors`.
pub fn write_tiny_model_dir(dir: &Path) -> anyhow::Result<()> {
    let cfg = tiny_llama_config();
    let config = serde_json::json!({
        "architectures": cfg.architectures,
        "hidden_size": cfg.hidden_size,
        "intermediate_size": cfg.intermediate_size,
        "num_attention_heads": cfg.num_attention_heads,
        "num_key_value_heads": cfg.num_kv_heads(),
        "num_hidden_layers": cfg.num_hidden_layers,
        "vocab_size": cfg.vocab_size,
        "max_position_embeddings": cfg.max_position_embeddings,
        "hidden_act": cfg.hidden_act,
        "rms_norm_eps": cfg.rms_norm_eps,
        "rope_theta": cfg.rope_theta,
        "tie_word_embeddings": cfg.tie_word_embeddings,
        "eos_token_id": 32,
        "torch_dtype": "float32",
    });
    std::fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config)?)?;

    TokenizerWrapper::for_testing(32).save(&dir.join("tokenizer.json"))?;

    let tokenizer_config = serde_json::json!({
        "bos_token": "<|begin_of_text|>",
        "eos_token": {"content": "<|eot_id|>", "special": true},
        "chat_template": LLAMA3_CHAT_TEMPLATE,
    });
    std::fs::write(
        dir.join("tokenizer_config.json"),
        serde_json::to_vec_pretty(&tokenizer_config)?,
    )?;

    std::fs::write(
        dir.join("generation_config.json"),
        r#"{"do_sample": false, "eos_token_id": [32]}"#,
    )?;

    let hidden = cfg.hidden_size;
    let q_out = cfg.num_attention_heads * cfg.head_dim();
    let kv_out = cfg.num_kv_heads() * cfg.head_dim();
    let inter = cfg.intermediate_size;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    let mut put = |name: String, shape: (usize, usize)| -> candle_core::Result<()> {
        tensors.insert(name, Tensor::zeros(shape, DType::F32, &Device::Cpu)?);
        Ok(())
    };
    put("model.embed_tokens.weight".into(), (cfg.vocab_size, hidden))?;
    put("lm_head.weight".into(), (cfg.vocab_size, hidden))?;
    for i in 0..cfg.num_hidden_layers {
        let p = format!("model.layers.{i}");
        put(format!("{p}.self_attn.q_proj.weight"), (q_out, hidden))?;
        put(format!("{p}.self_attn.k_proj.weight"), (kv_out, hidden))?;
        put(format!("{p}.self_attn.v_proj.weight"), (kv_out, hidden))?;
        put(format!("{p}.self_attn.o_proj.weight"), (hidden, q_out))?;
        put(format!("{p}.mlp.gate_proj.weight"), (inter, hidden))?;
        put(format!("{p}.mlp.up_proj.weight"), (inter, hidden))?;
        put(format!("{p}.mlp.down_proj.weight"), (hidden, inter))?;
    }
    for i in 0..cfg.num_hidden_layers {
        let p = format!("model.layers.{i}");
        tensors.insert(
            format!("{p}.input_layernorm.weight"),
            Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
        );
        tensors.insert(
            format!("{p}.post_attention_layernorm.weight"),
            Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
        );
    }
    tensors.insert(
        "model.norm.weight".into(),
        Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
    Ok(())
}

/// Write a PEFT adapter with rank-2 `q_proj`/`v_proj` pairs on the given
/// layer indices. Indices past the tiny model's depth produce modules the
/// model cannot attach.
pub fn write_tiny_adapter(dir: &Path, layers: &[usize]) -> anyhow::Result<()> {
    let cfg = tiny_llama_config();
    let rank = 2;
    let adapter_config = serde_json::json!({
        "peft_type": "LORA",
        "task_type": "CAUSAL_LM",
        "r": rank,
        "lora_alpha": 4,
        "lora_dropout": 0.1,
        "target_modules": ["q_proj", "v_proj"],
        "base_model_name_or_path": TINY_BASE_MODEL,
        "inference_mode": true,
    });
    std::fs::write(
        dir.join("adapter_config.json"),
        serde_json::to_vec_pretty(&adapter_config)?,
    )?;

    let hidden = cfg.hidden_size;
    let outputs = [
        ("q_proj", cfg.num_attention_heads * cfg.head_dim()),
        ("v_proj", cfg.num_kv_heads() * cfg.head_dim()),
    ];
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for &layer in layers {
        for (proj, out) in outputs {
            let p = format!("base_model.model.model.layers.{layer}.self_attn.{proj}");
            tensors.insert(
                format!("{p}.lora_A.weight"),
                Tensor::full(0.01f32, (rank, hidden), &Device::Cpu)?,
            );
            tensors.insert(
                format!("{p}.lora_B.weight"),
                Tensor::zeros((out, rank), DType::F32, &Device::Cpu)?,
            );
        }
    }
    candle_core::safetensors::save(&tensors, dir.join("adapter_model.safetensors"))?;
    Ok(())
}
