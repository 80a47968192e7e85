use crate::config::{ModelConfig, TokenIds};
use crate::tokenizer::ChatTemplateEngine;

/// Tiny Llama-like config: 2 layers, 64 hidden, 4 heads over 2 KV heads,
/// vocabulary sized for `TokenizerWrapper::for_testing(32)` (33 ids).
pub fn tiny_llama_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["LlamaForCausalLM".to_string()],
        hidden_size: 64,
        num_attention_heads: 4,
        num_key_value_heads: Some(2),
        num_hidden_layers: 2,
        intermediate_size: 128,
        vocab_size: 33,
        max_position_embeddings: 256,
        head_dim: None,
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-5,
        rope_theta: 500000.0,
        rope_scaling: None,
        tie_word_embeddings: false,
        bos_token_id: None,
        eos_token_id: Some(TokenIds::Single(32)),
        torch_dtype: Some("float32".to_string()),
        extra: serde_json::Map::new(),
    }
}

/// Llama 3 instruct layout without the date/tool preamble.
pub const LLAMA3_CHAT_TEMPLATE: &str = r"{{- bos_token }}{%- for message in messages %}{{- '<|start_header_id|>' + message['role'] + '<|end_header_id|>\n\n' + message['content'] + '<|eot_id|>' }}{%- endfor %}{%- if add_generation_prompt %}{{- '<|start_header_id|>assistant<|end_header_id|>\n\n' }}{%- endif %}";

pub fn test_chat_template() -> ChatTemplateEngine {
    ChatTemplateEngine::new(
        LLAMA3_CHAT_TEMPLATE.to_string(),
        "<|begin_of_text|>".to_string(),
        "<|eot_id|>".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_llama_config_is_valid() {
        let config = tiny_llama_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.num_attention_heads / config.num_kv_heads(), 2);
        assert_eq!(config.eos_token_ids(), vec![32]);
    }
}
