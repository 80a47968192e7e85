use serde::Deserialize;

/// One id or a list of ids, as written in HuggingFace configs
/// (`"eos_token_id": 2` or `"eos_token_id": [128001, 128008, 128009]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// `rope_scaling` block. Only the `llama3` frequency-banded scheme changes
/// the inverse frequencies; other types are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    #[serde(default, alias = "type")]
    pub rope_type: Option<String>,
    #[serde(default = "default_rope_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position")]
    pub original_max_position_embeddings: usize,
}

fn default_rope_factor() -> f64 {
    8.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position() -> usize {
    8192
}

impl RopeScaling {
    pub fn is_llama3(&self) -> bool {
        self.rope_type.as_deref() == Some("llama3")
    }
}

/// Decoder-only model configuration read from `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_max_position")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub torch_dtype: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_max_position() -> usize {
    4096
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

impl ModelConfig {
    /// KV heads, falling back to plain multi-head attention.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    /// Rejects shapes the Llama implementation cannot build.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_attention_heads == 0 || self.hidden_size == 0 {
            return Err("hidden_size and num_attention_heads must be non-zero".to_string());
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(format!(
                "num_attention_heads ({}) is not a multiple of num_key_value_heads ({})",
                self.num_attention_heads,
                self.num_kv_heads()
            ));
        }
        if self.hidden_act != "silu" {
            return Err(format!("unsupported hidden_act '{}'", self.hidden_act));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["LlamaForCausalLM".to_string()],
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            num_hidden_layers: 32,
            intermediate_size: 14336,
            vocab_size: 128256,
            max_position_embeddings: 131072,
            head_dim: None,
            hidden_act: "silu".to_string(),
            rms_norm_eps: 1e-5,
            rope_theta: 500000.0,
            rope_scaling: None,
            tie_word_embeddings: false,
            bos_token_id: Some(128000),
            eos_token_id: Some(TokenIds::Single(128009)),
            torch_dtype: Some("bfloat16".to_string()),
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLAMA31_8B_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "attention_bias": false,
        "attention_dropout": 0.0,
        "bos_token_id": 128000,
        "eos_token_id": [128001, 128008, 128009],
        "hidden_act": "silu",
        "hidden_size": 4096,
        "initializer_range": 0.02,
        "intermediate_size": 14336,
        "max_position_embeddings": 131072,
        "mlp_bias": false,
        "model_type": "llama",
        "num_attention_heads": 32,
        "num_hidden_layers": 32,
        "num_key_value_heads": 8,
        "pretraining_tp": 1,
        "rms_norm_eps": 1e-05,
        "rope_scaling": {
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 8192,
            "rope_type": "llama3"
        },
        "rope_theta": 500000.0,
        "tie_word_embeddings": false,
        "torch_dtype": "bfloat16",
        "transformers_version": "4.42.3",
        "use_cache": true,
        "vocab_size": 128256
    }"#;

    #[test]
    fn parse_llama31_8b_config() {
        let config: ModelConfig =
            serde_json::from_str(LLAMA31_8B_CONFIG).expect("failed to parse config");

        assert_eq!(config.architectures, vec!["LlamaForCausalLM"]);
        assert_eq!(config.hidden_size, 4096);
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.eos_token_ids(), vec![128001, 128008, 128009]);
        assert_eq!(config.rope_theta, 500000.0);
        assert!(config.rope_scaling.as_ref().unwrap().is_llama3());
        assert!(!config.tie_word_embeddings);
        assert!(config.extra.contains_key("model_type"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn single_eos_and_missing_kv_heads() {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "intermediate_size": 128,
                "vocab_size": 256,
                "eos_token_id": 2
            }"#,
        )
        .unwrap();

        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.eos_token_ids(), vec![2]);
        assert!(config.rope_scaling.is_none());
    }

    #[test]
    fn validate_rejects_uneven_gqa() {
        let config = ModelConfig {
            num_attention_heads: 6,
            num_key_value_heads: Some(4),
            hidden_size: 48,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
