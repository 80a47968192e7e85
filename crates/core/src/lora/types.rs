//! LoRA adapter configuration and weights.

use std::collections::HashMap;

use candle_core::Tensor;
use serde::Deserialize;

/// `target_modules` is either a list of projection names or a single
/// string (a regex or a keyword such as `all-linear` in PEFT).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

impl TargetModules {
    pub fn names(&self) -> Vec<String> {
        match self {
            TargetModules::List(names) => names.clone(),
            TargetModules::Pattern(p) => vec![p.clone()],
        }
    }
}

/// Configuration from adapter_config.json (PEFT format).
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    /// LoRA rank (r parameter).
    pub r: usize,
    /// Scaling parameter (alpha).
    pub lora_alpha: f32,
    #[serde(default)]
    pub target_modules: TargetModules,
    /// Parsed for completeness; inference never applies dropout.
    #[serde(default)]
    pub lora_dropout: f32,
    /// Bias handling: "none", "all", "lora_only".
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Use rank-stabilized LoRA scaling.
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_bias() -> String {
    "none".to_string()
}

impl LoraConfig {
    /// Whether training also updated bias terms, which are not applied here.
    pub fn trains_bias(&self) -> bool {
        self.bias != "none"
    }

    /// For standard LoRA: scale = alpha / rank
    /// For rsLoRA: scale = alpha / sqrt(rank)
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }
}

/// LoRA weights for a single projection.
///
/// ```text
/// output = base_output + scale * (x @ lora_a.T @ lora_b.T)
/// ```
///
/// - lora_a: [rank, input_dim]
/// - lora_b: [output_dim, rank]
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub lora_a: Tensor,
    pub lora_b: Tensor,
    pub rank: usize,
    pub scale: f32,
}

impl LoraAdapter {
    pub fn new(lora_a: Tensor, lora_b: Tensor, rank: usize, scale: f32) -> Self {
        Self {
            lora_a,
            lora_b,
            rank,
            scale,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.lora_a.dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.lora_b.dims()[0]
    }
}

/// A loaded adapter: one `LoraAdapter` per targeted projection, keyed by
/// module path (e.g. `layers.0.self_attn.q_proj`).
#[derive(Debug)]
pub struct LoraModel {
    pub name: String,
    pub rank: usize,
    pub alpha: f32,
    pub adapters: HashMap<String, LoraAdapter>,
    pub target_modules: Vec<String>,
}

impl LoraModel {
    pub fn new(name: impl Into<String>, rank: usize, alpha: f32) -> Self {
        Self {
            name: name.into(),
            rank,
            alpha,
            adapters: HashMap::new(),
            target_modules: Vec::new(),
        }
    }

    pub fn get_adapter(&self, module_name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(module_name)
    }

    pub fn add_adapter(&mut self, module_name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(module_name.into(), adapter);
    }

    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// Module paths in a stable order, for logging.
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
