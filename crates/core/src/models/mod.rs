pub mod llama;

pub use llama::{LlamaForCausalLM, LoraAttachment};

use candle_core::Result;
use candle_nn::VarBuilder;

use crate::config::ModelConfig;

/// Architectures the loader can build.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &["LlamaForCausalLM"];

/// Build a model from its config, checking the declared architecture.
pub fn from_config(cfg: &ModelConfig, vb: VarBuilder) -> Result<LlamaForCausalLM> {
    if let Some(arch) = cfg
        .architectures
        .iter()
        .find(|a| !SUPPORTED_ARCHITECTURES.contains(&a.as_str()))
    {
        candle_core::bail!("unsupported architecture '{arch}'");
    }
    cfg.validate().map_err(candle_core::Error::Msg)?;
    LlamaForCausalLM::new(cfg, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_llama_config;
    use candle_core::{DType, Device};

    #[test]
    fn test_from_config_rejects_other_architectures() {
        let mut cfg = tiny_llama_config();
        cfg.architectures = vec!["Qwen2ForCausalLM".to_string()];
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = from_config(&cfg, vb).err().unwrap();
        assert!(err.to_string().contains("Qwen2ForCausalLM"));
    }

    #[test]
    fn test_from_config_builds_tiny_llama() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(from_config(&tiny_llama_config(), vb).is_ok());
    }
}
