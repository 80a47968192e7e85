//! LoRA adapter loading from PEFT directories.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use super::types::{LoraAdapter, LoraConfig, LoraModel};

#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("adapter config not found at {0}")]
    ConfigNotFound(String),
    #[error("adapter weights not found in {0}")]
    WeightsNotFound(String),
    #[error("failed to parse adapter config: {0}")]
    ConfigParse(String),
    #[error("failed to load adapter weights: {0}")]
    WeightsLoad(String),
    #[error("mismatched lora_A and lora_B shapes for {module}: a={a_shape:?}, b={b_shape:?}")]
    ShapeMismatch {
        module: String,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
    },
    #[error("missing lora_A or lora_B for module {0}")]
    IncompleteAdapter(String),
    #[error("adapter at {0} contains no LoRA tensors")]
    Empty(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Loads adapters from directories containing:
/// - `adapter_config.json`: PEFT configuration
/// - `adapter_model.safetensors` or `adapter_model.bin`: weights
pub struct LoraLoader {
    device: Device,
    dtype: DType,
}

impl LoraLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn load(
        &self,
        adapter_path: impl AsRef<Path>,
        name: impl Into<String>,
    ) -> Result<LoraModel, LoraLoadError> {
        let path = adapter_path.as_ref();
        let config = load_config(path)?;
        let weights = self.load_weights(path)?;
        if weights.is_empty() {
            return Err(LoraLoadError::Empty(path.display().to_string()));
        }
        build_model(name.into(), &config, weights)
    }

    fn load_weights(&self, path: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let safetensors_path = path.join("adapter_model.safetensors");
        if safetensors_path.exists() {
            let tensors = candle_core::safetensors::load(&safetensors_path, &self.device)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            return self.convert_all(tensors);
        }

        let bin_path = path.join("adapter_model.bin");
        if bin_path.exists() {
            let tensors = candle_core::pickle::read_all(&bin_path)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            return self.convert_all(tensors);
        }

        Err(LoraLoadError::WeightsNotFound(path.display().to_string()))
    }

    /// Move every tensor to the loader's device and dtype.
    fn convert_all(
        &self,
        tensors: impl IntoIterator<Item = (String, Tensor)>,
    ) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let mut result = HashMap::new();
        for (name, tensor) in tensors {
            let tensor = tensor
                .to_device(&self.device)
                .and_then(|t| t.to_dtype(self.dtype))
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            result.insert(name, tensor);
        }
        Ok(result)
    }
}

pub fn load_config(path: &Path) -> Result<LoraConfig, LoraLoadError> {
    let config_path = path.join("adapter_config.json");
    if !config_path.exists() {
        return Err(LoraLoadError::ConfigNotFound(
            config_path.display().to_string(),
        ));
    }

    let config_str = std::fs::read_to_string(&config_path)?;
    serde_json::from_str(&config_str).map_err(|e| LoraLoadError::ConfigParse(e.to_string()))
}

/// Pair up `lora_A`/`lora_B` tensors per module and check their shapes.
fn build_model(
    name: String,
    config: &LoraConfig,
    weights: HashMap<String, Tensor>,
) -> Result<LoraModel, LoraLoadError> {
    let mut model = LoraModel::new(name, config.r, config.lora_alpha);
    model.target_modules = config.target_modules.names();
    let scale = config.scaling();

    for (module_name, mut tensors) in group_weights_by_module(weights) {
        let (Some(lora_a), Some(lora_b)) = (tensors.remove("lora_A"), tensors.remove("lora_B"))
        else {
            return Err(LoraLoadError::IncompleteAdapter(module_name));
        };

        // PEFT layout: lora_A [rank, in], lora_B [out, rank].
        let a_dims = lora_a.dims();
        let b_dims = lora_b.dims();
        if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[0] != b_dims[1] {
            return Err(LoraLoadError::ShapeMismatch {
                module: module_name,
                a_shape: a_dims.to_vec(),
                b_shape: b_dims.to_vec(),
            });
        }

        let rank = a_dims[0];
        model.add_adapter(module_name, LoraAdapter::new(lora_a, lora_b, rank, scale));
    }

    Ok(model)
}

fn group_weights_by_module(
    weights: HashMap<String, Tensor>,
) -> HashMap<String, HashMap<&'static str, Tensor>> {
    let mut grouped: HashMap<String, HashMap<&'static str, Tensor>> = HashMap::new();

    for (full_name, tensor) in weights {
        match parse_weight_name(&full_name) {
            Some((module_path, kind)) => {
                grouped.entry(module_path).or_default().insert(kind, tensor);
            }
            None => tracing::debug!(tensor = %full_name, "ignoring non-LoRA tensor in adapter"),
        }
    }

    grouped
}

/// Split a PEFT tensor name into module path and `lora_A`/`lora_B`.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// → `("layers.0.self_attn.q_proj", "lora_A")`
pub fn parse_weight_name(name: &str) -> Option<(String, &'static str)> {
    let mut name = name;
    loop {
        let stripped = name
            .strip_prefix("base_model.")
            .or_else(|| name.strip_prefix("model."));
        match stripped {
            Some(rest) => name = rest,
            None => break,
        }
    }

    let name = name.strip_suffix(".weight").unwrap_or(name);

    for (marker, kind) in [
        (".lora_A", "lora_A"),
        (".lora_a", "lora_A"),
        (".lora_B", "lora_B"),
        (".lora_b", "lora_B"),
    ] {
        if let Some(pos) = name.rfind(marker) {
            return Some((name[..pos].to_string(), kind));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::types::TargetModules;

    fn config() -> LoraConfig {
        serde_json::from_str(r#"{"r": 8, "lora_alpha": 32, "target_modules": ["q_proj"]}"#)
            .unwrap()
    }

    fn zeros(shape: (usize, usize)) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_parse_weight_name_peft_causal_lm() {
        let (module, kind) =
            parse_weight_name("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight")
                .unwrap();
        assert_eq!(module, "layers.0.self_attn.q_proj");
        assert_eq!(kind, "lora_A");

        let (module, kind) =
            parse_weight_name("base_model.model.layers.5.mlp.down_proj.lora_B.weight").unwrap();
        assert_eq!(module, "layers.5.mlp.down_proj");
        assert_eq!(kind, "lora_B");
    }

    #[test]
    fn test_parse_weight_name_variants() {
        let (module, kind) = parse_weight_name("model.layers.0.mlp.gate_proj.lora_A.weight").unwrap();
        assert_eq!(module, "layers.0.mlp.gate_proj");
        assert_eq!(kind, "lora_A");

        let (module, kind) = parse_weight_name("layers.0.self_attn.o_proj.lora_b.weight").unwrap();
        assert_eq!(module, "layers.0.self_attn.o_proj");
        assert_eq!(kind, "lora_B");
    }

    #[test]
    fn test_parse_weight_name_invalid() {
        assert!(parse_weight_name("layers.0.self_attn.q_proj.weight").is_none());
        assert!(parse_weight_name("some_other_tensor").is_none());
    }

    #[test]
    fn test_build_model_pairs_and_scales() {
        let mut weights = HashMap::new();
        weights.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
            zeros((8, 64)),
        );
        weights.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
            zeros((64, 8)),
        );
        weights.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_A.weight".to_string(),
            zeros((8, 64)),
        );
        weights.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_B.weight".to_string(),
            zeros((16, 8)),
        );

        let model = build_model("huanhuan".into(), &config(), weights).unwrap();
        assert_eq!(model.num_adapters(), 2);
        let k = model.get_adapter("layers.0.self_attn.k_proj").unwrap();
        assert_eq!(k.input_dim(), 64);
        assert_eq!(k.output_dim(), 16);
        assert!((k.scale - 4.0).abs() < f32::EPSILON);
        assert_eq!(
            model.target_modules,
            TargetModules::List(vec!["q_proj".into()]).names()
        );
    }

    #[test]
    fn test_build_model_rank_mismatch() {
        let mut weights = HashMap::new();
        weights.insert("layers.0.self_attn.q_proj.lora_A.weight".to_string(), zeros((8, 64)));
        weights.insert("layers.0.self_attn.q_proj.lora_B.weight".to_string(), zeros((64, 4)));

        let err = build_model("x".into(), &config(), weights).unwrap_err();
        assert!(matches!(err, LoraLoadError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_build_model_missing_half() {
        let mut weights = HashMap::new();
        weights.insert("layers.0.self_attn.q_proj.lora_A.weight".to_string(), zeros((8, 64)));

        let err = build_model("x".into(), &config(), weights).unwrap_err();
        assert!(matches!(err, LoraLoadError::IncompleteAdapter(m) if m == "layers.0.self_attn.q_proj"));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("adapter_config.json"),
            r#"{"r": 2, "lora_alpha": 4, "target_modules": ["v_proj"], "peft_type": "LORA"}"#,
        )
        .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.1.self_attn.v_proj.lora_A.weight".to_string(),
            zeros((2, 32)),
        );
        tensors.insert(
            "base_model.model.model.layers.1.self_attn.v_proj.lora_B.weight".to_string(),
            zeros((16, 2)),
        );
        candle_core::safetensors::save(&tensors, dir.path().join("adapter_model.safetensors"))
            .unwrap();

        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        let model = loader.load(dir.path(), "huanhuan").unwrap();
        assert_eq!(model.name, "huanhuan");
        assert_eq!(model.module_names(), vec!["layers.1.self_attn.v_proj"]);
        assert!((model.get_adapter("layers.1.self_attn.v_proj").unwrap().scale - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        let err = loader.load(dir.path(), "x").unwrap_err();
        assert!(matches!(err, LoraLoadError::ConfigNotFound(_)));
    }

    #[test]
    fn test_load_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("adapter_config.json"),
            r#"{"r": 2, "lora_alpha": 4}"#,
        )
        .unwrap();
        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        let err = loader.load(dir.path(), "x").unwrap_err();
        assert!(matches!(err, LoraLoadError::WeightsNotFound(_)));
    }
}
