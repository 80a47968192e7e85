use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use thiserror::Error;
use tracing::{info, warn};

use crate::chat::ChatService;
use crate::config::ModelConfig;
use crate::engine::LlmEngine;
use crate::lora::{LoraLoadError, LoraLoader};
use crate::models::{self, LlamaForCausalLM, LoraAttachment};
use crate::prompt::PromptFormatter;
use crate::sampling::GenerationDefaults;
use crate::tokenizer::{ChatTemplateEngine, TokenizerWrapper};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{what} not found at {path}")]
    NotFound { what: &'static str, path: String },
    #[error("hub error for {model}: {message}")]
    Hub { model: String, message: String },
    #[error("invalid model config: {0}")]
    Config(String),
    #[error("failed to load weights: {0}")]
    Weights(String),
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),
    #[error("chat template unavailable: {0}")]
    Template(String),
    #[error("adapter: {0}")]
    Adapter(#[from] LoraLoadError),
    #[error("unsupported dtype '{0}' (expected bf16, f16 or f32)")]
    Dtype(String),
    #[error("device '{spec}': {message}")]
    Device { spec: String, message: String },
}

/// Parse a weight precision name.
pub fn parse_dtype(s: &str) -> Result<DType, LoadError> {
    match s.to_ascii_lowercase().as_str() {
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f16" | "fp16" | "float16" | "half" => Ok(DType::F16),
        "f32" | "fp32" | "float32" | "float" => Ok(DType::F32),
        _ => Err(LoadError::Dtype(s.to_string())),
    }
}

/// Where the model runs: `auto`, `cpu`, `cuda[:N]` or `metal[:N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    /// First CUDA device when available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceSpec {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, n)) => {
                let n = n.parse::<usize>().map_err(|_| LoadError::Device {
                    spec: s.to_string(),
                    message: "ordinal must be a non-negative integer".to_string(),
                })?;
                (kind, Some(n))
            }
            None => (lower.as_str(), None),
        };
        match (kind, ordinal) {
            ("auto", None) => Ok(DeviceSpec::Auto),
            ("cpu", None) => Ok(DeviceSpec::Cpu),
            ("cuda", n) => Ok(DeviceSpec::Cuda(n.unwrap_or(0))),
            ("metal", n) => Ok(DeviceSpec::Metal(n.unwrap_or(0))),
            _ => Err(LoadError::Device {
                spec: s.to_string(),
                message: "expected auto, cpu, cuda[:N] or metal[:N]".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Auto => f.write_str("auto"),
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(n) => write!(f, "cuda:{n}"),
            DeviceSpec::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

impl DeviceSpec {
    pub fn resolve(&self) -> Result<Device, LoadError> {
        let device = match self {
            DeviceSpec::Auto => Device::cuda_if_available(0),
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(n) => Device::new_cuda(*n),
            DeviceSpec::Metal(n) => Device::new_metal(*n),
        };
        device.map_err(|e| LoadError::Device {
            spec: self.to_string(),
            message: e.to_string(),
        })
    }
}

// ─── Model files ──────────────────────────────────────────────────────────

/// A local model directory or a HuggingFace Hub repository.
enum ModelSource {
    Local(PathBuf),
    Hub { model_id: String, repo: ApiRepo },
}

impl ModelSource {
    fn open(model: &str) -> Result<Self, LoadError> {
        let path = Path::new(model);
        if path.is_dir() {
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        let hub_err = |e: hf_hub::api::sync::ApiError| LoadError::Hub {
            model: model.to_string(),
            message: e.to_string(),
        };
        let api = Api::new().map_err(hub_err)?;
        let repo = api.repo(Repo::new(model.to_string(), RepoType::Model));
        Ok(ModelSource::Hub {
            model_id: model.to_string(),
            repo,
        })
    }

    /// Local path to `filename`, downloading into the hub cache if needed.
    fn get(&self, filename: &str) -> Result<PathBuf, LoadError> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LoadError::NotFound {
                        what: "model file",
                        path: path.display().to_string(),
                    })
                }
            }
            ModelSource::Hub { model_id, repo } => {
                repo.get(filename).map_err(|e| LoadError::Hub {
                    model: model_id.clone(),
                    message: format!("{filename}: {e}"),
                })
            }
        }
    }
}

pub struct ModelFiles {
    pub config: ModelConfig,
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
}

/// Resolve every file the model needs, from a local directory when `model`
/// names one, otherwise from the HuggingFace Hub (or its cache).
pub fn fetch_model(model: &str) -> Result<ModelFiles, LoadError> {
    let source = ModelSource::open(model)?;

    let config_path = source.get("config.json")?;
    let config_content = std::fs::read_to_string(&config_path)
        .map_err(|e| LoadError::Config(format!("{}: {e}", config_path.display())))?;
    let config: ModelConfig =
        serde_json::from_str(&config_content).map_err(|e| LoadError::Config(e.to_string()))?;

    let tokenizer = source.get("tokenizer.json")?;
    let tokenizer_config = source.get("tokenizer_config.json").ok();
    let generation_config = source.get("generation_config.json").ok();
    let weights = safetensor_paths(&source)?;

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
        tokenizer_config,
        generation_config,
    })
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>, LoadError> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device) }
        .map_err(|e| LoadError::Weights(e.to_string()))?;
    Ok(vb)
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        let is_digit = first.is_ascii_digit();
        let mut segment = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() == is_digit) {
            segment.push(c);
        }
        if is_digit {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

fn safetensor_paths(source: &ModelSource) -> Result<Vec<PathBuf>, LoadError> {
    if let Ok(path) = source.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = source.get("model.safetensors.index.json")?;
    let index: serde_json::Value = std::fs::read_to_string(&index_path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        .map_err(LoadError::Weights)?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| LoadError::Weights("missing weight_map in index".to_string()))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    filenames.iter().map(|f| source.get(f)).collect()
}

// ─── Full chat model ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Local directory or HuggingFace Hub repo id of the base model.
    pub model: String,
    /// PEFT adapter directory.
    pub adapter: PathBuf,
    /// Jinja file that replaces the tokenizer_config.json chat template.
    pub chat_template_path: Option<PathBuf>,
    pub dtype: DType,
    pub device: DeviceSpec,
}

/// Everything needed to serve the persona, built once at startup.
pub struct LoadedModel {
    pub model: LlamaForCausalLM,
    pub tokenizer: Arc<TokenizerWrapper>,
    pub template: Arc<ChatTemplateEngine>,
    pub generation: GenerationDefaults,
    pub stop_token_ids: Vec<u32>,
    pub attachment: LoraAttachment,
    pub device: Device,
}

impl LoadedModel {
    /// Wire the loaded pieces into a ready [`ChatService`].
    pub fn into_chat_service(
        self,
        persona: &str,
        max_new_tokens: usize,
        seed: Option<u64>,
    ) -> ChatService {
        let sampling_params = self.generation.sampling_params().with_seed(seed);
        let engine = LlmEngine::new(self.model, self.tokenizer, self.stop_token_ids);
        ChatService::new(
            PromptFormatter::with_persona(self.template, persona),
            Arc::new(engine),
        )
        .with_max_new_tokens(max_new_tokens)
        .with_sampling_params(sampling_params)
    }
}

/// Load base model, tokenizer, chat template and adapter; attach the
/// adapter to the model without merging it.
pub fn load_chat_model(opts: &LoadOptions) -> Result<LoadedModel, LoadError> {
    if !opts.adapter.is_dir() {
        return Err(LoadError::NotFound {
            what: "adapter directory",
            path: opts.adapter.display().to_string(),
        });
    }

    let device = opts.device.resolve()?;
    info!(model = %opts.model, device = ?device, dtype = ?opts.dtype, "loading base model");

    let files = fetch_model(&opts.model)?;
    files.config.validate().map_err(LoadError::Config)?;

    let tokenizer = TokenizerWrapper::from_file(&files.tokenizer)
        .map_err(|e| LoadError::Tokenizer(e.to_string()))?;
    let template = load_template(&files, opts.chat_template_path.as_deref())?;

    let generation = match &files.generation_config {
        Some(path) => GenerationDefaults::from_file(path)
            .map_err(|e| LoadError::Config(format!("generation_config.json: {e}")))?,
        None => GenerationDefaults::default(),
    };

    let vb = load_weights(&files.weights, opts.dtype, &device)?;
    let mut model =
        models::from_config(&files.config, vb).map_err(|e| LoadError::Weights(e.to_string()))?;

    let lora_config = crate::lora::load_config(&opts.adapter)?;
    if let Some(base) = &lora_config.base_model_name_or_path {
        if !opts.model.ends_with(base.as_str()) && !base.ends_with(opts.model.as_str()) {
            warn!(adapter_base = %base, model = %opts.model, "adapter was trained on a different base model name");
        }
    }
    if lora_config.trains_bias() {
        warn!(bias = %lora_config.bias, "adapter bias terms are not applied");
    }
    let lora = LoraLoader::new(device.clone(), opts.dtype).load(&opts.adapter, "persona")?;
    let attachment = model
        .register_lora(&lora)
        .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
    for module in &attachment.skipped {
        warn!(module = %module, "adapter module has no matching projection, skipped");
    }
    info!(
        adapter = %opts.adapter.display(),
        rank = lora.rank,
        alpha = lora.alpha,
        modules = attachment.applied,
        "adapter attached"
    );

    let stop_token_ids = stop_tokens(&files.config, &generation, &tokenizer, &template);

    Ok(LoadedModel {
        model,
        tokenizer: Arc::new(tokenizer),
        template: Arc::new(template),
        generation,
        stop_token_ids,
        attachment,
        device,
    })
}

fn load_template(
    files: &ModelFiles,
    override_path: Option<&Path>,
) -> Result<ChatTemplateEngine, LoadError> {
    let template_override = override_path
        .map(|path| {
            std::fs::read_to_string(path)
                .map_err(|e| LoadError::Template(format!("{}: {e}", path.display())))
        })
        .transpose()?;

    match (files.tokenizer_config.as_deref(), template_override) {
        (Some(config), template_override) => {
            ChatTemplateEngine::from_tokenizer_config(config, template_override)
                .map_err(|e| LoadError::Template(format!("{}: {e}", config.display())))
        }
        (None, Some(source)) => Ok(ChatTemplateEngine::new(source, String::new(), String::new())),
        (None, None) => Err(LoadError::Template(
            "no tokenizer_config.json and no chat template file".to_string(),
        )),
    }
}

/// Generation config ids take precedence over the model config; the
/// template's end-of-sequence token is always included.
fn stop_tokens(
    config: &ModelConfig,
    generation: &GenerationDefaults,
    tokenizer: &TokenizerWrapper,
    template: &ChatTemplateEngine,
) -> Vec<u32> {
    let mut ids = generation
        .eos_token_ids()
        .unwrap_or_else(|| config.eos_token_ids());
    if let Some(id) = tokenizer.token_to_id(template.eos_token()) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}
