//! Configuration for the huanchat server and CLI.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config <path>` or `~/.config/huanchat/config.toml`)
//! 3. Default values (lowest priority)

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use huanchat_core::loader::{parse_dtype, DeviceSpec, LoadOptions};
use huanchat_core::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_PERSONA};
use serde::Deserialize;

/// Base model used when neither the file nor the command line names one.
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct";
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DTYPE: &str = "bf16";

/// Persistent configuration stored in TOML format. Every field is optional;
/// [`ServerConfig::resolve`] fills defaults and validates. Unknown keys are
/// rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Base model: local directory or HuggingFace Hub id.
    pub model: Option<String>,

    /// PEFT adapter directory.
    pub adapter: Option<String>,

    /// Override chat template file path.
    pub chat_template_path: Option<String>,

    /// Weight precision (bf16, f16, f32).
    pub dtype: Option<String>,

    /// auto, cpu, cuda[:N] or metal[:N].
    pub device: Option<String>,

    pub max_new_tokens: Option<usize>,

    /// Persona instruction sent as the system turn.
    pub system_prompt: Option<String>,

    /// Random seed for sampled decoding.
    pub seed: Option<u64>,

    pub host: Option<String>,

    pub port: Option<u16>,

    /// Per-request generation timeout. Unset means wait for completion.
    pub request_timeout_secs: Option<u64>,

    /// Expose error details to clients and log at debug level.
    pub debug: Option<bool>,

    pub log_level: Option<String>,
}

impl ServerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("huanchat").join("config.toml"))
    }

    /// Load `explicit` when given (it must exist), otherwise the default path
    /// when present, otherwise an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &ServerConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            model,
            adapter,
            chat_template_path,
            dtype,
            device,
            max_new_tokens,
            system_prompt,
            seed,
            host,
            port,
            request_timeout_secs,
            debug,
            log_level,
        );
    }

    /// Apply defaults and validate. Runs before any model loading.
    pub fn resolve(&self) -> Result<AppConfig, ConfigError> {
        let adapter = self
            .adapter
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("adapter path is required".to_string()))?;
        let adapter = PathBuf::from(adapter);
        if !adapter.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "adapter directory {} does not exist",
                adapter.display()
            )));
        }

        let chat_template_path = self.chat_template_path.as_ref().map(PathBuf::from);
        if let Some(path) = &chat_template_path {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "chat template file {} does not exist",
                    path.display()
                )));
            }
        }

        let dtype = parse_dtype(self.dtype.as_deref().unwrap_or(DEFAULT_DTYPE))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let device: DeviceSpec = match &self.device {
            Some(spec) => spec
                .parse()
                .map_err(|e: huanchat_core::LoadError| ConfigError::Invalid(e.to_string()))?,
            None => DeviceSpec::Auto,
        };

        let max_new_tokens = self.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        if max_new_tokens == 0 {
            return Err(ConfigError::Invalid(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }

        let request_timeout = match self.request_timeout_secs {
            Some(0) => {
                return Err(ConfigError::Invalid(
                    "request_timeout_secs must be greater than 0".to_string(),
                ))
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let host = match &self.host {
            Some(host) => host.parse::<IpAddr>().map_err(|_| {
                ConfigError::Invalid(format!("host {host:?} is not an IP address"))
            })?,
            None => DEFAULT_HOST,
        };

        let debug = self.debug.unwrap_or(false);
        let log_level = self
            .log_level
            .clone()
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        Ok(AppConfig {
            load: LoadOptions {
                model: self
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                adapter,
                chat_template_path,
                dtype,
                device,
            },
            persona: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            max_new_tokens,
            seed: self.seed,
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            request_timeout,
            debug,
            log_level,
        })
    }
}

/// Validated settings with every default applied.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub load: LoadOptions,
    pub persona: String,
    pub max_new_tokens: usize,
    pub seed: Option<u64>,
    pub host: IpAddr,
    pub port: u16,
    pub request_timeout: Option<Duration>,
    pub debug: bool,
    pub log_level: String,
}

impl AppConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// An option has a missing or unusable value.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
