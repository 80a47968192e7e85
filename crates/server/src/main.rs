use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use huanchat_server::api::{self, AppState};
use huanchat_server::config::{AppConfig, ServerConfig};
use huanchat_server::logging::{self, LogFormat};
use huanchat_server::shutdown::shutdown_signal;
use huanchat_server::{build_chat_service, cli};

#[derive(Parser)]
#[command(name = "huanchat", about = "Chat with 甄嬛: a LoRA-tuned Llama persona")]
struct Cli {
    /// TOML config file (default: ~/.config/huanchat/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat page and the /chat endpoint
    Serve(ServeArgs),
    /// Send the fixed prompt once and print the reply
    Generate(ModelArgs),
}

#[derive(Args, Debug, Default)]
struct ModelArgs {
    /// Base model: local directory or HuggingFace Hub id
    #[arg(long)]
    model: Option<String>,

    /// PEFT adapter directory
    #[arg(long)]
    adapter: Option<String>,

    /// Jinja file replacing the tokenizer's chat template
    #[arg(long)]
    chat_template: Option<String>,

    /// Weight precision: bf16, f16 or f32
    #[arg(long)]
    dtype: Option<String>,

    /// auto, cpu, cuda[:N] or metal[:N]
    #[arg(long)]
    device: Option<String>,

    /// Cap on generated tokens per reply
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Persona instruction sent as the system turn
    #[arg(long)]
    system_prompt: Option<String>,

    /// Seed for sampled decoding
    #[arg(long)]
    seed: Option<u64>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl ModelArgs {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            model: self.model.clone(),
            adapter: self.adapter.clone(),
            chat_template_path: self.chat_template.clone(),
            dtype: self.dtype.clone(),
            device: self.device.clone(),
            max_new_tokens: self.max_new_tokens,
            system_prompt: self.system_prompt.clone(),
            seed: self.seed,
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Answer 504 when a generation takes longer than this
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Return error details to clients and log at debug level
    #[arg(long)]
    debug: bool,
}

impl ServeArgs {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout_secs: self.request_timeout_secs,
            debug: self.debug.then_some(true),
            ..self.model.to_config()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("failed to read config file")?;
    let overrides = match &cli.command {
        Command::Serve(args) => args.to_config(),
        Command::Generate(args) => args.to_config(),
    };
    config.merge(&overrides);
    let app = config.resolve().context("invalid configuration")?;

    logging::init(&app.log_level, LogFormat::from_env())?;

    match cli.command {
        Command::Serve(_) => serve(app).await,
        Command::Generate(_) => generate(app).await,
    }
}

async fn load(app: &AppConfig) -> anyhow::Result<huanchat_core::ChatService> {
    let app = app.clone();
    let chat = tokio::task::spawn_blocking(move || build_chat_service(&app))
        .await
        .context("model loading task failed")?
        .context("failed to load model")?;
    Ok(chat)
}

async fn serve(app: AppConfig) -> anyhow::Result<()> {
    let chat = load(&app).await?;
    let state = AppState::new(Arc::new(chat))
        .with_request_timeout(app.request_timeout)
        .with_debug(app.debug);
    let router = api::create_router(state);

    let addr = app.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, debug = app.debug, "serving chat page and /chat");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn generate(app: AppConfig) -> anyhow::Result<()> {
    let chat = load(&app).await?;
    tokio::task::spawn_blocking(move || cli::run_exchange(&chat, &mut std::io::stdout().lock()))
        .await
        .context("generation task failed")?
}
