pub mod api;
pub mod cli;
pub mod config;
pub mod logging;
pub mod shutdown;

use huanchat_core::{load_chat_model, ChatService, LoadError};
use tracing::info;

use crate::config::AppConfig;

/// Load the model and adapter described by `app` and wrap them in the chat
/// pipeline every transport shares. Blocks until the weights are resident.
pub fn build_chat_service(app: &AppConfig) -> Result<ChatService, LoadError> {
    let loaded = load_chat_model(&app.load)?;
    let sampling = loaded.generation.sampling_params().with_seed(app.seed);
    info!(
        greedy = sampling.is_greedy(),
        max_new_tokens = app.max_new_tokens,
        stop_tokens = ?loaded.stop_token_ids,
        "chat pipeline ready"
    );
    Ok(loaded.into_chat_service(&app.persona, app.max_new_tokens, app.seed))
}
