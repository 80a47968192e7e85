use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use tracing::error;

use super::error::ApiError;
use super::types::{ChatRequest, ChatResponse};
use super::AppState;

/// `POST /chat`: one user message in, one in-character reply out.
///
/// Generation runs on the blocking pool. On timeout the client gets a 504
/// while the generation finishes in the background.
pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::from_rejection)?;

    let chat = state.chat.clone();
    let task = tokio::task::spawn_blocking(move || chat.reply(&request.input));

    let joined = match state.request_timeout {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| ApiError::Timeout(limit))?,
        None => task.await,
    };

    let reply = joined
        .map_err(|e| {
            error!(error = %e, "generation task panicked");
            ApiError::GenerationFailed(state.client_message("generation task failed", &e))
        })?
        .map_err(|e| {
            error!(error = %e, "generation failed");
            ApiError::GenerationFailed(state.client_message("generation failed", &e))
        })?;

    Ok(Json(ChatResponse { response: reply }))
}
