//! HTTP transport: the chat page at `/` and the JSON endpoint at `/chat`.

pub mod chat;
pub mod error;
pub mod page;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use huanchat_core::ChatService;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use types::{ChatRequest, ChatResponse};

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub request_timeout: Option<Duration>,
    /// Send internal error details to clients.
    pub debug: bool,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>) -> Self {
        Self {
            chat,
            request_timeout: None,
            debug: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn client_message(&self, summary: &str, detail: &dyn std::fmt::Display) -> String {
        if self.debug {
            format!("{summary}: {detail}")
        } else {
            summary.to_string()
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(page::index_handler))
        .route("/chat", post(chat::chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
