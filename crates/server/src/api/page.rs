//! The embedded chat page.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

/// Path is relative to the crate root (crates/server/).
#[derive(RustEmbed)]
#[folder = "static"]
pub struct PageAssets;

fn serve_asset(path: &str) -> Response {
    match PageAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                content.data.into_owned(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

pub async fn index_handler() -> Response {
    serve_asset("index.html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn index_is_html() {
        let resp = index_handler().await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/html"));
    }

    #[test]
    fn unknown_asset_is_404() {
        assert_eq!(serve_asset("nope.js").status(), StatusCode::NOT_FOUND);
    }
}
