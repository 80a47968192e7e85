//! HTTP transport tests against the router with stub generators.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use huanchat_core::engine::{
    EngineError, GenerationRequest, GenerationResult, TextGenerator,
};
use huanchat_core::testing::{test_chat_template, FailingGenerator, StaticGenerator};
use huanchat_core::{ChatService, PromptFormatter};
use huanchat_server::api::{create_router, AppState, ChatResponse};
use tower::ServiceExt;

fn app_with(generator: Arc<dyn TextGenerator>) -> AppState {
    let chat = ChatService::new(PromptFormatter::new(Arc::new(test_chat_template())), generator);
    AppState::new(Arc::new(chat))
}

fn router(generator: Arc<dyn TextGenerator>) -> Router {
    create_router(app_with(generator))
}

fn post_chat(body: &str) -> Request<Body> {
    Request::post("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn chat_returns_generated_reply() {
    let app = router(Arc::new(StaticGenerator::new("fixed reply")));
    let resp = app.oneshot(post_chat(r#"{"input":"hello"}"#)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let parsed: ChatResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.response, "fixed reply");
}

#[tokio::test]
async fn missing_input_is_422() {
    let app = router(Arc::new(StaticGenerator::new("should not be used")));
    let resp = app.oneshot(post_chat(r#"{"message":"hello"}"#)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "missing_field");
    assert!(body.get("response").is_none());
}

#[tokio::test]
async fn wrong_input_type_is_422() {
    let app = router(Arc::new(StaticGenerator::new("unused")));
    let resp = app.oneshot(post_chat(r#"{"input": 42}"#)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(resp).await["error"]["code"], "invalid_type");
}

#[tokio::test]
async fn malformed_json_is_400() {
    let app = router(Arc::new(StaticGenerator::new("unused")));
    let resp = app.oneshot(post_chat(r#"{"input": "#)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn missing_content_type_is_400() {
    let app = router(Arc::new(StaticGenerator::new("unused")));
    let req = Request::post("/chat")
        .body(Body::from(r#"{"input":"hello"}"#))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_input_is_still_answered() {
    let app = router(Arc::new(StaticGenerator::new("臣妾在")));
    let resp = app.oneshot(post_chat(r#"{"input":""}"#)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["response"], "臣妾在");
}

#[tokio::test]
async fn generation_failure_hides_detail_by_default() {
    let app = router(Arc::new(FailingGenerator::new("CUDA out of memory")));
    let resp = app.oneshot(post_chat(r#"{"input":"hello"}"#)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["type"], "server_error");
    assert_eq!(body["error"]["message"], "generation failed");
}

#[tokio::test]
async fn generation_failure_detail_in_debug_mode() {
    let state = app_with(Arc::new(FailingGenerator::new("CUDA out of memory"))).with_debug(true);
    let resp = create_router(state)
        .oneshot(post_chat(r#"{"input":"hello"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let message = json_body(resp).await["error"]["message"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(message.contains("CUDA out of memory"), "{message}");
}

struct SlowGenerator(Duration);

impl TextGenerator for SlowGenerator {
    fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResult, EngineError> {
        std::thread::sleep(self.0);
        Err(EngineError::Model("finished too late".to_string()))
    }
}

#[tokio::test]
async fn slow_generation_times_out_with_504() {
    let state = app_with(Arc::new(SlowGenerator(Duration::from_millis(300))))
        .with_request_timeout(Some(Duration::from_millis(20)));
    let resp = create_router(state)
        .oneshot(post_chat(r#"{"input":"hello"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(resp).await["error"]["type"], "timeout");
}

#[tokio::test]
async fn index_serves_chat_page() {
    let app = router(Arc::new(StaticGenerator::new("unused")));
    let resp = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"));
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(html.contains("fetch('/chat'"));
    assert!(html.contains("JSON.stringify({ input: text })"));
}

#[tokio::test]
async fn get_on_chat_is_rejected() {
    let app = router(Arc::new(StaticGenerator::new("unused")));
    let resp = app
        .oneshot(Request::get("/chat").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}
