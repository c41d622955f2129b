//! Integration tests for the backend HTTP API.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use futures_util::stream;
use serde_json::{json, Value};
use tower::ServiceExt;

use rmm_backend::catalog::ModelDescriptor;
use rmm_backend::config::Config;
use rmm_backend::engine::{FragmentStream, LoadParams, ModelHandle, ModelRuntime, SamplingParams};
use rmm_backend::state::AppState;
use rmm_backend::{api, Error, Result};

/// Runtime whose models answer every prompt with the same fragments.
struct FakeRuntime {
    fragments: Vec<&'static str>,
    failure: Option<&'static str>,
}

struct FakeHandle {
    fragments: Vec<&'static str>,
    failure: Option<&'static str>,
}

#[async_trait]
impl ModelHandle for FakeHandle {
    async fn stream(&self, _prompt: &str, _sampling: &SamplingParams) -> Result<FragmentStream> {
        let mut items: Vec<Result<String>> =
            self.fragments.iter().map(|f| Ok(f.to_string())).collect();
        if let Some(msg) = self.failure {
            items.push(Err(Error::Stream(msg.to_string())));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    async fn release(&self) {}
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    fn runtime_type(&self) -> &'static str {
        "fake"
    }

    async fn instantiate(
        &self,
        descriptor: &ModelDescriptor,
        _params: &LoadParams,
    ) -> Result<Box<dyn ModelHandle>> {
        if descriptor.name == "broken" {
            return Err(Error::EngineInit("invalid magic number".to_string()));
        }
        Ok(Box::new(FakeHandle {
            fragments: self.fragments.clone(),
            failure: self.failure,
        }))
    }
}

struct TestApp {
    app: Router,
    _dir: tempfile::TempDir,
}

fn test_app_with(runtime: FakeRuntime) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("modelA");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::File::create(model_dir.join("model.gguf"))
        .unwrap()
        .set_len(10 * 1024 * 1024)
        .unwrap();
    std::fs::File::create(dir.path().join("modelB.gguf"))
        .unwrap()
        .set_len(5 * 1024 * 1024)
        .unwrap();
    std::fs::write(dir.path().join("broken.gguf"), b"nope").unwrap();

    let mut config = Config::default();
    config.paths.base_dir = dir.path().to_path_buf();

    let state = Arc::new(AppState::new(config, Arc::new(runtime)));
    TestApp {
        app: api::app(state),
        _dir: dir,
    }
}

fn test_app() -> TestApp {
    test_app_with(FakeRuntime {
        fragments: vec!["Hello", " world"],
        failure: None,
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn call_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = call(app, request).await;
    (status, serde_json::from_str(&body).unwrap())
}

async fn scan_and_load(app: &Router, name: &str) {
    let (status, _) = call_json(app, get("/api/models")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call_json(
        app,
        send_json("POST", "/api/models/load", json!({ "model_name": name })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_root_and_health() {
    let t = test_app();

    let (status, body) = call_json(&t.app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "RunMyModel Backend");
    assert_eq!(body["status"], "running");

    let (status, body) = call_json(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["models_loaded"], 0);
    assert!(body["memory_usage_mb"].is_u64());
}

#[tokio::test]
async fn test_list_models() {
    let t = test_app();

    let (status, body) = call_json(&t.app, get("/api/models")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);

    let models = body["models"].as_array().unwrap();
    let model_a = models.iter().find(|m| m["name"] == "modelA").unwrap();
    assert_eq!(model_a["size_mb"], 10);
    assert_eq!(model_a["loaded"], false);
    let model_b = models.iter().find(|m| m["name"] == "modelB").unwrap();
    assert_eq!(model_b["size_mb"], 5);
}

#[tokio::test]
async fn test_load_unload_cycle() {
    let t = test_app();
    scan_and_load(&t.app, "modelB").await;

    let (_, body) = call_json(&t.app, get("/api/models/loaded")).await;
    assert_eq!(body["loaded_models"], json!(["modelB"]));
    assert_eq!(body["count"], 1);

    // Loading again succeeds without a second instance.
    let (status, body) = call_json(
        &t.app,
        send_json("POST", "/api/models/load", json!({ "model_name": "modelB", "n_ctx": 1024 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = call_json(&t.app, post_empty("/api/models/unload?model_name=modelB")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = call_json(&t.app, get("/api/models/loaded")).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_unload_not_loaded_is_404() {
    let t = test_app();
    let (status, body) = call_json(&t.app, post_empty("/api/models/unload?model_name=modelA")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"]["message"].as_str().unwrap().contains("modelA"));
}

#[tokio::test]
async fn test_load_failures_are_500() {
    let t = test_app();
    call(&t.app, get("/api/models")).await;

    let (status, body) = call_json(
        &t.app,
        send_json("POST", "/api/models/load", json!({ "model_name": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["type"], "model_not_found");

    let (status, body) = call_json(
        &t.app,
        send_json("POST", "/api/models/load", json!({ "model_name": "broken" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("invalid magic number"));
}

#[tokio::test]
async fn test_chat_stream_event_format() {
    let t = test_app();
    scan_and_load(&t.app, "modelA").await;

    let response = t
        .app
        .clone()
        .oneshot(send_json(
            "POST",
            "/api/chat/completions",
            json!({ "model": "modelA", "messages": [{ "role": "user", "content": "Hi" }] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(
        body,
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"index\":0,\"finish_reason\":null}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"index\":0,\"finish_reason\":null}]}\n\n\
         data: {\"choices\":[{\"delta\":{},\"index\":0,\"finish_reason\":\"stop\"}]}\n\n\
         data: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_chat_stream_error_event() {
    let t = test_app_with(FakeRuntime {
        fragments: vec!["Hello"],
        failure: Some("engine crashed"),
    });
    scan_and_load(&t.app, "modelA").await;

    let (status, body) = call(
        &t.app,
        send_json(
            "POST",
            "/api/chat/completions",
            json!({ "model": "modelA", "messages": [{ "role": "user", "content": "Hi" }] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let events: Vec<&str> = body.split("\n\n").filter(|e| !e.is_empty()).collect();
    assert_eq!(events.len(), 2);
    assert!(events[0].contains("\"content\":\"Hello\""));
    assert_eq!(events[1], r#"data: {"error":"engine crashed"}"#);
    assert!(!body.contains("[DONE]"));
}

#[tokio::test]
async fn test_chat_non_streaming() {
    let t = test_app();
    scan_and_load(&t.app, "modelA").await;

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/chat/completions",
            json!({
                "model": "modelA",
                "messages": [{ "role": "user", "content": "Hi" }],
                "stream": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_chat_model_not_loaded() {
    let t = test_app();

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/chat/completions",
            json!({ "model": "modelA", "messages": [{ "role": "user", "content": "Hi" }] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "model_not_loaded");
}

#[tokio::test]
async fn test_chat_invalid_sampling() {
    let t = test_app();
    scan_and_load(&t.app, "modelA").await;

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/chat/completions",
            json!({ "model": "modelA", "messages": [], "max_tokens": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_completions_plain_text() {
    let t = test_app();
    scan_and_load(&t.app, "modelA").await;

    let response = t
        .app
        .clone()
        .oneshot(send_json(
            "POST",
            "/api/completions",
            json!({ "model": "modelA", "prompt": "Say hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"Hello world");

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/completions",
            json!({ "model": "modelA", "prompt": "Say hi", "stream": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "text": "Hello world" }));
}

#[tokio::test]
async fn test_completions_stream_error_suffix() {
    let t = test_app_with(FakeRuntime {
        fragments: vec!["Once"],
        failure: Some("engine crashed"),
    });
    scan_and_load(&t.app, "modelA").await;

    let (status, body) = call(
        &t.app,
        send_json(
            "POST",
            "/api/completions",
            json!({ "model": "modelA", "prompt": "Tell a story" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Once\n\n[ERROR: engine crashed]");
}

#[tokio::test]
async fn test_system_info() {
    let t = test_app();
    let (status, body) = call_json(&t.app, get("/api/system/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cpu_count"].as_u64().unwrap() > 0);
    assert!(body["memory_total_gb"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_templates_endpoints() {
    let t = test_app();

    let (status, body) = call_json(&t.app, get("/api/prompts/templates")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 6);
    assert_eq!(
        body["categories"],
        json!(["Analysis", "Coding", "General", "Writing"])
    );

    let (_, body) = call_json(&t.app, get("/api/prompts/templates?category=Coding")).await;
    assert_eq!(body["count"], 2);

    let (status, body) = call_json(&t.app, get("/api/prompts/templates/debugging")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Debug Helper");

    let (status, body) = call_json(&t.app, get("/api/prompts/templates/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "template_not_found");

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/prompts/build",
            json!({ "template_id": "general_assistant", "variables": { "user_request": "Hi" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["prompt"].as_str().unwrap().ends_with("User: Hi"));
}

#[tokio::test]
async fn test_save_custom_template() {
    let t = test_app();

    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/prompts/templates",
            json!({
                "name": "Release Notes",
                "description": "Summarize changes",
                "category": "Writing",
                "blocks": [{ "type": "user", "content": "Summarize {changes}" }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "release_notes");

    let (_, body) = call_json(
        &t.app,
        send_json(
            "POST",
            "/api/prompts/build",
            json!({ "template_id": "release_notes", "variables": { "changes": "v2" } }),
        ),
    )
    .await;
    assert_eq!(body["prompt"], "User: Summarize v2");
}

#[tokio::test]
async fn test_architect_session_flow() {
    let t = test_app();

    let (_, body) = call_json(&t.app, post_empty("/api/prompts/architect/session")).await;
    let sid = body["session_id"].as_str().unwrap().to_string();
    let base = format!("/api/prompts/architect/{sid}");

    let (_, body) = call_json(
        &t.app,
        send_json(
            "POST",
            &format!("{base}/block"),
            json!({ "type": "system", "content": "You review {language}." }),
        ),
    )
    .await;
    assert_eq!(body["block_id"], "block_0");

    let (_, body) = call_json(
        &t.app,
        send_json("POST", &format!("{base}/block"), json!({ "type": "user", "content": "Check this" })),
    )
    .await;
    assert_eq!(body["block_id"], "block_1");

    let (_, body) = call_json(
        &t.app,
        send_json(
            "POST",
            &format!("{base}/variable"),
            json!({ "name": "language", "value": "Rust" }),
        ),
    )
    .await;
    assert_eq!(body["prompt"], "System: You review Rust.\n\nUser: Check this");

    let (_, body) = call_json(
        &t.app,
        send_json("POST", &format!("{base}/reorder"), json!(["block_1"])),
    )
    .await;
    assert_eq!(body["prompt"], "User: Check this\n\nSystem: You review Rust.");

    let update = Request::builder()
        .method("PUT")
        .uri(format!("{base}/block/block_1?content=Check%20that"))
        .body(Body::empty())
        .unwrap();
    let (_, body) = call_json(&t.app, update).await;
    assert_eq!(body["success"], true);

    let remove = Request::builder()
        .method("DELETE")
        .uri(format!("{base}/block/block_0"))
        .body(Body::empty())
        .unwrap();
    let (_, body) = call_json(&t.app, remove).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["prompt"], "User: Check that");

    let (status, body) = call_json(&t.app, get(&base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], sid.as_str());
    assert_eq!(body["blocks"].as_array().unwrap().len(), 1);
    assert_eq!(body["variables"]["language"], "Rust");

    let delete = Request::builder()
        .method("DELETE")
        .uri(&base)
        .body(Body::empty())
        .unwrap();
    let (status, _) = call_json(&t.app, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call_json(&t.app, get(&base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "session_not_found");
}

#[tokio::test]
async fn test_architect_save_and_load() {
    let t = test_app();

    let (_, body) = call_json(&t.app, post_empty("/api/prompts/architect/session")).await;
    let first = body["session_id"].as_str().unwrap().to_string();
    call(
        &t.app,
        send_json(
            "POST",
            &format!("/api/prompts/architect/{first}/block"),
            json!({ "type": "instruction", "content": "Be precise." }),
        ),
    )
    .await;

    let (status, _) = call_json(
        &t.app,
        send_json(
            "POST",
            &format!("/api/prompts/architect/{first}/save"),
            json!({ "name": "precise" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call_json(&t.app, post_empty("/api/prompts/architect/session")).await;
    let second = body["session_id"].as_str().unwrap().to_string();
    let (status, body) = call_json(
        &t.app,
        send_json(
            "POST",
            &format!("/api/prompts/architect/{second}/load"),
            json!({ "name": "precise" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prompt"], "Instruction: Be precise.");

    let (status, _) = call_json(
        &t.app,
        send_json(
            "POST",
            &format!("/api/prompts/architect/{second}/save"),
            json!({ "name": "../escape" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
