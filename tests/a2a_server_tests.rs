use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use tower::ServiceExt;

use webeval::actions::Action;
use webeval::browser::{BrowserBackend, BrowserEnv, EnvironmentConfig, StepOutcome};
use webeval::config::Settings;
use webeval::control_agent::{ChatMessage, LlmClient, LlmReply, ToolDefinition};
use webeval::observation::RawObservation;
use webeval::server::{evaluator_router, AppState, EvaluatorCore};

/// LLM that answers every message with a fixed line and no tool calls.
struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn send(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LlmReply, Box<dyn Error + Send + Sync>> {
        Ok(LlmReply {
            content: "acknowledged".to_string(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

struct NullEnv;

impl BrowserEnv for NullEnv {
    fn step(&mut self, _action: &Action) -> Result<StepOutcome, Box<dyn Error + Send + Sync>> {
        Ok(StepOutcome {
            observation: RawObservation::default(),
            reward: 0.0,
            done: false,
            truncated: false,
            task_success: None,
        })
    }

    fn observe(&mut self) -> Result<RawObservation, Box<dyn Error + Send + Sync>> {
        Ok(RawObservation::default())
    }

    fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

struct NullBackend;

impl BrowserBackend for NullBackend {
    fn create(
        &mut self,
        _config: &EnvironmentConfig,
    ) -> Result<(Box<dyn BrowserEnv>, RawObservation), Box<dyn Error + Send + Sync>> {
        Ok((Box::new(NullEnv), RawObservation::default()))
    }
}

fn app() -> axum::Router {
    app_with(|_| {})
}

fn app_with(tune: impl FnOnce(&mut Settings)) -> axum::Router {
    let mut settings = Settings::default();
    settings.evaluator_host = "127.0.0.1".to_string();
    settings.send_timeout_seconds = 1;
    settings.timeout_seconds = 1;
    settings.poll_interval_ms = 25;
    tune(&mut settings);
    let core = EvaluatorCore::new(settings, Box::new(NullBackend)).unwrap();
    let state = AppState::new(core, Arc::new(EchoLlm), None, true);
    evaluator_router(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_agent_card_endpoints() {
    for path in ["/.well-known/agent-card.json", "/.well-known/agent.json"] {
        let response = app()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let card = body_json(response).await;
        assert_eq!(card["protocolVersion"], "0.3.0");
        assert_eq!(card["capabilities"]["streaming"], true);
        assert!(card["skills"].as_array().unwrap().len() >= 1);
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    for (path, expected) in [
        ("/health", "ok"),
        ("/health/live", "alive"),
        ("/health/ready", "ready"),
    ] {
        let response = app()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", path);
        assert_eq!(body_json(response).await["status"], expected);
    }
}

#[tokio::test]
async fn test_message_send_round_trip() {
    let request = post_json(
        "/",
        json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": "message/send",
            "params": {"message": {
                "kind": "message",
                "role": "user",
                "parts": [{"kind": "text", "text": "hello evaluator"}],
                "messageId": "m-1",
            }},
        }),
    );
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = body_json(response).await;

    let task = &envelope["result"];
    assert_eq!(task["kind"], "task");
    assert_eq!(task["status"]["state"], "completed");
    assert_eq!(task["status"]["message"], "acknowledged");
    assert!(task["contextId"].is_string());
}

#[tokio::test]
async fn test_message_without_parts_is_invalid_params() {
    let request = post_json(
        "/",
        json!({
            "jsonrpc": "2.0",
            "id": "2",
            "method": "message/send",
            "params": {"message": {
                "kind": "message",
                "role": "user",
                "parts": [],
                "messageId": "m-2",
            }},
        }),
    );
    let response = app().oneshot(request).await.unwrap();
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], -32602);
}

#[tokio::test]
async fn test_message_with_bad_role_is_invalid_params() {
    let request = post_json(
        "/",
        json!({
            "jsonrpc": "2.0",
            "id": "3",
            "method": "message/send",
            "params": {"message": {
                "kind": "message",
                "role": "supervisor",
                "parts": [{"kind": "text", "text": "hi"}],
                "messageId": "m-3",
            }},
        }),
    );
    let response = app().oneshot(request).await.unwrap();
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], -32602);
}

#[tokio::test]
async fn test_unknown_method() {
    let request = post_json("/", json!({"jsonrpc": "2.0", "id": "4", "method": "tasks/steal"}));
    let response = app().oneshot(request).await.unwrap();
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], -32601);
}

#[tokio::test]
async fn test_extended_card_rpc() {
    let request = post_json("/", json!({"jsonrpc": "2.0", "id": "5", "method": "agent/getCard"}));
    let response = app().oneshot(request).await.unwrap();
    let envelope = body_json(response).await;

    let card = &envelope["result"];
    assert_eq!(card["protocolVersion"], "0.3.0");
    let benchmarks = card["extended"]["benchmarks"].as_object().unwrap();
    assert_eq!(benchmarks.len(), 6);
    assert_eq!(benchmarks["webarena"]["token_limit"], 5000);
    assert_eq!(card["extended"]["scoring_formula"]["lambda_c"], 0.01);
}

#[tokio::test]
async fn test_evaluate_rejects_bad_config() {
    let response = app()
        .oneshot(post_json("/evaluate", json!({"run_id": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app()
        .oneshot(post_json(
            "/evaluate",
            json!({
                "run_id": "x",
                "benchmarks": ["minesweeper"],
                "tasks_by_benchmark": {"minesweeper": ["minesweeper.easy"]},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_evaluate_starts_interaction() {
    let response = app()
        .oneshot(post_json(
            "/evaluate",
            json!({
                "run_id": "run-77",
                "benchmarks": ["webarena"],
                "tasks_by_benchmark": {"webarena": ["webarena.nav-1"]},
                "timeout_seconds": 1,
                "participants": {
                    "participant": {"role": "participant", "endpoint": "http://127.0.0.1:1"}
                },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["started"]["status"], "started");
    assert!(body["interaction_id"].is_string());
    let stream = body["stream"].as_str().unwrap();
    assert!(stream.starts_with("/stream/"));
}

#[tokio::test]
async fn test_message_send_rate_limit() {
    // Burst of two per minute: the third request from the same context is
    // throttled with the JSON-RPC rate-limit error code.
    let app = app_with(|s| s.rate_limit_requests_per_minute = 2);
    let message_body = |id: &str| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "message/send",
            "params": {"message": {
                "kind": "message",
                "role": "user",
                "parts": [{"kind": "text", "text": "hello"}],
                "messageId": id,
                "contextId": "ctx-throttle",
            }},
        })
    };

    for id in ["1", "2"] {
        let response = app.clone().oneshot(post_json("/", message_body(id))).await.unwrap();
        let envelope = body_json(response).await;
        assert!(envelope["error"].is_null(), "request {} should pass", id);
    }
    let response = app.oneshot(post_json("/", message_body("3"))).await.unwrap();
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], -32000);
    assert!(envelope["error"]["message"]
        .as_str()
        .unwrap()
        .contains("rate limit exceeded"));
}

#[tokio::test]
async fn test_evaluate_rate_limit() {
    let app = app_with(|s| s.rate_limit_requests_per_minute = 1);
    let config = json!({
        "run_id": "run-throttle",
        "benchmarks": ["webarena"],
        "tasks_by_benchmark": {"webarena": ["webarena.nav-1"]},
        "timeout_seconds": 1,
        "participants": {
            "participant": {"role": "participant", "endpoint": "http://127.0.0.1:1"}
        },
    });

    let first = app.clone().oneshot(post_json("/evaluate", config.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(post_json("/evaluate", config)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_evaluate_rejects_unsafe_participant_endpoint() {
    let response = app()
        .oneshot(post_json(
            "/evaluate",
            json!({
                "run_id": "run-ssrf",
                "benchmarks": ["webarena"],
                "tasks_by_benchmark": {"webarena": ["webarena.nav-1"]},
                "participants": {
                    "participant": {"role": "participant", "endpoint": "file:///etc/passwd"}
                },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("scheme"));
}

#[tokio::test]
async fn test_stream_endpoint_is_sse() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/stream/some-interaction")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(content_type.starts_with("text/event-stream"));
}
