//! Browser tool server.
//!
//! Exposes a fixed set of base operations (`execute_actions`,
//! `get_observation`) plus benchmark-specific extras that the orchestrator
//! registers before each task and deregisters on cleanup. The tool table is
//! guarded by a read-write lock: writers (register/deregister) only run at
//! task boundaries, invocations resolve their handler under a short read
//! lock so in-flight calls observe a consistent tool set.
//!
//! Every invocation is counted against the per-task tool-call ceiling in the
//! shared state store **before any work happens**; a breach returns a
//! synthetic early-termination record and the browser is never touched.
//!
//! The HTTP transport is an axum router with a tool-discovery RPC
//! (`POST /tools/list`) and a tool-invocation RPC (`POST /tools/execute`),
//! optionally protected by a bearer token compared in constant time.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = Arc::new(ToolServer::new(deps));
//! start_tool_server(server.clone(), "127.0.0.1:8081").await?;
//!
//! server.register_benchmark_tools("assistantbench").await?;
//! let result = server
//!     .execute(
//!         "execute_actions",
//!         json!({"actions": [{"action": "click", "bid": "13"}]}),
//!     )
//!     .await?;
//! server.deregister_benchmark_tools().await;
//! ```

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::webeval::actions::parse_action_batch;
use crate::webeval::benchmark_tools::handler_for;
use crate::webeval::browser::{SessionManager, StepOutcome};
use crate::webeval::error::EvalError;
use crate::webeval::observation::ObservationFilter;
use crate::webeval::profiles::{BenchmarkProfileRegistry, ObservationMode};
use crate::webeval::shared_state::{SharedStateStore, ToolInvocation};
use crate::webeval::tool_protocol::{
    ToolHandler, ToolMetadata, ToolParameter, ToolParameterType, ToolResult,
};

/// Shared dependencies handed to every tool handler.
#[derive(Clone)]
pub struct ToolDeps {
    pub sessions: Arc<SessionManager>,
    pub shared_state: Arc<SharedStateStore>,
    pub filter: Arc<ObservationFilter>,
    pub registry: Arc<BenchmarkProfileRegistry>,
}

impl ToolDeps {
    /// Session id of the active session, or a tool-server error.
    pub async fn active_session_id(&self) -> Result<String, EvalError> {
        self.sessions
            .current_session()
            .await
            .map(|s| s.session_id)
            .ok_or_else(|| EvalError::ToolServer("no active session".to_string()))
    }

    /// Push terminal step fields into the shared state when the environment
    /// reports the episode over.
    pub async fn finalize_if_terminal(
        &self,
        session_id: &str,
        benchmark: &str,
        outcome: &StepOutcome,
    ) -> Result<bool, EvalError> {
        if !outcome.done && !outcome.truncated {
            return Ok(false);
        }
        let success = match self.registry.get(benchmark) {
            Some(profile) => profile.success_from(outcome.reward, outcome.task_success),
            None => outcome.reward > 0.0,
        };
        self.shared_state
            .finalize(session_id, outcome.done, outcome.truncated, success, outcome.reward)
            .await?;
        Ok(true)
    }
}

struct RegisteredTool {
    metadata: ToolMetadata,
    handler: Arc<dyn ToolHandler>,
}

/// The tool server: base tools plus the active benchmark's extras.
pub struct ToolServer {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    active_benchmark: RwLock<Option<String>>,
    deps: ToolDeps,
    bearer_digest: Option<[u8; 32]>,
}

const BASE_TOOLS: [&str; 2] = ["execute_actions", "get_observation"];

impl ToolServer {
    /// Build a server with the base tools registered.
    pub fn new(deps: ToolDeps) -> Self {
        let mut tools = HashMap::new();

        let execute_metadata = ToolMetadata::new(
            "execute_actions",
            "Execute a batch of browser actions sequentially. Stops early when an \
             action completes the task or fails.",
        )
        .with_parameter(
            ToolParameter::new("actions", ToolParameterType::Array)
                .with_description("List of action records, each with an 'action' tag")
                .required(),
        );
        tools.insert(
            "execute_actions".to_string(),
            RegisteredTool {
                metadata: execute_metadata,
                handler: Arc::new(ExecuteActionsHandler { deps: deps.clone() }),
            },
        );

        let observe_metadata = ToolMetadata::new(
            "get_observation",
            "Return the current filtered observation, including the page URL and task goal.",
        )
        .with_parameter(
            ToolParameter::new("mode", ToolParameterType::String)
                .with_description("Observation mode override; defaults to the benchmark's mode"),
        );
        tools.insert(
            "get_observation".to_string(),
            RegisteredTool {
                metadata: observe_metadata,
                handler: Arc::new(GetObservationHandler { deps: deps.clone() }),
            },
        );

        Self {
            tools: RwLock::new(tools),
            active_benchmark: RwLock::new(None),
            deps,
            bearer_digest: None,
        }
    }

    /// Require a bearer token on the HTTP transport.
    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.bearer_digest = Some(Sha256::digest(token.as_bytes()).into());
        self
    }

    /// Register the benchmark's extra tools, replacing any previously active
    /// benchmark's extras. Idempotent for the same benchmark.
    pub async fn register_benchmark_tools(
        &self,
        benchmark_id: &str,
    ) -> Result<Vec<String>, EvalError> {
        let profile = self.deps.registry.get_or_err(benchmark_id)?.clone();

        {
            let active = self.active_benchmark.read().await;
            if active.as_deref() == Some(benchmark_id) {
                return Ok(profile.extra_tools.iter().map(|t| t.name.clone()).collect());
            }
        }
        self.deregister_benchmark_tools().await;

        let mut registered = Vec::new();
        let mut tools = self.tools.write().await;
        for metadata in &profile.extra_tools {
            match handler_for(&metadata.name, &self.deps) {
                Some(handler) => {
                    tools.insert(
                        metadata.name.clone(),
                        RegisteredTool {
                            metadata: metadata.clone(),
                            handler,
                        },
                    );
                    registered.push(metadata.name.clone());
                }
                None => {
                    log::error!(
                        "no handler for benchmark tool {} ({})",
                        metadata.name,
                        benchmark_id
                    );
                }
            }
        }
        drop(tools);

        *self.active_benchmark.write().await = Some(benchmark_id.to_string());
        log::info!(
            "registered {} benchmark tools for {}: {:?}",
            registered.len(),
            benchmark_id,
            registered
        );
        Ok(registered)
    }

    /// Remove all benchmark-specific tools. Base tools are never removed;
    /// repeated calls are no-ops.
    pub async fn deregister_benchmark_tools(&self) -> Vec<String> {
        let mut tools = self.tools.write().await;
        let extras: Vec<String> = tools
            .keys()
            .filter(|name| !BASE_TOOLS.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in &extras {
            tools.remove(name);
        }
        drop(tools);

        let previous = self.active_benchmark.write().await.take();
        if !extras.is_empty() {
            log::info!(
                "deregistered {} benchmark tools (was {:?}): {:?}",
                extras.len(),
                previous,
                extras
            );
        }
        extras
    }

    /// The currently active benchmark, if any.
    pub async fn active_benchmark(&self) -> Option<String> {
        self.active_benchmark.read().await.clone()
    }

    /// Metadata for all registered tools, base tools first.
    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().await;
        let mut listed: Vec<ToolMetadata> = Vec::with_capacity(tools.len());
        for name in BASE_TOOLS {
            if let Some(tool) = tools.get(name) {
                listed.push(tool.metadata.clone());
            }
        }
        let mut extras: Vec<&RegisteredTool> = tools
            .values()
            .filter(|t| !BASE_TOOLS.contains(&t.metadata.name.as_str()))
            .collect();
        extras.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        listed.extend(extras.into_iter().map(|t| t.metadata.clone()));
        listed
    }

    /// Names of all registered tools.
    pub async fn tool_names(&self) -> Vec<String> {
        self.list_tools().await.into_iter().map(|t| t.name).collect()
    }

    /// Execute a named tool.
    ///
    /// The ceiling is enforced first: on breach a synthetic
    /// early-termination result is returned and the handler never runs.
    /// Handler failures and unknown tools are recorded on the session's
    /// shared state before the error propagates.
    pub async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, EvalError> {
        // Resolve under a short read lock so this invocation sees a
        // consistent tool set even if a task boundary is imminent.
        let handler = {
            let tools = self.tools.read().await;
            tools.get(tool_name).map(|t| t.handler.clone())
        };

        let session_id = self.deps.active_session_id().await?;
        match self
            .deps
            .shared_state
            .record_tool_invocation(&session_id, tool_name)
            .await?
        {
            ToolInvocation::Recorded(_) => {}
            ToolInvocation::LimitExceeded(count) => {
                log::warn!(
                    "tool-call ceiling breached on {} (invocation {})",
                    tool_name,
                    count
                );
                return Ok(ToolResult::failure(format!(
                    "tool call limit exceeded at invocation {}",
                    count
                ))
                .with_metadata("early_termination", json!(true))
                .with_metadata("tool_invocation_count", json!(count)));
            }
        }

        let handler = match handler {
            Some(handler) => handler,
            None => {
                let err = EvalError::ToolServer(format!("tool not registered: {}", tool_name));
                self.deps.shared_state.record_error(&session_id, &err.to_string()).await?;
                return Err(err);
            }
        };

        match handler.execute(parameters).await {
            Ok(result) => Ok(result),
            Err(e) => {
                // Shape violations stay validation errors and never land in
                // the task's shared state.
                if let Some(EvalError::Validation(msg)) = e.downcast_ref::<EvalError>() {
                    return Err(EvalError::Validation(msg.clone()));
                }
                let err = EvalError::ToolServer(format!("{}: {}", tool_name, e));
                self.deps.shared_state.record_error(&session_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> bool {
        let expected = match &self.bearer_digest {
            Some(digest) => digest,
            None => return true,
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) => {
                let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
                bool::from(digest.as_slice().ct_eq(expected.as_slice()))
            }
            None => false,
        }
    }
}

/// Base tool: execute a batch of actions sequentially.
struct ExecuteActionsHandler {
    deps: ToolDeps,
}

#[async_trait::async_trait]
impl ToolHandler for ExecuteActionsHandler {
    async fn execute(
        &self,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        let raw = parameters
            .get("actions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EvalError::Validation("'actions' array is required".to_string()))?;
        let actions = parse_action_batch(raw)?;

        let session = self
            .deps
            .sessions
            .current_session()
            .await
            .ok_or_else(|| EvalError::ToolServer("no active session".to_string()))?;
        let session_id = session.session_id.clone();

        let batch_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut results: Vec<serde_json::Value> = Vec::with_capacity(actions.len());
        let mut early_termination = false;
        let mut task_completed = false;
        let mut final_reward = 0.0;
        let mut batch_error: Option<String> = None;

        for (index, action) in actions.into_iter().enumerate() {
            match self.deps.sessions.step(action).await {
                Ok(outcome) => {
                    let filtered = self.deps.filter.filter(&outcome.observation, None);
                    self.deps
                        .shared_state
                        .record_observation(&session_id, filtered.token_estimate)
                        .await?;
                    final_reward = outcome.reward;
                    results.push(json!({
                        "observation": filtered.to_value(),
                        "reward": outcome.reward,
                        "done": outcome.done,
                        "truncated": outcome.truncated,
                        "error": serde_json::Value::Null,
                        "action_index": index,
                    }));
                    if self
                        .deps
                        .finalize_if_terminal(&session_id, &session.benchmark, &outcome)
                        .await?
                    {
                        task_completed = true;
                        early_termination = true;
                        break;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.deps.shared_state.record_error(&session_id, &message).await?;
                    results.push(json!({
                        "observation": serde_json::Value::Null,
                        "reward": 0.0,
                        "done": false,
                        "truncated": false,
                        "error": message,
                        "action_index": index,
                    }));
                    batch_error = Some(message);
                    early_termination = true;
                    break;
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        self.deps
            .shared_state
            .record_action_batch(&session_id, results.len() as u64, latency_ms)
            .await?;

        let mut output = json!({
            "results": results,
            "batch_id": batch_id,
            "latency_ms": latency_ms,
            "early_termination": early_termination,
            "task_completed": task_completed,
            "final_reward": final_reward,
        });
        if task_completed {
            output["message"] = json!("Task completed; awaiting environment cleanup.");
        }
        if let Some(error) = &batch_error {
            output["error"] = json!(error);
        }

        let mut result = ToolResult::success(output);
        if let Some(error) = batch_error {
            result = ToolResult {
                success: false,
                error: Some(error),
                ..result
            };
        }
        Ok(result)
    }
}

/// Base tool: read the current observation.
struct GetObservationHandler {
    deps: ToolDeps,
}

#[async_trait::async_trait]
impl ToolHandler for GetObservationHandler {
    async fn execute(
        &self,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        let mode_override = match parameters.get("mode").and_then(|v| v.as_str()) {
            Some(name) => Some(ObservationMode::parse(name).ok_or_else(|| {
                EvalError::Validation(format!("unknown observation mode: {}", name))
            })?),
            None => None,
        };

        let session_id = self.deps.active_session_id().await?;
        let raw = self.deps.sessions.observe().await?;
        let filtered = self.deps.filter.filter(&raw, mode_override);
        self.deps
            .shared_state
            .record_observation(&session_id, filtered.token_estimate)
            .await?;
        Ok(ToolResult::success(filtered.to_value()))
    }
}

/// Running tool server bound to a socket.
pub struct ToolServerHandle {
    pub addr: SocketAddr,
}

/// Build the axum router for a tool server.
pub fn tool_server_router(server: Arc<ToolServer>) -> Router {
    Router::new()
        .route("/tools/list", post(handle_list))
        .route("/tools/execute", post(handle_execute))
        .with_state(server)
}

/// Bind the transport and serve it on a background task.
pub async fn start_tool_server(
    server: Arc<ToolServer>,
    addr: &str,
) -> Result<ToolServerHandle, EvalError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EvalError::Configuration(format!("tool server bind {}: {}", addr, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| EvalError::Configuration(format!("tool server addr: {}", e)))?;
    let app = tool_server_router(server);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("tool server exited: {}", e);
        }
    });
    log::info!("tool server listening on {}", local);
    Ok(ToolServerHandle { addr: local })
}

async fn handle_list(
    State(server): State<Arc<ToolServer>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !server.authorize(&headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "Access denied"}))).into_response();
    }
    let tools: Vec<serde_json::Value> = server
        .list_tools()
        .await
        .into_iter()
        .map(|meta| {
            json!({
                "name": meta.name,
                "description": meta.description,
                "inputSchema": meta.input_schema(),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({"tools": tools}))).into_response()
}

async fn handle_execute(
    State(server): State<Arc<ToolServer>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    if !server.authorize(&headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "Access denied"}))).into_response();
    }
    let tool_name = payload.get("tool").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let parameters = payload.get("parameters").cloned().unwrap_or(json!({}));

    match server.execute(&tool_name, parameters).await {
        Ok(result) => (StatusCode::OK, Json(json!({"result": result}))).into_response(),
        Err(e) => {
            let status = match &e {
                EvalError::Validation(_) | EvalError::ToolServer(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"error": e.to_string(), "kind": e.kind()}))).into_response()
        }
    }
}
