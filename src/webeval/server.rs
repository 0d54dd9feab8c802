//! A2A server and streaming surface.
//!
//! The evaluator's inbound surface: agent-discovery documents at the
//! well-known paths, a JSON-RPC message endpoint, liveness/readiness probes,
//! a direct `/evaluate` kickoff endpoint, and a per-interaction SSE stream
//! of lifecycle events. Inbound messages that lack a valid structure are
//! rejected with an `InvalidParams` error; everything else is converted into
//! an A2A task whose lifecycle is observable on the stream.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::webeval::a2a::{Message, Task, TaskState};
use crate::webeval::agent_card::{build_agent_card, build_extended_agent_card};
use crate::webeval::assessment::{Assessment, AssessmentConfig, OrchestratorStatus};
use crate::webeval::browser::{BrowserBackend, SessionManager};
use crate::webeval::config::Settings;
use crate::webeval::control_agent::{ControlAgent, LlmClient, OrchestratorFactory};
use crate::webeval::error::EvalError;
use crate::webeval::observation::ObservationFilter;
use crate::webeval::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::webeval::participant::HttpParticipantClient;
use crate::webeval::profiles::BenchmarkProfileRegistry;
use crate::webeval::scoring::PenaltyCalculator;
use crate::webeval::security::{sanitize_assessment_config, RateLimiter};
use crate::webeval::session_store::SessionStore;
use crate::webeval::shared_state::SharedStateStore;
use crate::webeval::streaming::EventBus;
use crate::webeval::tool_server::{start_tool_server, ToolDeps, ToolServer};

/// JSON-RPC error code for invalid params.
const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for method-not-found.
const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for internal errors.
const INTERNAL_ERROR: i64 = -32603;
/// JSON-RPC error code for throttled requests.
const RATE_LIMITED: i64 = -32000;

/// Shared evaluator components, built once at startup.
pub struct EvaluatorCore {
    pub settings: Settings,
    pub registry: Arc<BenchmarkProfileRegistry>,
    pub sessions: Arc<SessionManager>,
    pub shared_state: Arc<SharedStateStore>,
    pub filter: Arc<ObservationFilter>,
    pub tool_server: Arc<ToolServer>,
    pub events: Arc<EventBus>,
    pub calculator: PenaltyCalculator,
    /// Per-endpoint request throttle; `None` when disabled by configuration.
    pub rate_limiter: Option<RateLimiter>,
    /// Tool-server URL advertised to participants.
    pub tool_server_url: String,
}

impl EvaluatorCore {
    /// Wire the core components around a browser backend.
    pub fn new(settings: Settings, backend: Box<dyn BrowserBackend>) -> Result<Arc<Self>, EvalError> {
        let registry = Arc::new(BenchmarkProfileRegistry::new());
        let sessions = Arc::new(SessionManager::new(
            backend,
            settings.dataset_root.clone(),
            settings.headless,
        )?);
        let shared_state = Arc::new(SharedStateStore::new(settings.max_tool_calls));
        let filter = Arc::new(ObservationFilter::new(settings.token_limit_per_observation));
        let tool_server = Arc::new(ToolServer::new(ToolDeps {
            sessions: sessions.clone(),
            shared_state: shared_state.clone(),
            filter: filter.clone(),
            registry: registry.clone(),
        }));
        let calculator = PenaltyCalculator::new(settings.lambda_c, settings.lambda_l);
        let tool_server_url = format!("http://{}", settings.tool_server_addr());
        let rate_limiter = if settings.rate_limit_enabled {
            Some(RateLimiter::new(settings.rate_limit_requests_per_minute, None))
        } else {
            None
        };

        Ok(Arc::new(Self {
            settings,
            registry,
            sessions,
            shared_state,
            filter,
            tool_server,
            events: Arc::new(EventBus::new()),
            calculator,
            rate_limiter,
            tool_server_url,
        }))
    }

    /// Factory that binds orchestrators for newly configured assessments to
    /// this core's collaborators.
    pub fn orchestrator_factory(self: &Arc<Self>) -> OrchestratorFactory {
        let core = self.clone();
        Box::new(move |assessment: Assessment, context_id: &str, a2a_task_id: &str| {
            let endpoint = assessment.config.primary_endpoint().unwrap_or("").to_string();
            let deps = OrchestratorDeps {
                sessions: core.sessions.clone(),
                shared_state: core.shared_state.clone(),
                tool_server: core.tool_server.clone(),
                filter: core.filter.clone(),
                registry: core.registry.clone(),
                participant: Arc::new(HttpParticipantClient::new(endpoint)),
                events: core.events.clone(),
                calculator: core.calculator,
                tool_server_url: core.tool_server_url.clone(),
                send_timeout: Duration::from_secs(core.settings.send_timeout_seconds),
                poll_interval: Duration::from_millis(core.settings.poll_interval_ms),
                context_id: context_id.to_string(),
                a2a_task_id: a2a_task_id.to_string(),
            };
            Orchestrator::new(Arc::new(RwLock::new(assessment)), deps)
        })
    }
}

/// Per-context state: the orchestrator once an assessment is configured.
#[derive(Default)]
struct ContextEntry {
    orchestrator: Option<Arc<Orchestrator>>,
}

/// Axum application state.
#[derive(Clone)]
pub struct AppState {
    core: Arc<EvaluatorCore>,
    agent: Arc<ControlAgent>,
    contexts: Arc<RwLock<HashMap<String, ContextEntry>>>,
    session_store: Option<Arc<SessionStore>>,
    agent_url: String,
    tool_server_ready: bool,
}

impl AppState {
    pub fn new(
        core: Arc<EvaluatorCore>,
        llm: Arc<dyn LlmClient>,
        session_store: Option<Arc<SessionStore>>,
        tool_server_ready: bool,
    ) -> Self {
        let agent = Arc::new(ControlAgent::new(
            llm,
            core.registry.clone(),
            core.orchestrator_factory(),
        ));
        let agent_url = format!("http://{}", core.settings.evaluator_addr());
        Self {
            core,
            agent,
            contexts: Arc::new(RwLock::new(HashMap::new())),
            session_store,
            agent_url,
            tool_server_ready,
        }
    }
}

/// Build the evaluator's router.
pub fn evaluator_router(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/agent-card.json", get(handle_agent_card))
        .route("/.well-known/agent.json", get(handle_agent_card))
        .route("/", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/health/live", get(handle_health_live))
        .route("/health/ready", get(handle_health_ready))
        .route("/evaluate", post(handle_evaluate))
        .route("/stream/{interaction_id}", get(handle_stream))
        .with_state(state)
}

/// Run the evaluator: bind the tool server, then serve the A2A surface
/// until the process is stopped. Startup failures (port in use, invalid
/// configuration) surface in the returned error for the embedding CLI to
/// map to a nonzero exit.
pub async fn serve(
    settings: Settings,
    backend: Box<dyn BrowserBackend>,
    llm: Arc<dyn LlmClient>,
) -> Result<(), EvalError> {
    let session_store = if settings.sessions_persistent {
        let store = SessionStore::open(&settings.sessions_db_path)
            .map_err(|e| EvalError::Configuration(format!("session store: {}", e)))?;
        Some(Arc::new(store))
    } else {
        None
    };

    let core = EvaluatorCore::new(settings, backend)?;
    let tool_addr = core.settings.tool_server_addr();
    start_tool_server(core.tool_server.clone(), &tool_addr).await?;

    let state = AppState::new(core.clone(), llm, session_store, true);
    let app = evaluator_router(state);

    let addr = core.settings.evaluator_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EvalError::Configuration(format!("evaluator bind {}: {}", addr, e)))?;
    log::info!("evaluator listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| EvalError::Configuration(format!("evaluator server: {}", e)))
}

async fn handle_agent_card(State(state): State<AppState>) -> impl IntoResponse {
    let card = build_agent_card(&state.agent_url, &state.core.registry);
    (StatusCode::OK, Json(serde_json::to_value(&card).unwrap_or(json!({}))))
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn handle_health_live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

async fn handle_health_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.tool_server_ready {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "tool server not bound"})),
        )
    }
}

fn rpc_error(id: serde_json::Value, code: i64, message: String) -> Json<serde_json::Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

async fn handle_rpc(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let id = body.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");

    match method {
        "message/send" => {
            // Throttle before any parsing work, keyed by the caller's
            // context so one interaction cannot starve the endpoint.
            let client = body
                .pointer("/params/message/contextId")
                .and_then(|v| v.as_str())
                .unwrap_or("anonymous");
            if let Some(limiter) = &state.core.rate_limiter {
                if let Err(e) = limiter.check("message/send", client) {
                    return rpc_error(id, RATE_LIMITED, e.to_string());
                }
            }

            let message_value = body.pointer("/params/message").cloned();
            let message: Message = match message_value.and_then(|v| serde_json::from_value(v).ok()) {
                Some(message) => message,
                None => {
                    return rpc_error(
                        id,
                        INVALID_PARAMS,
                        "params.message is missing or malformed".to_string(),
                    );
                }
            };
            match handle_inbound_message(&state, message).await {
                Ok(task) => Json(json!({"jsonrpc": "2.0", "id": id, "result": task})),
                Err(EvalError::Validation(msg)) => rpc_error(id, INVALID_PARAMS, msg),
                Err(e) => rpc_error(id, INTERNAL_ERROR, e.to_string()),
            }
        }
        "agent/getCard" => {
            let card = build_extended_agent_card(
                &state.agent_url,
                &state.core.registry,
                &state.core.calculator,
                state.core.settings.token_limit_per_observation,
            );
            Json(json!({"jsonrpc": "2.0", "id": id, "result": card}))
        }
        other => rpc_error(id, METHOD_NOT_FOUND, format!("unknown method: {}", other)),
    }
}

/// Process one inbound A2A message: validate, create the task, route to the
/// control agent, and emit lifecycle events on the context stream.
async fn handle_inbound_message(state: &AppState, message: Message) -> Result<Task, EvalError> {
    message.validate()?;

    let context_id = message
        .context_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut task = Task::new(context_id.clone());

    state
        .core
        .events
        .emit_status(&context_id, &task.id, TaskState::Submitted, "message received", false)
        .await;

    if let Some(store) = &state.session_store {
        if let Err(e) = store.append(&context_id, "user", &message.text_content()) {
            log::warn!("session store append failed: {}", e);
        }
    }

    let outbound = {
        let mut contexts = state.contexts.write().await;
        let entry = contexts.entry(context_id.clone()).or_default();
        state
            .agent
            .handle_message(&message, &context_id, &task.id, &mut entry.orchestrator)
            .await?
    };

    if let Some(store) = &state.session_store {
        if let Err(e) = store.append(&context_id, "agent", &outbound) {
            log::warn!("session store append failed: {}", e);
        }
    }

    // While the orchestrator is running the task stays in Working; its final
    // status-update arrives from the orchestrator on this context's stream.
    let assessment_running = {
        let contexts = state.contexts.read().await;
        match contexts.get(&context_id).and_then(|e| e.orchestrator.as_ref()) {
            Some(orchestrator) => {
                let assessment = orchestrator.assessment();
                let status = assessment.read().await.orchestrator_status;
                status == OrchestratorStatus::Running
            }
            None => false,
        }
    };

    task.update_status(TaskState::Working, Some(outbound.clone()))?;
    if !assessment_running {
        task.update_status(TaskState::Completed, Some(outbound))?;
        state
            .core
            .events
            .emit_status(
                &context_id,
                &task.id,
                TaskState::Completed,
                task.status.message.as_deref().unwrap_or(""),
                true,
            )
            .await;
    }
    Ok(task)
}

/// Direct kickoff endpoint: accepts an assessment configuration, creates the
/// interaction, and starts the orchestrator immediately.
async fn handle_evaluate(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    // Evaluations are expensive: one browser, one orchestrator. Throttle
    // the endpoint as a whole before touching the payload.
    if let Some(limiter) = &state.core.rate_limiter {
        if let Err(e) = limiter.check("evaluate", "global") {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": e.to_string()})),
            );
        }
    }

    let config_value = body.get("config").cloned().unwrap_or(body);
    let config: AssessmentConfig = match serde_json::from_value(config_value) {
        Ok(config) => config,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid assessment config: {}", e)})),
            );
        }
    };
    if let Err(e) = config.validate(&state.core.registry) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})));
    }
    if let Err(e) = sanitize_assessment_config(&config) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})));
    }

    let interaction_id = Uuid::new_v4().to_string();
    let task = Task::new(interaction_id.clone());
    let factory = state.core.orchestrator_factory();
    let orchestrator = factory(Assessment::new(config), &interaction_id, &task.id);
    let started = orchestrator.start().await;

    state
        .contexts
        .write()
        .await
        .insert(interaction_id.clone(), ContextEntry { orchestrator: Some(orchestrator) });

    (
        StatusCode::OK,
        Json(json!({
            "interaction_id": interaction_id,
            "task_id": task.id,
            "started": started,
            "stream": format!("/stream/{}", interaction_id),
        })),
    )
}

async fn handle_stream(
    State(state): State<AppState>,
    AxumPath(interaction_id): AxumPath<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    let receiver = state.core.events.subscribe(&interaction_id).await;
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).ok()?;
                Some(Ok(Event::default().data(data)))
            }
            // A lagged subscriber skips dropped events rather than erroring.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
