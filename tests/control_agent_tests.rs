use async_trait::async_trait;
use serde_json::json;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

use webeval::a2a::{Message, Part, Role, Task};
use webeval::actions::Action;
use webeval::assessment::OrchestratorStatus;
use webeval::browser::{
    BrowserBackend, BrowserEnv, EnvironmentConfig, SessionManager, StepOutcome,
};
use webeval::control_agent::{
    AssessmentCommand, ChatMessage, ControlAgent, LlmClient, LlmReply, LlmToolCall, ToolDefinition,
};
use webeval::error::EvalError;
use webeval::observation::{ObservationFilter, RawObservation};
use webeval::orchestrator::{Orchestrator, OrchestratorDeps};
use webeval::participant::TaskSender;
use webeval::profiles::BenchmarkProfileRegistry;
use webeval::scoring::PenaltyCalculator;
use webeval::shared_state::SharedStateStore;
use webeval::streaming::EventBus;
use webeval::tool_server::{ToolDeps, ToolServer};

/// LLM that replays a scripted sequence of replies.
struct ScriptedLlm {
    replies: Mutex<Vec<LlmReply>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(mut replies: Vec<LlmReply>) -> Arc<Self> {
        replies.reverse();
        Arc::new(Self {
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn send(
        &self,
        _messages: &[ChatMessage],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LlmReply, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(tools.map(|t| t.len()), Some(3), "exactly three tools are bound");
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(LlmReply {
                content: "out of script".to_string(),
                tool_calls: vec![],
            }))
    }

    fn model_name(&self) -> &str {
        "scripted"
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

struct IdleParticipant;

#[async_trait]
impl TaskSender for IdleParticipant {
    async fn send_task(&self, _message: &Message, _timeout: Duration) -> Result<Task, EvalError> {
        Ok(Task::new("participant-side"))
    }
}

fn agent_with(llm: Arc<dyn LlmClient>) -> ControlAgent {
    let registry = Arc::new(BenchmarkProfileRegistry::new());
    let factory_registry = registry.clone();
    ControlAgent::new(
        llm,
        registry,
        Box::new(move |assessment, context_id, a2a_task_id| {
            let sessions = Arc::new(
                SessionManager::new(Box::new(NullBackend), PathBuf::from("/nonexistent"), true)
                    .unwrap(),
            );
            let shared_state = Arc::new(SharedStateStore::new(assessment.config.max_tool_calls));
            let filter = Arc::new(ObservationFilter::new(5000));
            let registry = factory_registry.clone();
            let tool_server = Arc::new(ToolServer::new(ToolDeps {
                sessions: sessions.clone(),
                shared_state: shared_state.clone(),
                filter: filter.clone(),
                registry: registry.clone(),
            }));
            Orchestrator::new(
                Arc::new(RwLock::new(assessment)),
                OrchestratorDeps {
                    sessions,
                    shared_state,
                    tool_server,
                    filter,
                    registry,
                    participant: Arc::new(IdleParticipant),
                    events: Arc::new(EventBus::new()),
                    calculator: PenaltyCalculator::default(),
                    tool_server_url: "http://127.0.0.1:8081".to_string(),
                    send_timeout: Duration::from_secs(1),
                    poll_interval: Duration::from_millis(25),
                    context_id: context_id.to_string(),
                    a2a_task_id: a2a_task_id.to_string(),
                },
            )
        }),
    )
}

fn config_json() -> serde_json::Value {
    json!({
        "run_id": "run-9",
        "benchmarks": ["webarena"],
        "tasks_by_benchmark": {"webarena": ["webarena.nav-1"]},
        "timeout_seconds": 1,
        "participants": {
            "participant": {"role": "participant", "endpoint": "http://127.0.0.1:9010"}
        },
    })
}

#[tokio::test]
async fn test_prose_message_needs_no_assessment() {
    let llm = ScriptedLlm::new(vec![LlmReply {
        content: "Hello! Send an assessment configuration to begin.".to_string(),
        tool_calls: vec![],
    }]);
    let agent = agent_with(llm.clone());

    let mut orchestrator = None;
    let reply = agent
        .handle_message(&Message::user_text("hi there"), "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap();

    assert!(reply.contains("assessment configuration"));
    assert!(orchestrator.is_none(), "prose must not create an assessment");
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_config_data_part_creates_and_starts_assessment() {
    let llm = ScriptedLlm::new(vec![
        LlmReply {
            content: String::new(),
            tool_calls: vec![LlmToolCall {
                name: "start_assessment".to_string(),
                arguments: json!({}),
            }],
        },
        LlmReply {
            content: "Assessment started with 1 task.".to_string(),
            tool_calls: vec![],
        },
    ]);
    let agent = agent_with(llm);

    let message = Message::new(
        Role::User,
        vec![Part::data(config_json()), Part::text("please run this assessment")],
    );
    let mut orchestrator = None;
    let reply = agent
        .handle_message(&message, "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap();

    assert_eq!(reply, "Assessment started with 1 task.");
    let orchestrator = orchestrator.expect("assessment must be associated with the context");
    let assessment = orchestrator.assessment();
    let status = assessment.read().await.orchestrator_status;
    assert_ne!(status, OrchestratorStatus::Idle, "start_assessment must have run");
}

#[tokio::test]
async fn test_config_in_text_part_is_parsed() {
    let agent = agent_with(ScriptedLlm::new(vec![LlmReply {
        content: "ok".to_string(),
        tool_calls: vec![],
    }]));

    let message = Message::user_text(config_json().to_string());
    let mut orchestrator = None;
    agent
        .handle_message(&message, "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap();
    assert!(orchestrator.is_some());
}

#[tokio::test]
async fn test_invalid_config_is_validation_error() {
    let agent = agent_with(ScriptedLlm::new(vec![]));

    let bad = json!({
        "run_id": "run-9",
        "benchmarks": ["minesweeper"],
        "tasks_by_benchmark": {"minesweeper": ["minesweeper.easy"]},
    });
    let message = Message::new(Role::User, vec![Part::data(bad)]);
    let mut orchestrator = None;
    let err = agent
        .handle_message(&message, "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
    assert!(orchestrator.is_none());
}

#[tokio::test]
async fn test_unsafe_participant_endpoint_is_rejected() {
    let agent = agent_with(ScriptedLlm::new(vec![]));

    let mut config = config_json();
    config["participants"]["participant"]["endpoint"] = json!("javascript:alert(1)");
    let message = Message::new(Role::User, vec![Part::data(config)]);
    let mut orchestrator = None;
    let err = agent
        .handle_message(&message, "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
    assert!(orchestrator.is_none());
}

#[tokio::test]
async fn test_unknown_tool_call_is_reported_not_fatal() {
    let llm = ScriptedLlm::new(vec![
        LlmReply {
            content: String::new(),
            tool_calls: vec![LlmToolCall {
                name: "execute_actions".to_string(),
                arguments: json!({}),
            }],
        },
        LlmReply {
            content: "I only control assessments.".to_string(),
            tool_calls: vec![],
        },
    ]);
    let agent = agent_with(llm);

    let mut orchestrator = None;
    let reply = agent
        .handle_message(&Message::user_text("click the button for me"), "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap();
    assert_eq!(reply, "I only control assessments.");
}

#[tokio::test]
async fn test_commands_without_assessment() {
    let agent = agent_with(ScriptedLlm::new(vec![]));
    for command in [
        AssessmentCommand::Start,
        AssessmentCommand::Status,
        AssessmentCommand::Result,
    ] {
        let result = agent.execute_command(command, None).await;
        assert_eq!(result["status"], "error");
    }
}

#[tokio::test]
async fn test_result_before_start_reports_not_started() {
    let agent = agent_with(ScriptedLlm::new(vec![LlmReply {
        content: "configured".to_string(),
        tool_calls: vec![],
    }]));

    let message = Message::new(Role::User, vec![Part::data(config_json())]);
    let mut orchestrator = None;
    agent
        .handle_message(&message, "ctx-1", "task-1", &mut orchestrator)
        .await
        .unwrap();

    let result = agent
        .execute_command(AssessmentCommand::Result, orchestrator.as_ref())
        .await;
    assert_eq!(result["status"], "not_started");

    let status = agent
        .execute_command(AssessmentCommand::Status, orchestrator.as_ref())
        .await;
    assert_eq!(status["status"], "idle");
}
