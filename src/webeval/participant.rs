//! Outbound participant client.
//!
//! The evaluator assigns tasks to the participant over A2A: it resolves the
//! participant's agent card at the well-known discovery path, then sends a
//! single message per task carrying a data part (structured context: task
//! id, tool-server coordinates, limits) and a text part (the human-readable
//! task-details document). A consumer relying only on the text part must be
//! able to drive the task, so the text embeds the full tool documentation.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::webeval::a2a::{Message, Part, Role, Task};
use crate::webeval::error::EvalError;
use crate::webeval::profiles::BenchmarkProfile;
use crate::webeval::security::redact;
use crate::webeval::tool_protocol::{format_tools_documentation, ToolMetadata};

/// Well-known path of the participant's agent card.
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

/// Everything needed to compose a task-assignment message.
pub struct TaskAssignment<'a> {
    pub task_id: &'a str,
    pub benchmark: &'a str,
    pub profile: &'a BenchmarkProfile,
    pub tool_server_url: &'a str,
    pub session_id: Option<&'a str>,
    pub tools: &'a [ToolMetadata],
    pub task_goal: Option<&'a str>,
    pub max_tool_calls: u32,
    pub max_steps: u32,
    pub timeout_seconds: u64,
}

/// Deterministic plain-text task-details document.
pub fn build_task_details_text(assignment: &TaskAssignment<'_>) -> String {
    let banner = "=".repeat(60);
    let profile = assignment.profile;

    let session_line = match assignment.session_id {
        Some(id) => format!("\n- **Session ID**: `{}`", id),
        None => String::new(),
    };

    let goal_section = match assignment.task_goal {
        Some(goal) if !goal.is_empty() => format!("\n## TASK GOAL\n\n{}\n", goal),
        _ => String::new(),
    };

    format!(
        "{banner}\n\
         ASSESSMENT TASK\n\
         {banner}\n\
         \n\
         ## TASK DETAILS\n\
         \n\
         - **Task ID**: `{task_id}`\n\
         - **Benchmark**: {benchmark}\n\
         - **Benchmark Name**: {display_name}\n\
         - **Token Limit**: {token_limit} tokens\n\
         - **Observation Mode**: {mode}\n\
         \n\
         ## INSTRUCTIONS\n\
         \n\
         Complete the browser-based task by interacting with web elements. The \
         environment has been initialized. Use `get_observation` to see the current \
         page state and task goal, then execute actions to achieve it.\n\
         \n\
         **TOOL CALL LIMIT**: You have a maximum of **{max_tool_calls} tool calls** \
         for this task. Plan efficiently!\n\
         - If you exceed the limit, the task will be terminated and marked as incomplete.\n\
         - Use `execute_actions` with multiple actions in one call when possible.\n\
         \n\
         ## TOOL SERVER CONNECTION\n\
         \n\
         - **Transport**: http\n\
         - **URL**: `{url}`{session_line}\n\
         \n\
         {tools_doc}\n\
         {goal_section}\n\
         {banner}",
        banner = banner,
        task_id = assignment.task_id,
        benchmark = assignment.benchmark,
        display_name = profile.display_name,
        token_limit = profile.token_limit,
        mode = profile.observation_mode.as_str(),
        max_tool_calls = assignment.max_tool_calls,
        url = assignment.tool_server_url,
        session_line = session_line,
        tools_doc = format_tools_documentation(assignment.tools),
        goal_section = goal_section,
    )
}

/// Structured context payload for the data part of the task message.
pub fn build_task_context_data(assignment: &TaskAssignment<'_>) -> serde_json::Value {
    json!({
        "task_id": assignment.task_id,
        "benchmark": assignment.benchmark,
        "observation_mode": assignment.profile.observation_mode.as_str(),
        "token_limit": assignment.profile.token_limit,
        "tool_server": {
            "transport": "http",
            "url": assignment.tool_server_url,
            "session_id": assignment.session_id,
        },
        "limits": {
            "max_tool_calls": assignment.max_tool_calls,
            "max_steps": assignment.max_steps,
            "timeout_seconds": assignment.timeout_seconds,
        },
    })
}

/// Compose the task-assignment message: one data part for machines, one text
/// part for humans.
///
/// # Example
///
/// ```rust
/// use webeval::participant::{build_task_message, TaskAssignment};
/// use webeval::profiles::BenchmarkProfileRegistry;
///
/// let registry = BenchmarkProfileRegistry::new();
/// let assignment = TaskAssignment {
///     task_id: "miniwob.click-test",
///     benchmark: "miniwob",
///     profile: registry.get("miniwob").unwrap(),
///     tool_server_url: "http://127.0.0.1:8081",
///     session_id: None,
///     tools: &[],
///     task_goal: Some("Click the button."),
///     max_tool_calls: 3,
///     max_steps: 10,
///     timeout_seconds: 300,
/// };
///
/// let message = build_task_message(&assignment, "ctx-1");
/// let context = message.first_data().unwrap();
/// assert_eq!(context["tool_server"]["transport"], "http");
/// assert!(message.text_content().contains("ASSESSMENT TASK"));
/// ```
pub fn build_task_message(assignment: &TaskAssignment<'_>, context_id: &str) -> Message {
    Message::new(
        Role::User,
        vec![
            Part::data(build_task_context_data(assignment)),
            Part::text(build_task_details_text(assignment)),
        ],
    )
    .with_context_id(context_id)
}

/// Outbound task delivery seam. The HTTP client implements it; tests supply
/// scripted senders.
#[async_trait]
pub trait TaskSender: Send + Sync {
    /// Send a task-assignment message, bounded by the send timeout.
    async fn send_task(&self, message: &Message, timeout: Duration) -> Result<Task, EvalError>;
}

/// A2A client bound to a participant endpoint. The participant's agent card
/// is resolved from the well-known path before the first task is sent and
/// cached for the lifetime of the client.
pub struct HttpParticipantClient {
    endpoint: String,
    http: reqwest::Client,
    card: tokio::sync::Mutex<Option<serde_json::Value>>,
}

impl HttpParticipantClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            card: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolve the card once, reusing the cached copy afterwards.
    async fn ensure_card(&self) -> Result<(), EvalError> {
        let mut card = self.card.lock().await;
        if card.is_none() {
            let resolved = self.resolve_card().await?;
            log::info!(
                "resolved participant card: {} ({})",
                resolved["name"].as_str().unwrap_or("unnamed"),
                redact(&self.endpoint)
            );
            *card = Some(resolved);
        }
        Ok(())
    }

    /// Fetch the participant's agent card from the well-known path.
    pub async fn resolve_card(&self) -> Result<serde_json::Value, EvalError> {
        let url = format!("{}{}", self.endpoint, AGENT_CARD_PATH);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EvalError::Participant(format!("card resolution {}: {}", redact(&url), e)))?;
        if !response.status().is_success() {
            return Err(EvalError::Participant(format!(
                "card resolution {}: HTTP {}",
                redact(&url),
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EvalError::Participant(format!("card decode: {}", e)))
    }
}

#[async_trait]
impl TaskSender for HttpParticipantClient {
    async fn send_task(&self, message: &Message, timeout: Duration) -> Result<Task, EvalError> {
        tokio::time::timeout(timeout, self.ensure_card())
            .await
            .map_err(|_| {
                EvalError::SendTimeout(format!(
                    "participant card did not resolve within {:?}",
                    timeout
                ))
            })??;

        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": "message/send",
            "params": {"message": message},
        });

        let request = self.http.post(&self.endpoint).json(&body).send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| {
                EvalError::SendTimeout(format!(
                    "participant did not accept the task within {:?}",
                    timeout
                ))
            })?
            .map_err(|e| {
                EvalError::Participant(format!("send to {}: {}", redact(&self.endpoint), e))
            })?;

        if !response.status().is_success() {
            return Err(EvalError::Participant(format!(
                "participant returned HTTP {}",
                response.status()
            )));
        }

        let envelope: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EvalError::Participant(format!("response decode: {}", e)))?;
        if let Some(error) = envelope.get("error") {
            if !error.is_null() {
                return Err(EvalError::Participant(format!("participant error: {}", error)));
            }
        }
        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| EvalError::Participant("response missing result".to_string()))?;
        serde_json::from_value(result)
            .map_err(|e| EvalError::Participant(format!("task decode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webeval::profiles::BenchmarkProfileRegistry;
    use crate::webeval::tool_protocol::{ToolParameter, ToolParameterType};

    fn assignment<'a>(
        registry: &'a BenchmarkProfileRegistry,
        tools: &'a [ToolMetadata],
    ) -> TaskAssignment<'a> {
        TaskAssignment {
            task_id: "miniwob.click-test",
            benchmark: "miniwob",
            profile: registry.get("miniwob").unwrap(),
            tool_server_url: "http://127.0.0.1:8081",
            session_id: Some("sess-1"),
            tools,
            task_goal: Some("Click the button."),
            max_tool_calls: 3,
            max_steps: 10,
            timeout_seconds: 300,
        }
    }

    fn sample_tools() -> Vec<ToolMetadata> {
        vec![ToolMetadata::new("execute_actions", "Run browser actions.").with_parameter(
            ToolParameter::new("actions", ToolParameterType::Array).required(),
        )]
    }

    #[test]
    fn test_task_details_text_is_deterministic() {
        let registry = BenchmarkProfileRegistry::new();
        let tools = sample_tools();
        let a = build_task_details_text(&assignment(&registry, &tools));
        let b = build_task_details_text(&assignment(&registry, &tools));
        assert_eq!(a, b);
    }

    #[test]
    fn test_task_details_text_sections() {
        let registry = BenchmarkProfileRegistry::new();
        let tools = sample_tools();
        let text = build_task_details_text(&assignment(&registry, &tools));

        assert!(text.contains("ASSESSMENT TASK"));
        assert!(text.contains("- **Task ID**: `miniwob.click-test`"));
        assert!(text.contains("- **Token Limit**: 2000 tokens"));
        assert!(text.contains("maximum of **3 tool calls**"));
        assert!(text.contains("- **URL**: `http://127.0.0.1:8081`"));
        assert!(text.contains("- **Session ID**: `sess-1`"));
        assert!(text.contains("## AVAILABLE TOOLS"));
        assert!(text.contains("### `execute_actions`"));
        assert!(text.contains("## TASK GOAL"));
        assert!(text.contains("Click the button."));
    }

    #[test]
    fn test_task_message_part_discipline() {
        let registry = BenchmarkProfileRegistry::new();
        let tools = sample_tools();
        let message = build_task_message(&assignment(&registry, &tools), "ctx-9");

        assert_eq!(message.parts.len(), 2);
        let data = message.first_data().expect("structured context must be a data part");
        assert_eq!(data["task_id"], "miniwob.click-test");
        assert_eq!(data["tool_server"]["transport"], "http");
        assert_eq!(data["limits"]["max_tool_calls"], 3);
        assert!(message.text_content().contains("ASSESSMENT TASK"));
        assert_eq!(message.context_id.as_deref(), Some("ctx-9"));
    }

    #[test]
    fn test_goal_section_omitted_when_unknown() {
        let registry = BenchmarkProfileRegistry::new();
        let tools = sample_tools();
        let mut a = assignment(&registry, &tools);
        a.task_goal = None;
        let text = build_task_details_text(&a);
        assert!(!text.contains("## TASK GOAL"));
    }
}
