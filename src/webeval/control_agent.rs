//! LLM control agent for the evaluator endpoint.
//!
//! Every inbound A2A message is handled here. The agent binds exactly three
//! tools — `start_assessment`, `get_assessment_status`,
//! `get_assessment_result` — and forwards the user text to the LLM; the
//! LLM's structured tool-call output is authoritative, tool calls are never
//! parsed out of free text. The agent does not drive the task loop, does not
//! poll, and does not retry: that is the orchestrator's job.

use async_trait::async_trait;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

use crate::webeval::a2a::Message;
use crate::webeval::assessment::{Assessment, AssessmentConfig, OrchestratorStatus};
use crate::webeval::error::EvalError;
use crate::webeval::orchestrator::Orchestrator;
use crate::webeval::profiles::BenchmarkProfileRegistry;
use crate::webeval::security::sanitize_assessment_config;

/// Follow-up LLM round-trips allowed within one inbound message.
const MAX_TOOL_ITERATIONS: usize = 5;

/// Chat roles understood by the LLM seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message exchanged with the LLM.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: content.into() }
    }
}

/// Tool schema passed to the LLM along with a chat request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A structured tool call returned by the LLM.
#[derive(Debug, Clone)]
pub struct LlmToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The LLM's reply: final text and any requested tool calls.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub tool_calls: Vec<LlmToolCall>,
}

/// Provider-agnostic LLM client seam. The concrete provider client is an
/// external collaborator; tests plug in scripted implementations.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LlmReply, Box<dyn Error + Send + Sync>>;

    fn model_name(&self) -> &str;
}

/// The three assessment-control commands exposed to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentCommand {
    Start,
    Status,
    Result,
}

impl AssessmentCommand {
    /// Resolve a tool name from the LLM's structured tool-call output.
    ///
    /// # Example
    ///
    /// ```rust
    /// use webeval::control_agent::AssessmentCommand;
    ///
    /// assert_eq!(
    ///     AssessmentCommand::parse("start_assessment"),
    ///     Some(AssessmentCommand::Start)
    /// );
    /// // Anything outside the three commands is rejected, never guessed.
    /// assert_eq!(AssessmentCommand::parse("execute_actions"), None);
    /// ```
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "start_assessment" => Some(AssessmentCommand::Start),
            "get_assessment_status" => Some(AssessmentCommand::Status),
            "get_assessment_result" => Some(AssessmentCommand::Result),
            _ => None,
        }
    }

    /// Tool definitions bound on every LLM call.
    pub fn definitions() -> Vec<ToolDefinition> {
        let empty_schema = json!({"type": "object", "properties": {}, "required": []});
        vec![
            ToolDefinition {
                name: "start_assessment".to_string(),
                description: "Start the background assessment. Call once when the participant \
                              is ready; a no-op if already running or complete."
                    .to_string(),
                parameters_schema: empty_schema.clone(),
            },
            ToolDefinition {
                name: "get_assessment_status".to_string(),
                description: "Get current assessment progress and a summary string.".to_string(),
                parameters_schema: empty_schema.clone(),
            },
            ToolDefinition {
                name: "get_assessment_result".to_string(),
                description: "Get the final assessment results once complete.".to_string(),
                parameters_schema: empty_schema,
            },
        ]
    }
}

const AGENT_INSTRUCTIONS: &str = "\
You are the evaluator's control agent for web-automation assessments. \
You manage assessments through exactly three tools: start_assessment, \
get_assessment_status, and get_assessment_result. When a message carries a \
new assessment request, call start_assessment once; the orchestrator runs \
the tasks in the background. Use get_assessment_status for progress \
questions and get_assessment_result for final results. Never attempt to \
drive tasks yourself and answer everything else in plain prose.";

/// Builds orchestrators for newly configured assessments. The server wires
/// this to its shared collaborators.
pub type OrchestratorFactory =
    Box<dyn Fn(Assessment, &str, &str) -> Arc<Orchestrator> + Send + Sync>;

/// Handles inbound messages for one evaluator endpoint.
pub struct ControlAgent {
    client: Arc<dyn LlmClient>,
    registry: Arc<BenchmarkProfileRegistry>,
    orchestrator_factory: OrchestratorFactory,
}

impl ControlAgent {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<BenchmarkProfileRegistry>,
        orchestrator_factory: OrchestratorFactory,
    ) -> Self {
        Self {
            client,
            registry,
            orchestrator_factory,
        }
    }

    /// Try to parse an assessment configuration out of the message: a data
    /// part wins, otherwise the text parts are tried as JSON.
    pub fn parse_assessment_config(
        &self,
        message: &Message,
    ) -> Result<Option<AssessmentConfig>, EvalError> {
        let candidate = message
            .first_data()
            .cloned()
            .or_else(|| serde_json::from_str(message.text_content().trim()).ok());
        let value = match candidate {
            Some(value) if value.is_object() => value,
            _ => return Ok(None),
        };
        match serde_json::from_value::<AssessmentConfig>(value) {
            Ok(config) => {
                config.validate(&self.registry)?;
                sanitize_assessment_config(&config)?;
                Ok(Some(config))
            }
            // Not an assessment config at all; treat as prose.
            Err(_) => Ok(None),
        }
    }

    /// Handle one inbound message for a context.
    ///
    /// When the context has no orchestrator yet and the message parses as an
    /// [`AssessmentConfig`], the assessment is constructed and associated
    /// before the LLM sees the message. Returns the outbound text.
    pub async fn handle_message(
        &self,
        message: &Message,
        context_id: &str,
        a2a_task_id: &str,
        orchestrator: &mut Option<Arc<Orchestrator>>,
    ) -> Result<String, EvalError> {
        message.validate()?;

        if orchestrator.is_none() {
            if let Some(config) = self.parse_assessment_config(message)? {
                log::info!(
                    "context {}: assessment configured with {} tasks",
                    context_id,
                    config.total_task_count()
                );
                let assessment = Assessment::new(config);
                *orchestrator =
                    Some((self.orchestrator_factory)(assessment, context_id, a2a_task_id));
            }
        }

        let mut transcript = vec![
            ChatMessage::system(AGENT_INSTRUCTIONS),
            ChatMessage::user(message.text_content()),
        ];

        for _ in 0..MAX_TOOL_ITERATIONS {
            let reply = self
                .client
                .send(&transcript, Some(AssessmentCommand::definitions()))
                .await
                .map_err(|e| EvalError::ToolServer(format!("llm call failed: {}", e)))?;

            if reply.tool_calls.is_empty() {
                return Ok(reply.content);
            }

            transcript.push(ChatMessage::assistant(reply.content.clone()));
            for call in &reply.tool_calls {
                let result = match AssessmentCommand::parse(&call.name) {
                    Some(command) => self.execute_command(command, orchestrator.as_ref()).await,
                    None => json!({
                        "status": "error",
                        "message": format!("unknown tool: {}", call.name),
                    }),
                };
                transcript.push(ChatMessage::tool(result.to_string()));
            }
        }

        log::warn!("context {}: tool iteration cap reached", context_id);
        Ok("Maximum tool iterations reached while handling the request.".to_string())
    }

    /// Execute one assessment-control command.
    pub async fn execute_command(
        &self,
        command: AssessmentCommand,
        orchestrator: Option<&Arc<Orchestrator>>,
    ) -> serde_json::Value {
        let orchestrator = match orchestrator {
            Some(orchestrator) => orchestrator,
            None => {
                return json!({
                    "status": "error",
                    "message": "No assessment configured. Send an assessment configuration first.",
                });
            }
        };

        match command {
            AssessmentCommand::Start => orchestrator.start().await,
            AssessmentCommand::Status => {
                let assessment = orchestrator.assessment();
                let assessment = assessment.read().await;
                assessment.progress()
            }
            AssessmentCommand::Result => {
                let assessment = orchestrator.assessment();
                let assessment = assessment.read().await;
                match assessment.orchestrator_status {
                    OrchestratorStatus::Idle => json!({
                        "status": "not_started",
                        "message": "Assessment has not been started yet. Call start_assessment first.",
                    }),
                    OrchestratorStatus::Running => json!({
                        "status": "in_progress",
                        "message": format!(
                            "Assessment still running: {}/{} tasks completed.",
                            assessment.completed_count(),
                            assessment.total_tasks()
                        ),
                        "progress": assessment.progress(),
                    }),
                    OrchestratorStatus::Error => json!({
                        "status": "error",
                        "message": format!(
                            "Assessment failed: {}",
                            assessment.orchestrator_error.as_deref().unwrap_or("unknown")
                        ),
                        "partial_results": assessment.build_result_artifact(),
                    }),
                    OrchestratorStatus::Complete => json!({
                        "status": "complete",
                        "message": format!(
                            "Assessment complete: {}/{} tasks passed.",
                            assessment.passed_count(),
                            assessment.total_tasks()
                        ),
                        "results": assessment
                            .result_artifact
                            .clone()
                            .unwrap_or_else(|| assessment.build_result_artifact()),
                    }),
                }
            }
        }
    }

    /// Model identifier of the underlying client, for logging.
    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert_eq!(AssessmentCommand::parse("start_assessment"), Some(AssessmentCommand::Start));
        assert_eq!(
            AssessmentCommand::parse("get_assessment_status"),
            Some(AssessmentCommand::Status)
        );
        assert_eq!(
            AssessmentCommand::parse("get_assessment_result"),
            Some(AssessmentCommand::Result)
        );
        assert_eq!(AssessmentCommand::parse("execute_actions"), None);
    }

    #[test]
    fn test_exactly_three_tool_definitions() {
        let defs = AssessmentCommand::definitions();
        assert_eq!(defs.len(), 3);
        for def in &defs {
            assert_eq!(def.parameters_schema["type"], "object");
        }
    }
}
