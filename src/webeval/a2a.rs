//! A2A message, task, and artifact model.
//!
//! Wire shapes follow the A2A protocol: every envelope is `kind`-tagged and
//! field names are camelCase. Structured payloads travel as `data` parts and
//! human-readable text as `text` parts — senders compose the envelope,
//! receivers extract by part kind. Wrapping a JSON blob inside a text part
//! is a bug because downstream extraction looks for parts whose kind is
//! `data`.
//!
//! # Example
//!
//! ```rust
//! use webeval::a2a::{Message, Part, Role, Task, TaskState};
//!
//! let message = Message::new(
//!     Role::User,
//!     vec![
//!         Part::data(serde_json::json!({"task_id": "miniwob.click-test"})),
//!         Part::text("Complete the task."),
//!     ],
//! );
//! assert!(message.first_data().is_some());
//!
//! let mut task = Task::new("ctx-1");
//! task.update_status(TaskState::Working, None).unwrap();
//! task.update_status(TaskState::Completed, Some("done".to_string())).unwrap();
//! assert!(task.status.state.is_terminal());
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::webeval::error::EvalError;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// File payload carried by a file part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Base64-encoded bytes for inline files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
}

/// One part of a message or artifact. Exactly one of text, data, or file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: serde_json::Value },
    File { file: FileContent },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn data(data: serde_json::Value) -> Self {
        Part::Data { data }
    }
}

/// An A2A message: a role and at least one part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl Message {
    /// Build a message with the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            kind: "message".to_string(),
            role,
            parts,
            message_id: Uuid::new_v4().to_string(),
            context_id: None,
        }
    }

    /// Convenience constructor for a single-text-part agent message.
    ///
    /// # Example
    ///
    /// ```rust
    /// use webeval::a2a::{Message, Role};
    ///
    /// let message = Message::agent_text("Assessment complete.");
    /// assert_eq!(message.role, Role::Agent);
    /// assert_eq!(message.text_content(), "Assessment complete.");
    /// ```
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, vec![Part::text(text)])
    }

    /// Convenience constructor for a single-text-part user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Structural validation: kind tag and non-empty parts.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.kind != "message" {
            return Err(EvalError::Validation(format!(
                "expected kind \"message\", got {:?}",
                self.kind
            )));
        }
        if self.parts.is_empty() {
            return Err(EvalError::Validation(
                "message must contain at least one part".to_string(),
            ));
        }
        Ok(())
    }

    /// Concatenated text of all text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first data part's payload, when present.
    pub fn first_data(&self) -> Option<&serde_json::Value> {
        self.parts.iter().find_map(|p| match p {
            Part::Data { data } => Some(data),
            _ => None,
        })
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Canceled)
    }

    /// Legal transitions of the task state machine:
    /// submitted → working → (input-required ⇄ working)* → terminal.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            TaskState::Submitted => matches!(
                next,
                TaskState::Working | TaskState::Completed | TaskState::Failed | TaskState::Canceled
            ),
            TaskState::Working => matches!(
                next,
                TaskState::InputRequired
                    | TaskState::Completed
                    | TaskState::Failed
                    | TaskState::Canceled
            ),
            TaskState::InputRequired => {
                matches!(next, TaskState::Working | TaskState::Failed | TaskState::Canceled)
            }
            _ => false,
        }
    }
}

/// Current status of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl TaskStatus {
    pub fn new(state: TaskState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// A named, ordered-parts record attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub name: String,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Artifact {
    /// Create an artifact with a fresh id and the given ordered parts.
    ///
    /// # Example
    ///
    /// ```rust
    /// use webeval::a2a::{Artifact, Part};
    ///
    /// let artifact = Artifact::new(
    ///     "assessment_result",
    ///     vec![Part::data(serde_json::json!({"passed_tasks": 3}))],
    /// )
    /// .with_description("aggregate results");
    /// assert_eq!(artifact.parts.len(), 1);
    /// assert!(artifact.description.is_some());
    /// ```
    pub fn new(name: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            artifact_id: Uuid::new_v4().to_string(),
            name: name.into(),
            parts,
            description: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An A2A task with its status and append-only artifact sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub context_id: String,
    pub status: TaskStatus,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Task {
    /// Create a freshly submitted task in the given context.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            status: TaskStatus::new(TaskState::Submitted, None),
            kind: "task".to_string(),
            artifacts: Vec::new(),
        }
    }

    /// Advance the task state, rejecting updates after a terminal state.
    ///
    /// # Example
    ///
    /// ```rust
    /// use webeval::a2a::{Task, TaskState};
    ///
    /// let mut task = Task::new("ctx-1");
    /// task.update_status(TaskState::Working, None).unwrap();
    /// task.update_status(TaskState::Failed, None).unwrap();
    /// // Terminal states admit no further transitions.
    /// assert!(task.update_status(TaskState::Working, None).is_err());
    /// ```
    pub fn update_status(
        &mut self,
        state: TaskState,
        message: Option<String>,
    ) -> Result<(), EvalError> {
        if !self.status.state.can_transition_to(state) {
            return Err(EvalError::Validation(format!(
                "illegal task transition {:?} -> {:?}",
                self.status.state, state
            )));
        }
        self.status = TaskStatus::new(state, message);
        Ok(())
    }

    /// Append an artifact to the task.
    pub fn add_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }
}

/// SSE `status-update` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    pub kind: String,
    pub task_id: String,
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// SSE `artifact-update` event, carrying a new artifact or a chunked append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    pub kind: String,
    pub task_id: String,
    pub context_id: String,
    pub artifact: Artifact,
    pub append: bool,
    pub last_chunk: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::agent_text("hello").with_context_id("ctx-1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["role"], "agent");
        assert_eq!(value["parts"][0]["kind"], "text");
        assert_eq!(value["parts"][0]["text"], "hello");
        assert_eq!(value["contextId"], "ctx-1");
        assert!(value["messageId"].is_string());
    }

    #[test]
    fn test_data_part_round_trip() {
        let payload = json!({"task_id": "miniwob.click-test", "limits": {"max_tool_calls": 3}});
        let msg = Message::new(Role::User, vec![Part::data(payload.clone())]);

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.first_data(), Some(&payload));
    }

    #[test]
    fn test_empty_parts_rejected() {
        let msg = Message::new(Role::User, vec![]);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_text_extraction_skips_data_parts() {
        let msg = Message::new(
            Role::User,
            vec![
                Part::data(json!({"a": 1})),
                Part::text("first"),
                Part::text("second"),
            ],
        );
        assert_eq!(msg.text_content(), "first\nsecond");
    }

    #[test]
    fn test_task_state_serialization() {
        assert_eq!(
            serde_json::to_value(TaskState::InputRequired).unwrap(),
            json!("input-required")
        );
        assert_eq!(serde_json::to_value(TaskState::Working).unwrap(), json!("working"));
    }

    #[test]
    fn test_task_state_machine() {
        assert!(TaskState::Submitted.can_transition_to(TaskState::Working));
        assert!(TaskState::Working.can_transition_to(TaskState::InputRequired));
        assert!(TaskState::InputRequired.can_transition_to(TaskState::Working));
        assert!(TaskState::Working.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Working));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Canceled.can_transition_to(TaskState::Canceled));
    }

    #[test]
    fn test_task_rejects_updates_after_terminal() {
        let mut task = Task::new("ctx-1");
        task.update_status(TaskState::Working, None).unwrap();
        task.update_status(TaskState::Completed, Some("done".into())).unwrap();
        let err = task.update_status(TaskState::Working, None).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_artifacts_are_append_only_in_order() {
        let mut task = Task::new("ctx-1");
        task.add_artifact(Artifact::new("first", vec![Part::text("a")]));
        task.add_artifact(Artifact::new("second", vec![Part::text("b")]));
        assert_eq!(task.artifacts.len(), 2);
        assert_eq!(task.artifacts[0].name, "first");
        assert_eq!(task.artifacts[1].name, "second");
    }

    #[test]
    fn test_status_event_final_field_name() {
        let event = TaskStatusUpdateEvent {
            kind: "status-update".to_string(),
            task_id: "t1".to_string(),
            context_id: "c1".to_string(),
            status: TaskStatus::new(TaskState::Completed, None),
            is_final: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["final"], true);
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["contextId"], "c1");
        assert_eq!(value["status"]["state"], "completed");
    }

    #[test]
    fn test_artifact_event_wire_shape() {
        let event = TaskArtifactUpdateEvent {
            kind: "artifact-update".to_string(),
            task_id: "t1".to_string(),
            context_id: "c1".to_string(),
            artifact: Artifact::new("assessment_result", vec![Part::data(json!({"ok": true}))]),
            append: false,
            last_chunk: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["artifact"]["name"], "assessment_result");
        assert!(value["artifact"]["artifactId"].is_string());
        assert_eq!(value["lastChunk"], true);
        assert_eq!(value["append"], false);
    }
}
