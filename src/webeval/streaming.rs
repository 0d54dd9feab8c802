//! Lifecycle event streaming.
//!
//! External observers follow an assessment over server-sent events: a stream
//! of `kind`-tagged records (`status-update`, `artifact-update`) per
//! interaction. The [`EventBus`] fans events out through per-interaction
//! broadcast channels; events are delivered in enqueue order and the stream
//! ends after a status update with `final: true`.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::webeval::a2a::{Artifact, TaskState};

/// Buffered events per interaction channel.
const CHANNEL_CAPACITY: usize = 256;

/// Build a `status-update` event payload.
///
/// # Example
///
/// ```rust
/// use webeval::a2a::TaskState;
/// use webeval::streaming::build_status_update;
///
/// let event = build_status_update("task-1", "ctx-1", TaskState::Working, "task sent", false);
/// assert_eq!(event["kind"], "status-update");
/// assert_eq!(event["status"]["state"], "working");
/// assert_eq!(event["final"], false);
/// ```
pub fn build_status_update(
    task_id: &str,
    context_id: &str,
    state: TaskState,
    message: &str,
    is_final: bool,
) -> serde_json::Value {
    json!({
        "kind": "status-update",
        "taskId": task_id,
        "contextId": context_id,
        "status": {
            "state": state,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        },
        "final": is_final,
    })
}

/// Build an `artifact-update` event payload.
pub fn build_artifact_update(
    task_id: &str,
    context_id: &str,
    artifact: &Artifact,
    append: bool,
    last_chunk: bool,
) -> serde_json::Value {
    let mut artifact_value = json!({
        "artifactId": artifact.artifact_id,
        "name": artifact.name,
        "parts": artifact.parts,
    });
    if let Some(description) = &artifact.description {
        artifact_value["description"] = json!(description);
    }
    if let Some(metadata) = &artifact.metadata {
        artifact_value["metadata"] = metadata.clone();
    }
    json!({
        "kind": "artifact-update",
        "taskId": task_id,
        "contextId": context_id,
        "artifact": artifact_value,
        "append": append,
        "lastChunk": last_chunk,
    })
}

/// Build an artifact-update payload for a raw data payload, wrapping it in a
/// fresh single-data-part artifact.
pub fn build_data_artifact_update(
    task_id: &str,
    context_id: &str,
    name: &str,
    data: serde_json::Value,
) -> serde_json::Value {
    json!({
        "kind": "artifact-update",
        "taskId": task_id,
        "contextId": context_id,
        "artifact": {
            "artifactId": Uuid::new_v4().to_string(),
            "name": name,
            "parts": [{"kind": "data", "data": data}],
        },
        "append": false,
        "lastChunk": true,
    })
}

/// Per-interaction broadcast fan-out for lifecycle events.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to an interaction's event stream, creating the channel if
    /// it does not exist yet.
    pub async fn subscribe(&self, interaction_id: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(interaction_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event on an interaction's stream. Events published before any
    /// subscriber attached are dropped, matching SSE semantics.
    pub async fn emit(&self, interaction_id: &str, event: serde_json::Value) {
        let is_final = event["final"].as_bool().unwrap_or(false);
        {
            let mut channels = self.channels.write().await;
            let sender = channels
                .entry(interaction_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            // Send errors only mean nobody is listening.
            let _ = sender.send(event);
            if is_final {
                // Dropping the sender ends subscriber streams once buffered
                // events drain.
                channels.remove(interaction_id);
            }
        }
    }

    /// Emit a status update, closing the stream when `is_final`.
    pub async fn emit_status(
        &self,
        interaction_id: &str,
        task_id: &str,
        state: TaskState,
        message: &str,
        is_final: bool,
    ) {
        self.emit(
            interaction_id,
            build_status_update(task_id, interaction_id, state, message, is_final),
        )
        .await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
