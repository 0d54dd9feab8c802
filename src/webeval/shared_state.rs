//! Shared per-session evaluation state.
//!
//! The [`SharedStateStore`] is the single source of truth for per-task
//! counters and completion flags. The tool server writes to it on every
//! invocation, the orchestrator polls it to detect completion, and the final
//! snapshot feeds the task artifact. Local counters elsewhere are for
//! logging only and are reconciled from here before artifacts are built.
//!
//! Updates for a given session id are serialized by the store's lock and the
//! lock is never held across a suspension point, so snapshots are always
//! internally consistent.
//!
//! # Example
//!
//! ```rust
//! use webeval::shared_state::{SharedStateStore, ToolInvocation};
//!
//! # async {
//! let store = SharedStateStore::new(3);
//! store.initialize("session-1", "miniwob").await;
//!
//! match store.record_tool_invocation("session-1", "execute_actions").await? {
//!     ToolInvocation::Recorded(count) => assert_eq!(count, 1),
//!     ToolInvocation::LimitExceeded(_) => unreachable!(),
//! }
//!
//! store.record_observation("session-1", 1200).await?;
//! let state = store.read("session-1").await?;
//! assert_eq!(state.total_tokens, 1200);
//! assert!(!state.is_complete());
//! # Ok::<(), webeval::EvalError>(())
//! # };
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::webeval::error::EvalError;

/// Authoritative per-session counters and flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedState {
    pub benchmark: String,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    pub action_count: u64,
    pub observation_count: u64,
    pub tool_invocation_count: u32,
    pub current_tool_name: Option<String>,
    pub task_completed: bool,
    pub done: bool,
    pub truncated: bool,
    pub task_success: bool,
    pub final_reward: f64,
    pub cleanup_called: bool,
    pub error: Option<String>,
}

impl SharedState {
    /// Completion predicate used by the orchestrator's poll loop.
    pub fn is_complete(&self) -> bool {
        self.cleanup_called || (self.task_completed && self.done)
    }
}

/// Outcome of recording a tool invocation against the per-task ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolInvocation {
    /// The invocation is within the ceiling; carries the new count.
    Recorded(u32),
    /// The invocation breached the ceiling; carries the breaching count.
    /// The caller must not execute the tool.
    LimitExceeded(u32),
}

/// Process-wide store of [`SharedState`] keyed by session id.
#[derive(Clone)]
pub struct SharedStateStore {
    entries: Arc<RwLock<HashMap<String, SharedState>>>,
    max_tool_calls: u32,
}

impl SharedStateStore {
    /// Create a store enforcing the given per-task tool-call ceiling.
    pub fn new(max_tool_calls: u32) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_tool_calls,
        }
    }

    /// The configured per-task tool-call ceiling.
    pub fn max_tool_calls(&self) -> u32 {
        self.max_tool_calls
    }

    /// Create a zeroed entry for a new session.
    pub async fn initialize(&self, session_id: &str, benchmark: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            session_id.to_string(),
            SharedState {
                benchmark: benchmark.to_string(),
                ..SharedState::default()
            },
        );
    }

    /// Record a tool invocation and enforce the ceiling.
    ///
    /// The breaching call is still counted, so the final count lands at
    /// ceiling + 1 — the breach detection itself — and saturates there on
    /// any further attempts.
    pub async fn record_tool_invocation(
        &self,
        session_id: &str,
        tool_name: &str,
    ) -> Result<ToolInvocation, EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        if state.tool_invocation_count <= self.max_tool_calls {
            state.tool_invocation_count += 1;
        }
        state.current_tool_name = Some(tool_name.to_string());
        let count = state.tool_invocation_count;
        if count > self.max_tool_calls {
            Ok(ToolInvocation::LimitExceeded(count))
        } else {
            Ok(ToolInvocation::Recorded(count))
        }
    }

    /// Add executed actions and their latency to the running totals.
    pub async fn record_action_batch(
        &self,
        session_id: &str,
        delta_actions: u64,
        delta_latency_ms: u64,
    ) -> Result<(), EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        state.action_count += delta_actions;
        state.total_latency_ms += delta_latency_ms;
        Ok(())
    }

    /// Add a returned observation and its token estimate to the totals.
    pub async fn record_observation(
        &self,
        session_id: &str,
        delta_tokens: u64,
    ) -> Result<(), EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        state.observation_count += 1;
        state.total_tokens += delta_tokens;
        Ok(())
    }

    /// Record a tool or environment error on the session.
    pub async fn record_error(&self, session_id: &str, error: &str) -> Result<(), EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        state.error = Some(error.to_string());
        Ok(())
    }

    /// Set the terminal completion fields and mark the task completed.
    pub async fn finalize(
        &self,
        session_id: &str,
        done: bool,
        truncated: bool,
        task_success: bool,
        final_reward: f64,
    ) -> Result<(), EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        state.done = done;
        state.truncated = truncated;
        state.task_success = task_success;
        state.final_reward = final_reward;
        state.task_completed = true;
        Ok(())
    }

    /// Mark that environment cleanup has been invoked for the session.
    pub async fn mark_cleanup(&self, session_id: &str) -> Result<(), EvalError> {
        let mut entries = self.entries.write().await;
        let state = entry_mut(&mut entries, session_id)?;
        state.cleanup_called = true;
        Ok(())
    }

    /// Return a consistent snapshot of the session state.
    pub async fn read(&self, session_id: &str) -> Result<SharedState, EvalError> {
        let entries = self.entries.read().await;
        entries
            .get(session_id)
            .cloned()
            .ok_or_else(|| unknown_session(session_id))
    }

    /// Remove the entry for a finished session.
    pub async fn destroy(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(session_id);
    }

    /// Whether an entry exists for the session.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.read().await.contains_key(session_id)
    }
}

fn entry_mut<'a>(
    entries: &'a mut HashMap<String, SharedState>,
    session_id: &str,
) -> Result<&'a mut SharedState, EvalError> {
    entries.get_mut(session_id).ok_or_else(|| unknown_session(session_id))
}

fn unknown_session(session_id: &str) -> EvalError {
    EvalError::Validation(format!("unknown session id: {}", session_id))
}
