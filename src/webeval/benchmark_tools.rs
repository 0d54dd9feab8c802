//! Handlers for benchmark-specific tools.
//!
//! Extra tools appear on the tool server only while their benchmark's task
//! is running; the orchestrator registers them at task start and deregisters
//! them on cleanup. Handlers are resolved by tool name through
//! [`handler_for`], mirroring the profile registry's extra-tool lists.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

use crate::webeval::actions::Action;
use crate::webeval::error::EvalError;
use crate::webeval::tool_protocol::{ToolHandler, ToolResult};
use crate::webeval::tool_server::ToolDeps;

/// Resolve the handler for a benchmark tool by name.
pub fn handler_for(tool_name: &str, deps: &ToolDeps) -> Option<Arc<dyn ToolHandler>> {
    match tool_name {
        "get_page_html" => Some(Arc::new(GetPageHtml { deps: deps.clone() })),
        "get_screenshot" => Some(Arc::new(GetScreenshot { deps: deps.clone() })),
        "list_open_tabs" => Some(Arc::new(ListOpenTabs { deps: deps.clone() })),
        "report_answer" => Some(Arc::new(ReportAnswer { deps: deps.clone() })),
        "get_dialogue_history" => Some(Arc::new(GetDialogueHistory { deps: deps.clone() })),
        _ => None,
    }
}

/// webarena: raw HTML of the current page.
struct GetPageHtml {
    deps: ToolDeps,
}

#[async_trait]
impl ToolHandler for GetPageHtml {
    async fn execute(
        &self,
        _parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let raw = self.deps.sessions.observe().await?;
        match raw.page_html {
            Some(html) => Ok(ToolResult::success(json!({
                "url": raw.url,
                "html": html,
            }))),
            None => Ok(ToolResult::failure(
                "page HTML is not exposed by the current environment".to_string(),
            )),
        }
    }
}

/// visualwebarena: base64 screenshot of the viewport.
struct GetScreenshot {
    deps: ToolDeps,
}

#[async_trait]
impl ToolHandler for GetScreenshot {
    async fn execute(
        &self,
        _parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let raw = self.deps.sessions.observe().await?;
        match raw.screenshot {
            Some(bytes) => Ok(ToolResult::success(json!({
                "url": raw.url,
                "size_bytes": bytes.len(),
                "screenshot_base64": BASE64.encode(&bytes),
            }))),
            None => Ok(ToolResult::failure(
                "no screenshot available for the current page".to_string(),
            )),
        }
    }
}

/// workarena: open tabs with indices, titles, and URLs.
struct ListOpenTabs {
    deps: ToolDeps,
}

#[async_trait]
impl ToolHandler for ListOpenTabs {
    async fn execute(
        &self,
        _parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let raw = self.deps.sessions.observe().await?;
        Ok(ToolResult::success(json!({
            "tabs": raw.open_tabs,
            "count": raw.open_tabs.len(),
        })))
    }
}

/// assistantbench: submit the final free-text answer.
///
/// Delivered to the environment as a user message so the benchmark's own
/// scorer judges it; when the episode ends, the terminal fields land in
/// shared state exactly like an `execute_actions` completion.
struct ReportAnswer {
    deps: ToolDeps,
}

#[async_trait]
impl ToolHandler for ReportAnswer {
    async fn execute(
        &self,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let answer = parameters
            .get("answer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EvalError::Validation("'answer' is required".to_string()))?
            .to_string();

        let session = self
            .deps
            .sessions
            .current_session()
            .await
            .ok_or_else(|| EvalError::ToolServer("no active session".to_string()))?;

        let outcome = self
            .deps
            .sessions
            .step(Action::SendMsgToUser { text: answer })
            .await?;
        let filtered = self.deps.filter.filter(&outcome.observation, None);
        self.deps
            .shared_state
            .record_observation(&session.session_id, filtered.token_estimate)
            .await?;
        self.deps
            .shared_state
            .record_action_batch(&session.session_id, 1, 0)
            .await?;
        let completed = self
            .deps
            .finalize_if_terminal(&session.session_id, &session.benchmark, &outcome)
            .await?;

        Ok(ToolResult::success(json!({
            "submitted": true,
            "task_completed": completed,
            "final_reward": outcome.reward,
        })))
    }
}

/// weblinx: instructor dialogue turns so far.
struct GetDialogueHistory {
    deps: ToolDeps,
}

#[async_trait]
impl ToolHandler for GetDialogueHistory {
    async fn execute(
        &self,
        _parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let raw = self.deps.sessions.observe().await?;
        Ok(ToolResult::success(json!({
            "turns": raw.dialogue,
            "count": raw.dialogue.len(),
        })))
    }
}
