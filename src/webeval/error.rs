//! Evaluator error taxonomy.
//!
//! Every fallible operation boundary in the crate returns [`EvalError`] so
//! that the orchestrator can convert failures into terminal task statuses
//! without bringing down the assessment. Only [`EvalError::Configuration`]
//! and [`EvalError::Canceled`] terminate a whole assessment; everything else
//! is recorded on the current task and the run continues.

use std::error::Error;
use std::fmt;

/// Domain errors produced by the evaluator core.
///
/// # Example
///
/// ```rust
/// use webeval::error::EvalError;
///
/// let err = EvalError::Timeout("task did not complete within 300s".to_string());
/// assert_eq!(err.kind(), "timeout");
/// assert!(!err.is_fatal(), "a task timeout never ends the whole assessment");
/// ```
#[derive(Debug, Clone)]
pub enum EvalError {
    /// Bad or missing configuration value. Surfaces at startup or on inbound
    /// message validation and is the only non-cancel error that aborts a run.
    Configuration(String),
    /// Malformed A2A message, unknown task id, unsupported benchmark, or an
    /// action that fails shape validation. Returned to callers as an A2A
    /// `InvalidParams` equivalent and never recorded in task artifacts.
    Validation(String),
    /// Browser environment creation, reset, or step failure.
    Environment(String),
    /// Tool invocation routed to an unregistered tool, or a tool handler
    /// failure. Aborts the current batch early.
    ToolServer(String),
    /// The per-task tool-call ceiling was breached. Carries the invocation
    /// count observed at the breach.
    ToolLimitExceeded(u32),
    /// Per-task wall-clock expiry.
    Timeout(String),
    /// The participant send did not complete within the send timeout.
    SendTimeout(String),
    /// A2A send/receive failure from the participant client.
    Participant(String),
    /// Session cleanup could not confirm success. Logged and recorded on the
    /// artifact, never fatal on its own.
    Cleanup(String),
    /// The assessment was canceled.
    Canceled,
}

impl EvalError {
    /// Stable kind tag used in task artifacts and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::Configuration(_) => "configuration_error",
            EvalError::Validation(_) => "validation_error",
            EvalError::Environment(_) => "environment_error",
            EvalError::ToolServer(_) => "tool_server_error",
            EvalError::ToolLimitExceeded(_) => "tool_limit_exceeded",
            EvalError::Timeout(_) => "timeout",
            EvalError::SendTimeout(_) => "send_timeout",
            EvalError::Participant(_) => "participant_error",
            EvalError::Cleanup(_) => "cleanup_error",
            EvalError::Canceled => "canceled",
        }
    }

    /// True when the error ends the whole assessment rather than one task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::Configuration(_) | EvalError::Canceled)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            EvalError::Validation(msg) => write!(f, "Validation error: {}", msg),
            EvalError::Environment(msg) => write!(f, "Environment error: {}", msg),
            EvalError::ToolServer(msg) => write!(f, "Tool server error: {}", msg),
            EvalError::ToolLimitExceeded(count) => {
                write!(f, "Tool call limit exceeded ({} invocations)", count)
            }
            EvalError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            EvalError::SendTimeout(msg) => write!(f, "Send timeout: {}", msg),
            EvalError::Participant(msg) => write!(f, "Participant error: {}", msg),
            EvalError::Cleanup(msg) => write!(f, "Cleanup error: {}", msg),
            EvalError::Canceled => write!(f, "Assessment canceled"),
        }
    }
}

impl Error for EvalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(EvalError::Environment("boom".into()).kind(), "environment_error");
        assert_eq!(EvalError::ToolLimitExceeded(4).kind(), "tool_limit_exceeded");
        assert_eq!(EvalError::Canceled.kind(), "canceled");
    }

    #[test]
    fn test_only_configuration_and_cancel_are_fatal() {
        assert!(EvalError::Configuration("bad port".into()).is_fatal());
        assert!(EvalError::Canceled.is_fatal());
        assert!(!EvalError::Timeout("300s".into()).is_fatal());
        assert!(!EvalError::Participant("refused".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = EvalError::ToolServer("no handler for get_screenshot".into());
        assert!(err.to_string().contains("get_screenshot"));
    }
}
