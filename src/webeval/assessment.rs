//! Assessment tracking model.
//!
//! An assessment is one run over an ordered plan of benchmark tasks. Each
//! task is tracked by a [`TaskEntry`] from Pending through a terminal
//! status; the [`Assessment`] owns the entries, the orchestrator status, and
//! the final result artifact.
//!
//! # Example
//!
//! ```rust
//! use webeval::assessment::{Assessment, AssessmentConfig};
//!
//! let config: AssessmentConfig = serde_json::from_value(serde_json::json!({
//!     "run_id": "run-1",
//!     "benchmarks": ["miniwob"],
//!     "tasks_by_benchmark": {"miniwob": ["miniwob.click-test"]},
//! }))
//! .unwrap();
//!
//! let assessment = Assessment::new(config);
//! assert_eq!(assessment.total_tasks(), 1);
//! assert_eq!(assessment.current_task_id(), Some("miniwob.click-test"));
//!
//! let artifact = assessment.build_result_artifact();
//! assert_eq!(artifact["passed_tasks"], 0);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::webeval::error::EvalError;
use crate::webeval::profiles::{benchmark_of_task, BenchmarkProfileRegistry};
use crate::webeval::shared_state::SharedState;

/// Status of a task in the assessment plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet sent.
    Pending,
    /// Sent to the participant.
    Sent,
    /// The participant is working on it.
    Running,
    /// Finished and collected.
    Completed,
    /// Per-task wall-clock timeout expired.
    Timeout,
    /// Failed with an error.
    Failed,
    /// The task-assignment send timed out.
    SendTimeout,
    /// The tool-call ceiling was breached.
    ToolLimit,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Timeout
                | TaskStatus::Failed
                | TaskStatus::SendTimeout
                | TaskStatus::ToolLimit
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Sent => "sent",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Failed => "failed",
            TaskStatus::SendTimeout => "send_timeout",
            TaskStatus::ToolLimit => "tool_limit",
        }
    }
}

/// Per-task metric deltas, computed against the shared-state snapshot taken
/// when the task was sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub tokens: u64,
    pub latency_ms: u64,
    pub actions: u64,
    pub observations: u64,
    pub tool_calls: u32,
}

/// Single task entry in the assessment plan.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task_id: String,
    pub benchmark: String,
    pub index: usize,
    pub status: TaskStatus,
    pub success: bool,
    pub final_reward: f64,
    pub done: bool,
    pub truncated: bool,
    pub metrics: TaskMetrics,
    pub efficiency_penalty: f64,
    pub final_score: f64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub completion_seconds: f64,
    pub error: Option<String>,
    /// Browser processes cleanup could not reap.
    pub orphaned_count: usize,
    /// Shared-state copy taken at task start, for delta computation.
    pub start_snapshot: Option<SharedState>,
}

impl TaskEntry {
    pub fn new(task_id: String, benchmark: String, index: usize) -> Self {
        Self {
            task_id,
            benchmark,
            index,
            status: TaskStatus::Pending,
            success: false,
            final_reward: 0.0,
            done: false,
            truncated: false,
            metrics: TaskMetrics::default(),
            efficiency_penalty: 1.0,
            final_score: 0.0,
            start_time: None,
            end_time: None,
            completion_seconds: 0.0,
            error: None,
            orphaned_count: 0,
            start_snapshot: None,
        }
    }

    /// Serialize the entry for the result artifact.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "task_id": self.task_id,
            "benchmark": self.benchmark,
            "task_index": self.index,
            "status": self.status.as_str(),
            "success": self.success,
            "final_reward": self.final_reward,
            "done": self.done,
            "truncated": self.truncated,
            "metrics": {
                "tokens": self.metrics.tokens,
                "latency_ms": self.metrics.latency_ms,
                "actions": self.metrics.actions,
                "observations": self.metrics.observations,
                "tool_calls": self.metrics.tool_calls,
            },
            "efficiency_penalty": self.efficiency_penalty,
            "final_score": self.final_score,
            "start_time": self.start_time,
            "end_time": self.end_time,
            "completion_time": self.completion_seconds,
            "error": self.error,
            "orphaned_count": self.orphaned_count,
        })
    }
}

/// A participant in the assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub role: String,
    pub endpoint: String,
    #[serde(default)]
    pub id: String,
}

fn default_max_steps() -> u32 {
    10
}
fn default_max_tool_calls() -> u32 {
    3
}
fn default_timeout_seconds() -> u64 {
    300
}
fn default_primary_role() -> String {
    "participant".to_string()
}

/// Initial configuration for a multi-task assessment, parsed from the
/// inbound request's data or text part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentConfig {
    pub run_id: String,
    pub benchmarks: Vec<String>,
    pub tasks_by_benchmark: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub participants: HashMap<String, ParticipantInfo>,
    #[serde(default = "default_primary_role")]
    pub primary_participant_role: String,
}

impl AssessmentConfig {
    /// Total number of tasks across all benchmarks.
    pub fn total_task_count(&self) -> usize {
        self.benchmarks
            .iter()
            .map(|b| self.tasks_by_benchmark.get(b).map(Vec::len).unwrap_or(0))
            .sum()
    }

    /// Flattened, ordered `(benchmark, task_id)` list following the
    /// benchmark order of the plan.
    pub fn flat_task_list(&self) -> Vec<(String, String)> {
        let mut tasks = Vec::new();
        for benchmark in &self.benchmarks {
            if let Some(ids) = self.tasks_by_benchmark.get(benchmark) {
                for task_id in ids {
                    tasks.push((benchmark.clone(), task_id.clone()));
                }
            }
        }
        tasks
    }

    /// Endpoint of the primary participant, when configured.
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.participants
            .get(&self.primary_participant_role)
            .map(|p| p.endpoint.as_str())
    }

    /// Validate the plan against the profile registry: every benchmark must
    /// be supported and every task id well-formed and consistent with its
    /// benchmark bucket.
    pub fn validate(&self, registry: &BenchmarkProfileRegistry) -> Result<(), EvalError> {
        if self.run_id.is_empty() {
            return Err(EvalError::Validation("run_id must not be empty".to_string()));
        }
        for benchmark in &self.benchmarks {
            registry.get_or_err(benchmark)?;
            let tasks = self.tasks_by_benchmark.get(benchmark).ok_or_else(|| {
                EvalError::Validation(format!("no tasks listed for benchmark {}", benchmark))
            })?;
            for task_id in tasks {
                let owner = benchmark_of_task(task_id)?;
                if owner != benchmark {
                    return Err(EvalError::Validation(format!(
                        "task {} listed under benchmark {}",
                        task_id, benchmark
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Orchestrator lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl OrchestratorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorStatus::Idle => "idle",
            OrchestratorStatus::Running => "running",
            OrchestratorStatus::Complete => "complete",
            OrchestratorStatus::Error => "error",
        }
    }
}

/// One assessment run: the plan, the per-task entries, and the orchestrator
/// state. Created on the inbound assessment request, owned for the lifetime
/// of the run.
#[derive(Debug)]
pub struct Assessment {
    pub config: AssessmentConfig,
    pub entries: Vec<TaskEntry>,
    pub current_index: usize,
    pub orchestrator_status: OrchestratorStatus,
    pub orchestrator_error: Option<String>,
    pub result_artifact: Option<serde_json::Value>,
}

impl Assessment {
    pub fn new(config: AssessmentConfig) -> Self {
        let entries = config
            .flat_task_list()
            .into_iter()
            .enumerate()
            .map(|(index, (benchmark, task_id))| TaskEntry::new(task_id, benchmark, index))
            .collect();
        Self {
            config,
            entries,
            current_index: 0,
            orchestrator_status: OrchestratorStatus::Idle,
            orchestrator_error: None,
            result_artifact: None,
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.entries.len()
    }

    pub fn completed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_terminal()).count()
    }

    pub fn passed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.passed_count() as f64 / self.entries.len() as f64
    }

    /// Task id of the entry at the current index, when in range.
    pub fn current_task_id(&self) -> Option<&str> {
        self.entries.get(self.current_index).map(|e| e.task_id.as_str())
    }

    /// Orchestrator progress snapshot with a human-readable summary.
    pub fn progress(&self) -> serde_json::Value {
        let summary = match self.orchestrator_status {
            OrchestratorStatus::Idle => {
                "Assessment not started. Call start_assessment to begin.".to_string()
            }
            OrchestratorStatus::Running => format!(
                "Running: task {}/{} ({} completed, {} passed)",
                (self.current_index + 1).min(self.total_tasks().max(1)),
                self.total_tasks(),
                self.completed_count(),
                self.passed_count()
            ),
            OrchestratorStatus::Complete => format!(
                "Complete: {}/{} tasks passed ({:.1}% success rate)",
                self.passed_count(),
                self.total_tasks(),
                self.success_rate() * 100.0
            ),
            OrchestratorStatus::Error => format!(
                "Error: {}",
                self.orchestrator_error.as_deref().unwrap_or("unknown")
            ),
        };
        serde_json::json!({
            "status": self.orchestrator_status.as_str(),
            "current_task_index": self.current_index,
            "current_task": self.current_task_id(),
            "total_tasks": self.total_tasks(),
            "completed_tasks": self.completed_count(),
            "passed_tasks": self.passed_count(),
            "success_rate": self.success_rate(),
            "error": self.orchestrator_error,
            "summary": summary,
        })
    }

    /// Build the aggregate result artifact: per-task entries plus totals and
    /// a per-benchmark breakdown. Always well-formed, even with zero tasks
    /// or when every task failed.
    pub fn build_result_artifact(&self) -> serde_json::Value {
        let mut per_benchmark: HashMap<String, (usize, usize)> = HashMap::new();
        for entry in &self.entries {
            let slot = per_benchmark.entry(entry.benchmark.clone()).or_insert((0, 0));
            slot.0 += 1;
            if entry.success {
                slot.1 += 1;
            }
        }
        let breakdown: serde_json::Map<String, serde_json::Value> = per_benchmark
            .into_iter()
            .map(|(benchmark, (total, passed))| {
                (
                    benchmark,
                    serde_json::json!({
                        "total": total,
                        "passed": passed,
                        "success_rate": if total > 0 { passed as f64 / total as f64 } else { 0.0 },
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "run_id": self.config.run_id,
            "total_tasks": self.total_tasks(),
            "passed_tasks": self.passed_count(),
            "success_rate": self.success_rate(),
            "benchmarks": breakdown,
            "tasks": self.entries.iter().map(TaskEntry::to_json).collect::<Vec<_>>(),
            "error": self.orchestrator_error,
        })
    }
}
