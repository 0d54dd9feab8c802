//! Assessment orchestrator.
//!
//! The orchestrator is a single background task that advances the
//! assessment's flat task list through a per-task state machine:
//!
//! ```text
//! PrepareEnvironment -> RegisterTools -> SendTask -> AwaitCompletion
//!     -> (CollectResult | DetectTimeout | DetectToolLimit | DetectSendTimeout)
//!     -> Cleanup -> next task or terminal
//! ```
//!
//! It is started at most once per assessment and is not restartable. Every
//! per-task failure is converted into a terminal task status and the run
//! continues; only configuration errors and cancellation end the whole
//! assessment. Cleanup always runs for the in-flight task, including on
//! cancellation.
//!
//! # Example
//!
//! ```rust,ignore
//! use webeval::orchestrator::Orchestrator;
//!
//! let orchestrator = Orchestrator::new(assessment, deps);
//! let started = orchestrator.start().await;
//! assert_eq!(started["status"], "started");
//!
//! // The run advances in the background; callers poll the assessment.
//! let progress = orchestrator.assessment().read().await.progress();
//! println!("{}", progress["summary"]);
//!
//! // Cancellation still cleans up the in-flight task.
//! orchestrator.cancel();
//! ```

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::webeval::assessment::{
    Assessment, OrchestratorStatus, TaskMetrics, TaskStatus,
};
use crate::webeval::a2a::TaskState;
use crate::webeval::browser::SessionManager;
use crate::webeval::error::EvalError;
use crate::webeval::observation::ObservationFilter;
use crate::webeval::participant::{build_task_message, TaskAssignment, TaskSender};
use crate::webeval::profiles::BenchmarkProfileRegistry;
use crate::webeval::scoring::PenaltyCalculator;
use crate::webeval::security::redact;
use crate::webeval::shared_state::{SharedState, SharedStateStore};
use crate::webeval::streaming::{build_data_artifact_update, EventBus};
use crate::webeval::tool_server::ToolServer;

/// Shared collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub sessions: Arc<SessionManager>,
    pub shared_state: Arc<SharedStateStore>,
    pub tool_server: Arc<ToolServer>,
    pub filter: Arc<ObservationFilter>,
    pub registry: Arc<BenchmarkProfileRegistry>,
    pub participant: Arc<dyn TaskSender>,
    pub events: Arc<EventBus>,
    pub calculator: PenaltyCalculator,
    /// Tool-server URL advertised to the participant.
    pub tool_server_url: String,
    pub send_timeout: Duration,
    pub poll_interval: Duration,
    /// A2A context the assessment belongs to (SSE stream key).
    pub context_id: String,
    /// A2A task id used in lifecycle events.
    pub a2a_task_id: String,
}

/// How a task left the AwaitCompletion sub-state.
enum TaskOutcome {
    Completed,
    Error(String),
    ToolLimit(u32),
    Timeout,
    Canceled,
}

/// Background driver for one assessment.
pub struct Orchestrator {
    assessment: Arc<RwLock<Assessment>>,
    deps: OrchestratorDeps,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(assessment: Arc<RwLock<Assessment>>, deps: OrchestratorDeps) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(Self {
            assessment,
            deps,
            cancel_tx,
            cancel_rx,
            started: AtomicBool::new(false),
        })
    }

    /// The assessment this orchestrator drives.
    pub fn assessment(&self) -> Arc<RwLock<Assessment>> {
        self.assessment.clone()
    }

    /// Start the background task. A no-op when already Running, Complete, or
    /// Error — there is at most one live orchestrator task per assessment.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let first = orchestrator.start().await;
    /// assert_eq!(first["status"], "started");
    /// let second = orchestrator.start().await;
    /// assert_eq!(second["status"], "already_running");
    /// ```
    pub async fn start(self: &Arc<Self>) -> serde_json::Value {
        {
            let mut assessment = self.assessment.write().await;
            match assessment.orchestrator_status {
                OrchestratorStatus::Running => {
                    return serde_json::json!({
                        "status": "already_running",
                        "progress": assessment.progress(),
                    });
                }
                OrchestratorStatus::Complete | OrchestratorStatus::Error => {
                    return serde_json::json!({
                        "status": "already_complete",
                        "progress": assessment.progress(),
                    });
                }
                OrchestratorStatus::Idle => {
                    assessment.orchestrator_status = OrchestratorStatus::Running;
                }
            }
        }
        if self.started.swap(true, Ordering::SeqCst) {
            // Status said Idle but a task was already spawned; never spawn a
            // second one.
            return serde_json::json!({"status": "already_running"});
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run().await;
        });

        let assessment = self.assessment.read().await;
        serde_json::json!({
            "status": "started",
            "total_tasks": assessment.total_tasks(),
            "first_task": assessment.current_task_id(),
            "benchmarks": assessment.config.benchmarks,
        })
    }

    /// Cancel the assessment. The in-flight task is cleaned up before the
    /// orchestrator terminates.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn run(self: Arc<Self>) {
        log::info!("orchestrator started for context {}", self.deps.context_id);
        self.deps
            .events
            .emit_status(
                &self.deps.context_id,
                &self.deps.a2a_task_id,
                TaskState::Working,
                "Assessment started",
                false,
            )
            .await;

        let total = self.assessment.read().await.total_tasks();
        let mut previous_benchmark: Option<String> = None;
        let mut canceled = false;

        for index in 0..total {
            if self.is_canceled() {
                canceled = true;
                break;
            }
            let benchmark = {
                let assessment = self.assessment.read().await;
                assessment.entries[index].benchmark.clone()
            };
            if let TaskOutcome::Canceled = self.run_task(index, previous_benchmark.as_deref()).await
            {
                canceled = true;
                break;
            }
            previous_benchmark = Some(benchmark);
            let mut assessment = self.assessment.write().await;
            assessment.current_index = index + 1;
        }

        self.finish(canceled).await;
    }

    async fn finish(&self, canceled: bool) {
        let (artifact, final_state, final_message) = {
            let mut assessment = self.assessment.write().await;
            if canceled {
                assessment.orchestrator_status = OrchestratorStatus::Error;
                assessment.orchestrator_error = Some("canceled".to_string());
            } else if assessment.orchestrator_status != OrchestratorStatus::Error {
                assessment.orchestrator_status = OrchestratorStatus::Complete;
            }
            let artifact = assessment.build_result_artifact();
            assessment.result_artifact = Some(artifact.clone());

            let (state, message) = match assessment.orchestrator_status {
                OrchestratorStatus::Error if canceled => {
                    (TaskState::Canceled, "Assessment canceled".to_string())
                }
                OrchestratorStatus::Error => (
                    TaskState::Failed,
                    format!(
                        "Assessment failed: {}",
                        assessment.orchestrator_error.as_deref().unwrap_or("unknown")
                    ),
                ),
                _ => (
                    TaskState::Completed,
                    format!(
                        "Assessment complete: {}/{} tasks passed",
                        assessment.passed_count(),
                        assessment.total_tasks()
                    ),
                ),
            };
            (artifact, state, message)
        };

        self.deps
            .events
            .emit(
                &self.deps.context_id,
                build_data_artifact_update(
                    &self.deps.a2a_task_id,
                    &self.deps.context_id,
                    "assessment_result",
                    artifact,
                ),
            )
            .await;
        self.deps
            .events
            .emit_status(
                &self.deps.context_id,
                &self.deps.a2a_task_id,
                final_state,
                &final_message,
                true,
            )
            .await;
        log::info!("orchestrator finished for context {}", self.deps.context_id);
    }

    /// Drive one task through its sub-states. Per-task failures are recorded
    /// on the entry and returned as `Ok` so the run continues.
    async fn run_task(&self, index: usize, previous_benchmark: Option<&str>) -> TaskOutcome {
        let (task_id, benchmark, config) = {
            let assessment = self.assessment.read().await;
            let entry = &assessment.entries[index];
            (entry.task_id.clone(), entry.benchmark.clone(), assessment.config.clone())
        };
        log::info!("task {}/{} starting: {}", index + 1, config.total_task_count(), task_id);

        // PrepareEnvironment: a benchmark switch forces a full teardown of
        // whatever the previous benchmark left behind.
        if previous_benchmark.is_some() && previous_benchmark != Some(benchmark.as_str()) {
            if let Err(e) = self.deps.sessions.cleanup().await {
                log::warn!("benchmark-switch teardown failed: {}", e);
            }
        }

        let profile = match self.deps.registry.get_or_err(&benchmark) {
            Ok(profile) => profile.clone(),
            Err(e) => {
                self.record_failure(index, TaskStatus::Failed, &e.to_string()).await;
                return TaskOutcome::Error(e.to_string());
            }
        };
        let session = match self
            .deps
            .sessions
            .create_session(&profile, &task_id, config.max_steps, None)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.record_failure(index, TaskStatus::Failed, &e.to_string()).await;
                return TaskOutcome::Error(e.to_string());
            }
        };
        let session_id = session.session_id.clone();
        self.deps.shared_state.initialize(&session_id, &benchmark).await;

        // RegisterTools: the tool table and the observation filter both
        // switch to the task's benchmark.
        if let Err(e) = self.deps.tool_server.register_benchmark_tools(&benchmark).await {
            self.record_failure(index, TaskStatus::Failed, &e.to_string()).await;
            self.cleanup_task(index, &session_id).await;
            return TaskOutcome::Error(e.to_string());
        }
        self.deps.filter.set_profile(&profile);

        // SendTask.
        let start_snapshot = match self.deps.shared_state.read(&session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_failure(index, TaskStatus::Failed, &e.to_string()).await;
                self.cleanup_task(index, &session_id).await;
                return TaskOutcome::Error(e.to_string());
            }
        };
        {
            let mut assessment = self.assessment.write().await;
            let entry = &mut assessment.entries[index];
            entry.start_snapshot = Some(start_snapshot.clone());
            entry.start_time = Some(Utc::now().to_rfc3339());
            entry.status = TaskStatus::Sent;
        }

        let tools = self.deps.tool_server.list_tools().await;
        let assignment = TaskAssignment {
            task_id: &task_id,
            benchmark: &benchmark,
            profile: &profile,
            tool_server_url: &self.deps.tool_server_url,
            session_id: Some(&session_id),
            tools: &tools,
            task_goal: Some(&session.initial_observation.goal),
            max_tool_calls: config.max_tool_calls,
            max_steps: config.max_steps,
            timeout_seconds: config.timeout_seconds,
        };
        let message = build_task_message(&assignment, &self.deps.context_id);

        let started_at = Instant::now();
        let send_result = self.deps.participant.send_task(&message, self.deps.send_timeout).await;
        let outcome = match send_result {
            Err(EvalError::SendTimeout(msg)) => {
                self.record_failure(index, TaskStatus::SendTimeout, &msg).await;
                TaskOutcome::Error(msg)
            }
            Err(e) => {
                self.record_failure(index, TaskStatus::Failed, &e.to_string()).await;
                TaskOutcome::Error(e.to_string())
            }
            Ok(_) => {
                {
                    let mut assessment = self.assessment.write().await;
                    assessment.entries[index].status = TaskStatus::Running;
                }
                self.deps
                    .events
                    .emit_status(
                        &self.deps.context_id,
                        &self.deps.a2a_task_id,
                        TaskState::Working,
                        &format!("Task {}/{} sent: {}", index + 1, config.total_task_count(), task_id),
                        false,
                    )
                    .await;

                let outcome = self
                    .await_completion(&session_id, started_at, config.timeout_seconds, config.max_tool_calls)
                    .await;
                self.collect_result(index, &session_id, &start_snapshot, &outcome).await;
                outcome
            }
        };

        // Cleanup always runs, whatever the outcome.
        self.cleanup_task(index, &session_id).await;
        self.emit_task_artifact(index).await;
        outcome
    }

    /// Poll the shared state until a completion predicate fires. Predicate
    /// ordering: error > tool-limit > completion > timeout.
    async fn await_completion(
        &self,
        session_id: &str,
        started_at: Instant,
        timeout_seconds: u64,
        max_tool_calls: u32,
    ) -> TaskOutcome {
        let timeout = Duration::from_secs(timeout_seconds);
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            if self.is_canceled() {
                return TaskOutcome::Canceled;
            }
            match self.deps.shared_state.read(session_id).await {
                Ok(state) => {
                    if let Some(error) = &state.error {
                        return TaskOutcome::Error(error.clone());
                    }
                    if state.tool_invocation_count > max_tool_calls {
                        return TaskOutcome::ToolLimit(state.tool_invocation_count);
                    }
                    if state.is_complete() {
                        return TaskOutcome::Completed;
                    }
                    if started_at.elapsed() > timeout {
                        return TaskOutcome::Timeout;
                    }
                }
                Err(e) => return TaskOutcome::Error(e.to_string()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.deps.poll_interval) => {}
                _ = cancel_rx.changed() => {}
            }
        }
    }

    /// Read the final shared-state snapshot, compute per-task deltas, and
    /// score the task.
    async fn collect_result(
        &self,
        index: usize,
        session_id: &str,
        start_snapshot: &SharedState,
        outcome: &TaskOutcome,
    ) {
        let final_state = match self.deps.shared_state.read(session_id).await {
            Ok(state) => state,
            Err(e) => {
                log::error!("collect: shared state read failed: {}", e);
                return;
            }
        };

        let metrics = TaskMetrics {
            tokens: final_state.total_tokens.saturating_sub(start_snapshot.total_tokens),
            latency_ms: final_state
                .total_latency_ms
                .saturating_sub(start_snapshot.total_latency_ms),
            actions: final_state.action_count.saturating_sub(start_snapshot.action_count),
            observations: final_state
                .observation_count
                .saturating_sub(start_snapshot.observation_count),
            tool_calls: final_state.tool_invocation_count,
        };
        let latency_seconds = metrics.latency_ms as f64 / 1000.0;
        let penalty = self.deps.calculator.efficiency_penalty(metrics.tokens, latency_seconds);

        let mut assessment = self.assessment.write().await;
        let timeout_seconds = assessment.config.timeout_seconds;
        let entry = &mut assessment.entries[index];
        entry.metrics = metrics;
        entry.done = final_state.done;
        entry.truncated = final_state.truncated;
        entry.final_reward = final_state.final_reward;
        entry.efficiency_penalty = penalty;

        match outcome {
            TaskOutcome::Completed => {
                entry.status = TaskStatus::Completed;
                entry.success = final_state.task_success;
                entry.final_score = if entry.success { penalty } else { 0.0 };
            }
            TaskOutcome::ToolLimit(count) => {
                entry.status = TaskStatus::ToolLimit;
                entry.success = false;
                entry.final_score = 0.0;
                entry.error = Some(EvalError::ToolLimitExceeded(*count).to_string());
            }
            TaskOutcome::Timeout => {
                entry.status = TaskStatus::Timeout;
                entry.success = false;
                entry.final_score = 0.0;
                entry.error = Some(format!("task did not complete within {}s", timeout_seconds));
            }
            TaskOutcome::Error(message) => {
                entry.status = TaskStatus::Failed;
                entry.success = false;
                entry.final_score = 0.0;
                entry.error = Some(message.clone());
            }
            TaskOutcome::Canceled => {
                entry.status = TaskStatus::Failed;
                entry.success = false;
                entry.final_score = 0.0;
                entry.error = Some("canceled".to_string());
            }
        }
    }

    async fn record_failure(&self, index: usize, status: TaskStatus, error: &str) {
        log::warn!("task {} failed: {}", index, redact(error));
        let mut assessment = self.assessment.write().await;
        let entry = &mut assessment.entries[index];
        entry.status = status;
        entry.success = false;
        entry.final_score = 0.0;
        entry.error = Some(error.to_string());
    }

    /// Tear down the session, the benchmark tools, and the shared state.
    async fn cleanup_task(&self, index: usize, session_id: &str) {
        let _ = self.deps.shared_state.mark_cleanup(session_id).await;
        match self.deps.sessions.cleanup().await {
            Ok(report) => {
                let mut assessment = self.assessment.write().await;
                assessment.entries[index].orphaned_count = report.orphaned_count;
            }
            Err(e) => {
                // A cleanup failure is recorded but never fails the run.
                log::error!("cleanup for session {} failed: {}", session_id, e);
            }
        }
        self.deps.tool_server.deregister_benchmark_tools().await;
        self.deps.shared_state.destroy(session_id).await;

        let mut assessment = self.assessment.write().await;
        let entry = &mut assessment.entries[index];
        entry.end_time = Some(Utc::now().to_rfc3339());
        if let (Some(start), Some(end)) = (&entry.start_time, &entry.end_time) {
            if let (Ok(start), Ok(end)) = (
                chrono::DateTime::parse_from_rfc3339(start),
                chrono::DateTime::parse_from_rfc3339(end),
            ) {
                entry.completion_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
            }
        }
    }

    async fn emit_task_artifact(&self, index: usize) {
        let (name, payload) = {
            let assessment = self.assessment.read().await;
            let entry = &assessment.entries[index];
            (format!("task_result_{}", entry.index), entry.to_json())
        };
        self.deps
            .events
            .emit(
                &self.deps.context_id,
                build_data_artifact_update(&self.deps.a2a_task_id, &self.deps.context_id, &name, payload),
            )
            .await;
    }
}
