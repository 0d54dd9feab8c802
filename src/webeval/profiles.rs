//! Benchmark profile registry.
//!
//! Each supported benchmark carries a static profile: the per-observation
//! token limit, the default observation mode, the benchmark-specific extra
//! tools the tool server registers at task start, a filtering strategy for
//! compact observations, and the dataset environment-variable convention.
//!
//! The registry is built once at startup and shared read-only; there is no
//! lazily initialized global.
//!
//! Supported benchmarks and token limits:
//!
//! | benchmark | token limit | default mode |
//! |---|---|---|
//! | miniwob | 2000 | axtree_compact |
//! | assistantbench | 3000 | axtree |
//! | visualwebarena | 3500 | axtree_with_screenshot |
//! | weblinx | 4000 | axtree |
//! | workarena | 4500 | axtree |
//! | webarena | 5000 | axtree |
//!
//! # Example
//!
//! ```rust
//! use webeval::profiles::{BenchmarkProfileRegistry, ObservationMode};
//!
//! let registry = BenchmarkProfileRegistry::new();
//! let profile = registry.profile_for_task("miniwob.click-test").unwrap();
//! assert_eq!(profile.token_limit, 2000);
//! assert_eq!(profile.observation_mode, ObservationMode::AxtreeCompact);
//! assert!(registry.get("minesweeper").is_none());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::webeval::error::EvalError;
use crate::webeval::tool_protocol::{ToolMetadata, ToolParameter, ToolParameterType};

/// Shape of the observation payload returned to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationMode {
    /// Accessibility tree with excluded roles dropped and adjacent static
    /// text collapsed.
    AxtreeCompact,
    /// Full accessibility tree in textual form.
    Axtree,
    /// Accessibility tree plus extra element properties.
    AxtreeFull,
    /// Accessibility tree plus a screenshot reference token.
    AxtreeWithScreenshot,
}

impl ObservationMode {
    /// Wire name of the mode, used in observation payloads and the agent card.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationMode::AxtreeCompact => "axtree_compact",
            ObservationMode::Axtree => "axtree",
            ObservationMode::AxtreeFull => "axtree_full",
            ObservationMode::AxtreeWithScreenshot => "axtree_with_screenshot",
        }
    }

    /// Parse a wire name back into a mode.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "axtree_compact" => Some(ObservationMode::AxtreeCompact),
            "axtree" => Some(ObservationMode::Axtree),
            "axtree_full" => Some(ObservationMode::AxtreeFull),
            "axtree_with_screenshot" => Some(ObservationMode::AxtreeWithScreenshot),
            _ => None,
        }
    }
}

/// Role sets steering the compact observation filter.
#[derive(Debug, Clone)]
pub struct FilteringStrategy {
    /// Roles that are always kept even when the exclude set would drop them.
    pub focus_roles: Vec<String>,
    /// Roles dropped in compact mode.
    pub exclude_roles: Vec<String>,
}

impl FilteringStrategy {
    fn new(focus: &[&str], exclude: &[&str]) -> Self {
        Self {
            focus_roles: focus.iter().map(|s| s.to_string()).collect(),
            exclude_roles: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Dataset location convention for a benchmark.
///
/// Benchmarks with local task content get their conventional environment
/// variable pointed at a `file://` URL under the dataset root; remote
/// benchmarks only name the variable and resolution is a no-op.
#[derive(Debug, Clone)]
pub struct DatasetConvention {
    /// Environment variable the underlying environment reads.
    pub env_var: &'static str,
    /// Candidate relative paths under the dataset root, tried in order.
    /// `None` means the benchmark uses remote data.
    pub candidate_paths: Option<Vec<&'static str>>,
}

/// Static per-benchmark configuration.
#[derive(Debug, Clone)]
pub struct BenchmarkProfile {
    pub benchmark_id: String,
    pub display_name: String,
    /// Per-observation token limit.
    pub token_limit: u32,
    /// Default observation mode for the benchmark.
    pub observation_mode: ObservationMode,
    /// Benchmark-specific tools registered for the duration of a task.
    pub extra_tools: Vec<ToolMetadata>,
    pub filtering: FilteringStrategy,
    pub dataset: DatasetConvention,
}

impl BenchmarkProfile {
    /// Success predicate for a finished task.
    ///
    /// An explicit success flag reported by the environment wins; otherwise
    /// a strictly positive final reward counts as success. A task that ended
    /// truncated without `done` is completion-without-success and falls
    /// through to the same reward check.
    pub fn success_from(&self, final_reward: f64, explicit_success: Option<bool>) -> bool {
        match explicit_success {
            Some(flag) => flag,
            None => final_reward > 0.0,
        }
    }
}

/// Read-only registry of the six supported benchmark profiles.
#[derive(Debug, Clone)]
pub struct BenchmarkProfileRegistry {
    profiles: Vec<BenchmarkProfile>,
    by_id: HashMap<String, usize>,
}

impl BenchmarkProfileRegistry {
    /// Build the registry with the fixed set of supported profiles.
    pub fn new() -> Self {
        let profiles = vec![
            BenchmarkProfile {
                benchmark_id: "miniwob".to_string(),
                display_name: "MiniWoB++".to_string(),
                token_limit: 2000,
                observation_mode: ObservationMode::AxtreeCompact,
                extra_tools: Vec::new(),
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "checkbox", "combobox", "radio"],
                    &["generic", "none", "InlineTextBox", "LineBreak", "presentation"],
                ),
                dataset: DatasetConvention {
                    env_var: "MINIWOB_URL",
                    candidate_paths: Some(vec![
                        "miniwob/html/miniwob",
                        "benchmarks/miniwob/html/miniwob",
                    ]),
                },
            },
            BenchmarkProfile {
                benchmark_id: "webarena".to_string(),
                display_name: "WebArena".to_string(),
                token_limit: 5000,
                observation_mode: ObservationMode::Axtree,
                extra_tools: vec![ToolMetadata::new(
                    "get_page_html",
                    "Return the raw HTML of the current page for content inspection.",
                )],
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "combobox", "tab", "menuitem"],
                    &["generic", "none", "LineBreak"],
                ),
                dataset: DatasetConvention {
                    env_var: "WEBARENA_BASE_URL",
                    candidate_paths: None,
                },
            },
            BenchmarkProfile {
                benchmark_id: "visualwebarena".to_string(),
                display_name: "VisualWebArena".to_string(),
                token_limit: 3500,
                observation_mode: ObservationMode::AxtreeWithScreenshot,
                extra_tools: vec![ToolMetadata::new(
                    "get_screenshot",
                    "Return a base64-encoded screenshot of the current viewport.",
                )],
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "img", "figure"],
                    &["generic", "none", "LineBreak"],
                ),
                dataset: DatasetConvention {
                    env_var: "VISUALWEBARENA_BASE_URL",
                    candidate_paths: None,
                },
            },
            BenchmarkProfile {
                benchmark_id: "workarena".to_string(),
                display_name: "WorkArena".to_string(),
                token_limit: 4500,
                observation_mode: ObservationMode::Axtree,
                extra_tools: vec![ToolMetadata::new(
                    "list_open_tabs",
                    "List the open browser tabs with their indices, titles, and URLs.",
                )],
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "combobox", "grid", "row"],
                    &["generic", "none", "LineBreak"],
                ),
                dataset: DatasetConvention {
                    env_var: "WORKARENA_BASE_URL",
                    candidate_paths: None,
                },
            },
            BenchmarkProfile {
                benchmark_id: "assistantbench".to_string(),
                display_name: "AssistantBench".to_string(),
                token_limit: 3000,
                observation_mode: ObservationMode::Axtree,
                extra_tools: vec![ToolMetadata::new(
                    "report_answer",
                    "Submit the final free-text answer for the information-retrieval task.",
                )
                .with_parameter(
                    ToolParameter::new("answer", ToolParameterType::String)
                        .with_description("The answer text")
                        .required(),
                )],
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "heading", "article"],
                    &["generic", "none", "LineBreak"],
                ),
                dataset: DatasetConvention {
                    env_var: "ASSISTANTBENCH_DATA_PATH",
                    candidate_paths: None,
                },
            },
            BenchmarkProfile {
                benchmark_id: "weblinx".to_string(),
                display_name: "WebLINX".to_string(),
                token_limit: 4000,
                observation_mode: ObservationMode::Axtree,
                extra_tools: vec![ToolMetadata::new(
                    "get_dialogue_history",
                    "Return the instructor dialogue turns exchanged so far in this task.",
                )],
                filtering: FilteringStrategy::new(
                    &["button", "link", "textbox", "listitem"],
                    &["generic", "none", "LineBreak"],
                ),
                dataset: DatasetConvention {
                    env_var: "WEBLINX_DATA_PATH",
                    candidate_paths: None,
                },
            },
        ];

        let by_id = profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.benchmark_id.clone(), i))
            .collect();

        Self { profiles, by_id }
    }

    /// All profiles in registration order.
    pub fn all_profiles(&self) -> &[BenchmarkProfile] {
        &self.profiles
    }

    /// Supported benchmark ids in registration order.
    pub fn supported_benchmarks(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.benchmark_id.as_str()).collect()
    }

    /// Look up a profile by benchmark id.
    pub fn get(&self, benchmark_id: &str) -> Option<&BenchmarkProfile> {
        self.by_id.get(benchmark_id).map(|&i| &self.profiles[i])
    }

    /// Look up a profile by benchmark id, failing with a validation error.
    pub fn get_or_err(&self, benchmark_id: &str) -> Result<&BenchmarkProfile, EvalError> {
        self.get(benchmark_id).ok_or_else(|| {
            EvalError::Validation(format!("unsupported benchmark: {}", benchmark_id))
        })
    }

    /// Look up a profile by task id (`benchmark.task-name`).
    pub fn profile_for_task(&self, task_id: &str) -> Result<&BenchmarkProfile, EvalError> {
        let benchmark = benchmark_of_task(task_id)?;
        self.get_or_err(benchmark)
    }
}

impl Default for BenchmarkProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the benchmark id from a task id: the prefix before the first dot.
pub fn benchmark_of_task(task_id: &str) -> Result<&str, EvalError> {
    match task_id.split_once('.') {
        Some((benchmark, task)) if !benchmark.is_empty() && !task.is_empty() => Ok(benchmark),
        _ => Err(EvalError::Validation(format!(
            "task id must be in 'benchmark.task' format, got {:?}",
            task_id
        ))),
    }
}
