//! Evaluator configuration.
//!
//! [`Settings`] is loaded from environment variables with sensible defaults;
//! users can also construct it manually for tests or embedding. No config
//! file parsing dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use webeval::config::Settings;
//!
//! let settings = Settings::default();
//! assert_eq!(settings.evaluator_port, 9009);
//! assert_eq!(settings.max_tool_calls, 3);
//! ```

use std::env;
use std::path::PathBuf;

use crate::webeval::error::EvalError;
use crate::webeval::scoring::{DEFAULT_LAMBDA_C, DEFAULT_LAMBDA_L};

/// Values accepted as "true" for boolean options, case-insensitive.
const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];

/// Parse a boolean option. Anything outside the truthy set is false.
pub fn parse_truthy(value: &str) -> bool {
    TRUTHY.contains(&value.trim().to_ascii_lowercase().as_str())
}

/// Application configuration for the evaluator process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Host the A2A server binds to.
    pub evaluator_host: String,
    /// Port the A2A server binds to.
    pub evaluator_port: u16,
    /// Port the tool server binds to.
    pub tool_server_port: u16,
    /// Browser visibility policy. Default is visible.
    pub headless: bool,
    /// Per-task tool-call ceiling.
    pub max_tool_calls: u32,
    /// Per-task step ceiling passed to the environment.
    pub max_steps: u32,
    /// Per-task wall-clock timeout in seconds.
    pub timeout_seconds: u64,
    /// Participant send timeout in seconds.
    pub send_timeout_seconds: u64,
    /// Orchestrator completion poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Base path for local benchmark datasets.
    pub dataset_root: PathBuf,
    /// Global per-observation token limit used when a profile omits one.
    pub token_limit_per_observation: u32,
    /// Token penalty coefficient (λ_C).
    pub lambda_c: f64,
    /// Latency penalty coefficient (λ_L).
    pub lambda_l: f64,
    /// Whether inbound endpoints enforce per-client rate limits.
    pub rate_limit_enabled: bool,
    /// Sustained requests per minute allowed per endpoint and client.
    pub rate_limit_requests_per_minute: u32,
    /// Whether agent conversation history is persisted.
    pub sessions_persistent: bool,
    /// Path of the persisted session store.
    pub sessions_db_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            evaluator_host: "0.0.0.0".to_string(),
            evaluator_port: 9009,
            tool_server_port: 8081,
            headless: false,
            max_tool_calls: 3,
            max_steps: 10,
            timeout_seconds: 300,
            send_timeout_seconds: 30,
            poll_interval_ms: 3000,
            dataset_root: PathBuf::from("datasets"),
            token_limit_per_observation: 5000,
            lambda_c: DEFAULT_LAMBDA_C,
            lambda_l: DEFAULT_LAMBDA_L,
            rate_limit_enabled: true,
            rate_limit_requests_per_minute: 60,
            sessions_persistent: false,
            sessions_db_path: PathBuf::from("data/sessions.jsonl"),
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// Returns [`EvalError::Configuration`] when a present variable fails to
    /// parse; absent variables never fail.
    pub fn from_env() -> Result<Self, EvalError> {
        let defaults = Self::default();
        Ok(Self {
            evaluator_host: env::var("EVALUATOR_HOST").unwrap_or(defaults.evaluator_host),
            evaluator_port: parse_var("EVALUATOR_PORT", defaults.evaluator_port)?,
            tool_server_port: parse_var("TOOL_SERVER_PORT", defaults.tool_server_port)?,
            headless: env::var("BROWSER_HEADLESS")
                .map(|v| parse_truthy(&v))
                .unwrap_or(defaults.headless),
            max_tool_calls: parse_var("MAX_TOOL_CALLS", defaults.max_tool_calls)?,
            max_steps: parse_var("MAX_STEPS", defaults.max_steps)?,
            timeout_seconds: parse_var("TIMEOUT_SECONDS", defaults.timeout_seconds)?,
            send_timeout_seconds: parse_var("SEND_TIMEOUT_SECONDS", defaults.send_timeout_seconds)?,
            poll_interval_ms: parse_var("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            dataset_root: env::var("DATASET_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_root),
            token_limit_per_observation: parse_var(
                "TOKEN_LIMIT_PER_OBSERVATION",
                defaults.token_limit_per_observation,
            )?,
            lambda_c: parse_var("LAMBDA_C", defaults.lambda_c)?,
            lambda_l: parse_var("LAMBDA_L", defaults.lambda_l)?,
            rate_limit_enabled: env::var("RATE_LIMIT_ENABLED")
                .map(|v| parse_truthy(&v))
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_requests_per_minute: parse_var(
                "RATE_LIMIT_REQUESTS_PER_MINUTE",
                defaults.rate_limit_requests_per_minute,
            )?,
            sessions_persistent: env::var("SESSIONS_PERSISTENT")
                .map(|v| parse_truthy(&v))
                .unwrap_or(defaults.sessions_persistent),
            sessions_db_path: env::var("SESSIONS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sessions_db_path),
        })
    }

    /// Address string for the A2A server.
    pub fn evaluator_addr(&self) -> String {
        format!("{}:{}", self.evaluator_host, self.evaluator_port)
    }

    /// Address string for the tool server.
    pub fn tool_server_addr(&self) -> String {
        format!("{}:{}", self.evaluator_host, self.tool_server_port)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, EvalError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            EvalError::Configuration(format!("invalid value for {}: {:?}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
