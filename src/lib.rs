// src/lib.rs

// Import the top-level `webeval` module.
pub mod webeval;

// Re-exporting key items for easier external access.
pub use webeval::a2a;
pub use webeval::actions;
pub use webeval::agent_card;
pub use webeval::assessment;
pub use webeval::benchmark_tools;
pub use webeval::browser;
pub use webeval::config;
pub use webeval::control_agent;
pub use webeval::error;
pub use webeval::observation;
pub use webeval::orchestrator;
pub use webeval::participant;
pub use webeval::profiles;
pub use webeval::scoring;
pub use webeval::security;
pub use webeval::server;
pub use webeval::session_store;
pub use webeval::shared_state;
pub use webeval::streaming;
pub use webeval::tool_protocol;
pub use webeval::tool_server;

pub use webeval::assessment::{Assessment, AssessmentConfig};
pub use webeval::config::Settings;
pub use webeval::error::EvalError;
pub use webeval::orchestrator::Orchestrator;
pub use webeval::server::serve;
