//! Agent discovery documents.
//!
//! The evaluator publishes an A2A agent card at the well-known discovery
//! paths. The public card carries identity, capabilities, and the evaluation
//! skill; the extended card (for authenticated callers) adds per-benchmark
//! metadata, the efficiency mandates, and the scoring formula.

use serde::{Deserialize, Serialize};

use crate::webeval::profiles::BenchmarkProfileRegistry;
use crate::webeval::scoring::PenaltyCalculator;

/// Protocol version the evaluator speaks.
pub const A2A_PROTOCOL_VERSION: &str = "0.3.0";
/// Evaluator version advertised on the card.
pub const AGENT_VERSION: &str = "1.0.0";
/// Evaluator display name.
pub const AGENT_NAME: &str = "Web Evaluation Agent";

const PROVIDER_ORG: &str = "webeval";
const PROVIDER_URL: &str = "https://github.com/CloudLLM-ai/webeval";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProvider {
    pub organization: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub examples: Vec<String>,
    pub input_modes: Vec<String>,
    pub output_modes: Vec<String>,
}

/// The public agent card document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub protocol_version: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
    pub provider: AgentProvider,
    pub capabilities: AgentCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
}

/// Build the public agent card for the given public URL.
///
/// # Example
///
/// ```rust
/// use webeval::agent_card::build_agent_card;
/// use webeval::profiles::BenchmarkProfileRegistry;
///
/// let registry = BenchmarkProfileRegistry::new();
/// let card = build_agent_card("http://localhost:9009", &registry);
/// assert_eq!(card.protocol_version, "0.3.0");
/// assert!(card.capabilities.streaming);
/// assert_eq!(card.skills.len(), 1);
/// ```
pub fn build_agent_card(agent_url: &str, registry: &BenchmarkProfileRegistry) -> AgentCard {
    let display_names: Vec<&str> = registry
        .all_profiles()
        .iter()
        .map(|p| p.display_name.as_str())
        .collect();
    let benchmark_ids = registry.supported_benchmarks().join(", ");

    let skill = AgentSkill {
        id: "web-automation-evaluation".to_string(),
        name: "Web Automation Evaluation".to_string(),
        description: format!(
            "Evaluate participant agents on web automation benchmarks ({}). \
             Browser control is delivered through a dynamically configured tool server.",
            benchmark_ids
        ),
        tags: vec![
            "evaluation".to_string(),
            "benchmark".to_string(),
            "web-automation".to_string(),
            "browser".to_string(),
        ],
        examples: vec![serde_json::json!({
            "run_id": "demo-1",
            "benchmarks": ["miniwob"],
            "tasks_by_benchmark": {"miniwob": ["miniwob.click-test"]},
            "participants": {"participant": {"role": "participant", "endpoint": "http://127.0.0.1:9010"}},
        })
        .to_string()],
        input_modes: vec!["application/json".to_string(), "text/plain".to_string()],
        output_modes: vec!["application/json".to_string(), "text/plain".to_string()],
    };

    AgentCard {
        protocol_version: A2A_PROTOCOL_VERSION.to_string(),
        name: AGENT_NAME.to_string(),
        description: format!(
            "Evaluation harness for web automation benchmarks. Supports {}.",
            display_names.join(", ")
        ),
        version: AGENT_VERSION.to_string(),
        url: agent_url.to_string(),
        provider: AgentProvider {
            organization: PROVIDER_ORG.to_string(),
            url: PROVIDER_URL.to_string(),
        },
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: false,
            state_transition_history: true,
        },
        default_input_modes: vec!["application/json".to_string(), "text/plain".to_string()],
        default_output_modes: vec!["application/json".to_string(), "text/plain".to_string()],
        skills: vec![skill],
    }
}

/// Build the extended agent card: the public card plus benchmark metadata,
/// efficiency mandates, and the scoring formula.
pub fn build_extended_agent_card(
    agent_url: &str,
    registry: &BenchmarkProfileRegistry,
    calculator: &PenaltyCalculator,
    token_limit_default: u32,
) -> serde_json::Value {
    let card = build_agent_card(agent_url, registry);
    let mut document = serde_json::to_value(&card).unwrap_or(serde_json::Value::Null);

    let mut benchmarks = serde_json::Map::new();
    for profile in registry.all_profiles() {
        benchmarks.insert(
            profile.benchmark_id.clone(),
            serde_json::json!({
                "display_name": profile.display_name,
                "token_limit": profile.token_limit,
                "observation_mode": profile.observation_mode.as_str(),
                "extra_tools": profile.extra_tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            }),
        );
    }

    document["extended"] = serde_json::json!({
        "benchmarks": benchmarks,
        "efficiency_mandates": {
            "token_limit_per_observation": token_limit_default,
            "latency_target_seconds": 2.0,
            "zero_orphaned_processes": true,
        },
        "scoring_formula": {
            "formula": "final_score = task_success x (1 - lambda_c x ln(C) - lambda_l x L)",
            "lambda_c": calculator.lambda_c,
            "lambda_l": calculator.lambda_l,
        },
    });
    document
}
