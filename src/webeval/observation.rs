//! Observation filtering and token accounting.
//!
//! Raw browser observations are converted into compact, token-bounded
//! payloads whose shape depends on the selected [`ObservationMode`]. Every
//! payload carries the page URL, the task goal, the last action result, a
//! cl100k token estimate, and the mode tag; a `warning` field is added when
//! the estimate exceeds the active profile's limit. Content is never
//! silently truncated — truncation is line-based, proportional to the
//! overage, and only applied when explicitly requested upstream.
//!
//! # Example
//!
//! ```rust
//! use webeval::observation::{ObservationFilter, RawObservation};
//!
//! let filter = ObservationFilter::new(5000);
//! let raw = RawObservation {
//!     axtree_txt: "[13] button 'Submit'".to_string(),
//!     url: "https://example.test".to_string(),
//!     goal: "Click the button".to_string(),
//!     ..RawObservation::default()
//! };
//!
//! let observation = filter.filter(&raw, None);
//! assert_eq!(observation.observation_mode, "axtree");
//! assert!(observation.token_estimate > 0);
//! assert!(observation.warning.is_none());
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tiktoken_rs::CoreBPE;

use crate::webeval::profiles::{BenchmarkProfile, FilteringStrategy, ObservationMode};

lazy_static! {
    /// Shared cl100k encoder. Construction parses the embedded vocabulary
    /// and is too expensive to repeat per observation.
    static ref CL100K: CoreBPE =
        tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary must parse");
}

/// Estimate the token count of a text with the cl100k encoder.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    CL100K.encode_with_special_tokens(text).len() as u64
}

/// An open browser tab as reported by the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabInfo {
    pub index: u32,
    pub title: String,
    pub url: String,
}

/// Raw observation handed over by the browser backend.
#[derive(Debug, Clone, Default)]
pub struct RawObservation {
    /// Accessibility tree in textual form, one node per line.
    pub axtree_txt: String,
    /// Extra element properties rendered as text, when the environment
    /// exposes them.
    pub extra_properties_txt: Option<String>,
    pub url: String,
    pub goal: String,
    /// Error text of the last executed action, empty when it succeeded.
    pub last_action_error: String,
    pub screenshot: Option<Vec<u8>>,
    pub page_html: Option<String>,
    pub open_tabs: Vec<TabInfo>,
    /// Instructor dialogue turns for dialogue-based benchmarks.
    pub dialogue: Vec<String>,
}

/// Mode-specific, token-accounted observation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredObservation {
    pub axtree_txt: String,
    pub url: String,
    pub goal: String,
    pub last_action_result: String,
    pub token_estimate: u64,
    pub observation_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
}

impl FilteredObservation {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

struct ActiveProfile {
    mode: ObservationMode,
    token_limit: u32,
    strategy: FilteringStrategy,
}

/// Observation filter carrying the active benchmark's mode, token limit,
/// and role strategy. The orchestrator swaps the profile at task boundaries;
/// invocations read it under a short lock.
pub struct ObservationFilter {
    active: RwLock<ActiveProfile>,
}

impl ObservationFilter {
    /// Create a filter with a global default limit and the plain axtree mode.
    pub fn new(default_token_limit: u32) -> Self {
        Self {
            active: RwLock::new(ActiveProfile {
                mode: ObservationMode::Axtree,
                token_limit: default_token_limit,
                strategy: FilteringStrategy {
                    focus_roles: Vec::new(),
                    exclude_roles: Vec::new(),
                },
            }),
        }
    }

    /// Adopt a benchmark profile's mode, limit, and role strategy.
    pub fn set_profile(&self, profile: &BenchmarkProfile) {
        let mut active = self.active.write().expect("observation filter lock poisoned");
        active.mode = profile.observation_mode;
        active.token_limit = profile.token_limit;
        active.strategy = profile.filtering.clone();
    }

    /// The currently active default mode.
    pub fn default_mode(&self) -> ObservationMode {
        self.active.read().expect("observation filter lock poisoned").mode
    }

    /// The currently active token limit.
    pub fn token_limit(&self) -> u32 {
        self.active.read().expect("observation filter lock poisoned").token_limit
    }

    /// Filter a raw observation, optionally overriding the active mode.
    pub fn filter(
        &self,
        raw: &RawObservation,
        mode_override: Option<ObservationMode>,
    ) -> FilteredObservation {
        let (mode, token_limit, strategy) = {
            let active = self.active.read().expect("observation filter lock poisoned");
            (
                mode_override.unwrap_or(active.mode),
                active.token_limit,
                active.strategy.clone(),
            )
        };

        let mut screenshot_ref = None;
        let content = match mode {
            ObservationMode::AxtreeCompact => compact_axtree(&raw.axtree_txt, &strategy),
            ObservationMode::Axtree => raw.axtree_txt.clone(),
            ObservationMode::AxtreeFull => match &raw.extra_properties_txt {
                Some(props) => format!("{}\n{}", raw.axtree_txt, props),
                None => raw.axtree_txt.clone(),
            },
            ObservationMode::AxtreeWithScreenshot => {
                screenshot_ref = Some(screenshot_reference(raw));
                raw.axtree_txt.clone()
            }
        };

        let token_estimate = estimate_tokens(&content)
            + estimate_tokens(&raw.url)
            + estimate_tokens(&raw.goal)
            + estimate_tokens(&raw.last_action_error);

        let warning = if token_estimate > token_limit as u64 {
            Some(format!(
                "Token count {} exceeds limit {}",
                token_estimate, token_limit
            ))
        } else {
            None
        };

        FilteredObservation {
            axtree_txt: content,
            url: raw.url.clone(),
            goal: raw.goal.clone(),
            last_action_result: raw.last_action_error.clone(),
            token_estimate,
            observation_mode: mode.as_str().to_string(),
            warning,
            screenshot_ref,
        }
    }
}

/// Text reference for screenshot availability.
fn screenshot_reference(raw: &RawObservation) -> String {
    match &raw.screenshot {
        Some(bytes) => format!("[Screenshot: binary data available] ({} bytes)", bytes.len()),
        None => "[No screenshot available]".to_string(),
    }
}

/// Role of an axtree line: the first alphabetic token after the optional
/// `[bid]` prefix.
fn line_role(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = if trimmed.starts_with('[') {
        trimmed.split_once(']').map(|(_, r)| r.trim_start()).unwrap_or(trimmed)
    } else {
        trimmed
    };
    rest.split_whitespace().next()
}

/// Compact mode: drop excluded roles (focus roles are always kept) and
/// collapse runs of adjacent static-text nodes into one line.
fn compact_axtree(axtree: &str, strategy: &FilteringStrategy) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut static_run: Vec<String> = Vec::new();

    let flush_run = |run: &mut Vec<String>, out: &mut Vec<String>| {
        if run.is_empty() {
            return;
        }
        if run.len() == 1 {
            out.push(run[0].clone());
        } else {
            let texts: Vec<&str> = run
                .iter()
                .filter_map(|line| line.split_once('\'').map(|(_, rest)| rest.trim_end_matches('\'')))
                .collect();
            out.push(format!("StaticText '{}'", texts.join(" ")));
        }
        run.clear();
    };

    for line in axtree.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let role = match line_role(line) {
            Some(role) => role,
            None => continue,
        };
        if role == "StaticText" {
            static_run.push(line.trim().to_string());
            continue;
        }
        flush_run(&mut static_run, &mut out);

        let focused = strategy.focus_roles.iter().any(|r| r == role);
        let excluded = strategy.exclude_roles.iter().any(|r| r == role);
        if excluded && !focused {
            continue;
        }
        out.push(line.to_string());
    }
    flush_run(&mut static_run, &mut out);

    out.join("\n")
}

/// Truncate content to roughly fit a token limit.
///
/// Line-based and proportional to the overage; optionally preserves a
/// prefix and suffix of the original. Content within the limit is returned
/// unchanged. Only applied when an upstream policy explicitly asks for it —
/// the default behavior is warn-without-truncate.
pub fn truncate_to_limit(
    content: &str,
    token_limit: u32,
    preserve_start_lines: usize,
    preserve_end_lines: usize,
) -> String {
    let current = estimate_tokens(content);
    if current <= token_limit as u64 {
        return content.to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    let keep = ((lines.len() as f64) * (token_limit as f64 / current as f64)).floor() as usize;
    let keep = keep.max(1).min(lines.len());

    if preserve_start_lines > 0 && preserve_end_lines > 0 {
        let start = preserve_start_lines.min(keep);
        let end = preserve_end_lines.min(keep.saturating_sub(start));
        if start + end < lines.len() {
            let dropped = lines.len() - start - end;
            return format!(
                "{}\n... ({} lines truncated) ...\n{}",
                lines[..start].join("\n"),
                dropped,
                lines[lines.len() - end..].join("\n")
            );
        }
    }

    let dropped = lines.len() - keep;
    format!("{}\n... (truncated {} lines)", lines[..keep].join("\n"), dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webeval::profiles::BenchmarkProfileRegistry;

    fn raw_with_tree(tree: &str) -> RawObservation {
        RawObservation {
            axtree_txt: tree.to_string(),
            url: "https://example.test/task".to_string(),
            goal: "Click the button".to_string(),
            ..RawObservation::default()
        }
    }

    #[test]
    fn test_estimate_tokens_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("Click the submit button") > 0);
    }

    #[test]
    fn test_axtree_mode_keeps_full_tree() {
        let filter = ObservationFilter::new(5000);
        let raw = raw_with_tree("[1] RootWebArea 'Task'\n[13] button 'Submit'");
        let obs = filter.filter(&raw, Some(ObservationMode::Axtree));
        assert_eq!(obs.axtree_txt, raw.axtree_txt);
        assert_eq!(obs.observation_mode, "axtree");
        assert!(obs.warning.is_none());
    }

    #[test]
    fn test_compact_mode_drops_excluded_roles() {
        let registry = BenchmarkProfileRegistry::new();
        let filter = ObservationFilter::new(5000);
        filter.set_profile(registry.get("miniwob").unwrap());

        let raw = raw_with_tree(
            "[1] RootWebArea 'Task'\n\
             [4] generic ''\n\
             [13] button 'Submit'\n\
             [14] LineBreak ''",
        );
        let obs = filter.filter(&raw, None);
        assert_eq!(obs.observation_mode, "axtree_compact");
        assert!(obs.axtree_txt.contains("button 'Submit'"));
        assert!(!obs.axtree_txt.contains("generic"));
        assert!(!obs.axtree_txt.contains("LineBreak"));
    }

    #[test]
    fn test_compact_mode_collapses_static_text() {
        let strategy = FilteringStrategy {
            focus_roles: vec![],
            exclude_roles: vec![],
        };
        let tree = "[2] StaticText 'Hello'\n[3] StaticText 'world'\n[13] button 'Go'";
        let compact = compact_axtree(tree, &strategy);
        assert!(compact.contains("StaticText 'Hello world'"));
        assert_eq!(compact.matches("StaticText").count(), 1);
    }

    #[test]
    fn test_screenshot_mode_attaches_reference() {
        let filter = ObservationFilter::new(5000);
        let mut raw = raw_with_tree("[13] button 'Go'");
        raw.screenshot = Some(vec![0u8; 2048]);
        let obs = filter.filter(&raw, Some(ObservationMode::AxtreeWithScreenshot));
        assert_eq!(obs.screenshot_ref.as_deref(), Some("[Screenshot: binary data available] (2048 bytes)"));
    }

    #[test]
    fn test_full_mode_appends_properties() {
        let filter = ObservationFilter::new(5000);
        let mut raw = raw_with_tree("[13] button 'Go'");
        raw.extra_properties_txt = Some("13: {visible: true}".to_string());
        let obs = filter.filter(&raw, Some(ObservationMode::AxtreeFull));
        assert!(obs.axtree_txt.contains("visible: true"));
    }

    #[test]
    fn test_warning_only_when_strictly_over_limit() {
        let filter = ObservationFilter::new(5000);
        let raw = raw_with_tree("[13] button 'Go'");
        let obs = filter.filter(&raw, Some(ObservationMode::Axtree));
        let exact = obs.token_estimate as u32;

        let at_limit = ObservationFilter::new(exact);
        let obs = at_limit.filter(&raw, Some(ObservationMode::Axtree));
        assert!(obs.warning.is_none(), "estimate equal to limit must not warn");

        let one_under = ObservationFilter::new(exact - 1);
        let obs = one_under.filter(&raw, Some(ObservationMode::Axtree));
        assert!(obs.warning.is_some(), "one token over the limit must warn");
        assert_eq!(obs.axtree_txt, raw.axtree_txt, "content is not silently truncated");
    }

    #[test]
    fn test_truncate_within_limit_is_identity() {
        let content = "line one\nline two";
        assert_eq!(truncate_to_limit(content, 10_000, 0, 0), content);
    }

    #[test]
    fn test_truncate_reduces_lines_proportionally() {
        let content = (0..200)
            .map(|i| format!("[{}] StaticText 'row number {}'", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let truncated = truncate_to_limit(&content, 100, 0, 0);
        assert!(truncated.contains("truncated"));
        assert!(truncated.lines().count() < 200);
    }

    #[test]
    fn test_truncate_preserves_prefix_and_suffix() {
        let content = (0..100)
            .map(|i| format!("row-{}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let truncated = truncate_to_limit(&content, 50, 3, 3);
        assert!(truncated.starts_with("row-0"));
        assert!(truncated.trim_end().ends_with("row-99"));
        assert!(truncated.contains("lines truncated"));
    }
}
