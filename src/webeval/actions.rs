//! Browser action model.
//!
//! Actions arrive from the participant as tagged JSON records with a
//! required `action` tag and tag-dependent fields. Parsing and shape
//! validation happen before any action in a batch executes: an unknown tag
//! or a missing required field fails the whole batch.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use webeval::actions::parse_action_batch;
//!
//! let batch = [
//!     json!({"action": "click", "bid": "13"}),
//!     json!({"action": "fill", "bid": "5", "text": "hello"}),
//! ];
//! let actions = parse_action_batch(&batch).unwrap();
//! assert_eq!(actions[0].tag(), "click");
//!
//! // A missing required field fails the whole batch before execution.
//! let bad = [json!({"action": "fill", "bid": "5"})];
//! assert!(parse_action_batch(&bad).is_err());
//! ```

use serde::{Deserialize, Serialize};

use crate::webeval::error::EvalError;

/// Maximum number of actions accepted in a single `execute_actions` batch.
pub const MAX_ACTIONS_PER_BATCH: usize = 50;

/// A single browser action.
///
/// The `press` tag is accepted as an alias for `keyboard_press`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        bid: String,
    },
    Dblclick {
        bid: String,
    },
    Hover {
        bid: String,
    },
    Clear {
        bid: String,
    },
    Focus {
        bid: String,
    },
    Fill {
        bid: String,
        text: String,
    },
    SelectOption {
        bid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dx: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dy: Option<i64>,
    },
    KeyboardType {
        text: String,
    },
    #[serde(alias = "press")]
    KeyboardPress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_comb: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    Goto {
        url: String,
    },
    TabFocus {
        tab_index: u32,
    },
    NewTab,
    TabClose,
    SendMsgToUser {
        text: String,
    },
    DragAndDrop {
        from_bid: String,
        to_bid: String,
    },
}

impl Action {
    /// Wire tag of the action.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Dblclick { .. } => "dblclick",
            Action::Hover { .. } => "hover",
            Action::Clear { .. } => "clear",
            Action::Focus { .. } => "focus",
            Action::Fill { .. } => "fill",
            Action::SelectOption { .. } => "select_option",
            Action::Scroll { .. } => "scroll",
            Action::KeyboardType { .. } => "keyboard_type",
            Action::KeyboardPress { .. } => "keyboard_press",
            Action::Goto { .. } => "goto",
            Action::TabFocus { .. } => "tab_focus",
            Action::NewTab => "new_tab",
            Action::TabClose => "tab_close",
            Action::SendMsgToUser { .. } => "send_msg_to_user",
            Action::DragAndDrop { .. } => "drag_and_drop",
        }
    }

    /// Validate cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), EvalError> {
        match self {
            Action::SelectOption { text, options, .. } => {
                let has_options = options.as_ref().map(|o| !o.is_empty()).unwrap_or(false);
                if text.is_none() && !has_options {
                    return Err(EvalError::Validation(
                        "select_option requires 'text' or a non-empty 'options' list".to_string(),
                    ));
                }
            }
            Action::Scroll { direction, dx, dy } => {
                if direction.is_none() && dx.is_none() && dy.is_none() {
                    return Err(EvalError::Validation(
                        "scroll requires 'direction' or numeric dx/dy".to_string(),
                    ));
                }
            }
            Action::KeyboardPress { key_comb, key } => {
                if key_comb.is_none() && key.is_none() {
                    return Err(EvalError::Validation(
                        "keyboard_press requires 'key_comb' or 'key'".to_string(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parse and validate an action batch from raw JSON values.
///
/// Fails before any execution on: an over-sized batch, an unknown tag, a
/// missing required field, or a cross-field constraint violation. Error
/// messages name the offending action index.
pub fn parse_action_batch(raw: &[serde_json::Value]) -> Result<Vec<Action>, EvalError> {
    if raw.is_empty() {
        return Err(EvalError::Validation("action batch is empty".to_string()));
    }
    if raw.len() > MAX_ACTIONS_PER_BATCH {
        return Err(EvalError::Validation(format!(
            "action batch of {} exceeds the maximum of {}",
            raw.len(),
            MAX_ACTIONS_PER_BATCH
        )));
    }

    let mut actions = Vec::with_capacity(raw.len());
    for (index, value) in raw.iter().enumerate() {
        let action: Action = serde_json::from_value(value.clone()).map_err(|e| {
            EvalError::Validation(format!("invalid action at index {}: {}", index, e))
        })?;
        action
            .validate()
            .map_err(|e| EvalError::Validation(format!("invalid action at index {}: {}", index, e)))?;
        actions.push(action);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_click_round_trip() {
        let action: Action = serde_json::from_value(json!({"action": "click", "bid": "13"})).unwrap();
        assert_eq!(action, Action::Click { bid: "13".to_string() });
        assert_eq!(action.tag(), "click");

        let back = serde_json::to_value(&action).unwrap();
        assert_eq!(back, json!({"action": "click", "bid": "13"}));
    }

    #[test]
    fn test_fill_requires_text() {
        let result: Result<Action, _> = serde_json::from_value(json!({"action": "fill", "bid": "5"}));
        assert!(result.is_err(), "fill without text must not parse");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let batch = [json!({"action": "teleport", "bid": "1"})];
        let err = parse_action_batch(&batch).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("index 0"));
    }

    #[test]
    fn test_press_alias() {
        let action: Action =
            serde_json::from_value(json!({"action": "press", "key_comb": "Control+a"})).unwrap();
        assert_eq!(action.tag(), "keyboard_press");
    }

    #[test]
    fn test_scroll_needs_some_direction() {
        let bare: Action = serde_json::from_value(json!({"action": "scroll"})).unwrap();
        assert!(bare.validate().is_err());

        let by_delta: Action = serde_json::from_value(json!({"action": "scroll", "dy": -120})).unwrap();
        assert!(by_delta.validate().is_ok());

        let by_direction: Action =
            serde_json::from_value(json!({"action": "scroll", "direction": "down"})).unwrap();
        assert!(by_direction.validate().is_ok());
    }

    #[test]
    fn test_select_option_text_or_options() {
        let neither: Action =
            serde_json::from_value(json!({"action": "select_option", "bid": "9"})).unwrap();
        assert!(neither.validate().is_err());

        let with_options: Action = serde_json::from_value(
            json!({"action": "select_option", "bid": "9", "options": ["Blue"]}),
        )
        .unwrap();
        assert!(with_options.validate().is_ok());

        let empty_options: Action = serde_json::from_value(
            json!({"action": "select_option", "bid": "9", "options": []}),
        )
        .unwrap();
        assert!(empty_options.validate().is_err());
    }

    #[test]
    fn test_tab_actions_have_no_required_fields() {
        let new_tab: Action = serde_json::from_value(json!({"action": "new_tab"})).unwrap();
        assert_eq!(new_tab, Action::NewTab);
        let close: Action = serde_json::from_value(json!({"action": "tab_close"})).unwrap();
        assert_eq!(close, Action::TabClose);
    }

    #[test]
    fn test_drag_and_drop_round_trip() {
        let action: Action = serde_json::from_value(
            json!({"action": "drag_and_drop", "from_bid": "3", "to_bid": "7"}),
        )
        .unwrap();
        assert_eq!(action.tag(), "drag_and_drop");
    }

    #[test]
    fn test_batch_size_boundary() {
        let ok: Vec<_> = (0..MAX_ACTIONS_PER_BATCH)
            .map(|i| json!({"action": "click", "bid": i.to_string()}))
            .collect();
        assert_eq!(parse_action_batch(&ok).unwrap().len(), MAX_ACTIONS_PER_BATCH);

        let over: Vec<_> = (0..MAX_ACTIONS_PER_BATCH + 1)
            .map(|i| json!({"action": "click", "bid": i.to_string()}))
            .collect();
        assert!(parse_action_batch(&over).is_err());
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(parse_action_batch(&[]).is_err());
    }

    #[test]
    fn test_bad_shape_fails_whole_batch() {
        let batch = [
            json!({"action": "fill", "bid": "5"}),
            json!({"action": "click", "bid": "1"}),
        ];
        let err = parse_action_batch(&batch).unwrap_err();
        assert!(err.to_string().contains("index 0"));
    }
}
