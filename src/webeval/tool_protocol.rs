//! Tool surface abstraction for the browser tool server.
//!
//! The tool server exposes a small set of named operations to the
//! participant. Each operation is described by [`ToolMetadata`] (identity,
//! description, typed parameters) and executed through a [`ToolHandler`]
//! implementation. Metadata doubles as the source for both the wire-level
//! tool discovery response and the plain-text tool documentation embedded in
//! task-assignment messages.
//!
//! # Example
//!
//! ```rust
//! use webeval::tool_protocol::{ToolMetadata, ToolParameter, ToolParameterType};
//!
//! let meta = ToolMetadata::new("get_observation", "Return the current filtered observation.")
//!     .with_parameter(
//!         ToolParameter::new("mode", ToolParameterType::String)
//!             .with_description("Observation mode override"),
//!     );
//! assert_eq!(meta.parameters.len(), 1);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool execution was successful.
    pub success: bool,
    /// The output data from the tool.
    pub output: serde_json::Value,
    /// Optional error message if execution failed.
    pub error: Option<String>,
    /// Metadata about the execution (timing, counters, etc.).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    /// Convenience constructor for successful tool execution.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Convenience constructor for failed tool execution.
    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    /// Attach application specific metadata to the result.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Type of a tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ToolParameterType {
    fn schema_name(&self) -> &'static str {
        match self {
            ToolParameterType::String => "string",
            ToolParameterType::Number => "number",
            ToolParameterType::Integer => "integer",
            ToolParameterType::Boolean => "boolean",
            ToolParameterType::Array => "array",
            ToolParameterType::Object => "object",
        }
    }
}

/// A parameter accepted by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl ToolParameter {
    /// Define a new tool parameter with the provided name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            default: None,
        }
    }

    /// Add a human readable description that surfaces in generated schemas
    /// and task-message documentation.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Provide a default value used when the caller omits the parameter.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Metadata about a tool: identity, description, parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Create metadata with the supplied identifier and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition.
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Project the parameters as a JSON-schema-like object, the shape the
    /// tool discovery endpoint returns as `inputSchema`.
    pub fn input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert(
                "type".to_string(),
                serde_json::Value::String(param.param_type.schema_name().to_string()),
            );
            if let Some(desc) = &param.description {
                prop.insert("description".to_string(), serde_json::Value::String(desc.clone()));
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), serde_json::Value::Object(prop));
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Trait implemented by every tool the server can dispatch to.
///
/// Handlers are shared between concurrent invocations, so implementations
/// must be `Send + Sync` and keep any mutable state behind their own locks.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with the given JSON parameters.
    async fn execute(
        &self,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;
}

/// Render tool metadata as the plain-text documentation block embedded in
/// task-assignment messages.
///
/// The output is deterministic for a given tool list: a consumer relying
/// only on the text part of the task message must be able to drive the task.
pub fn format_tools_documentation(tools: &[ToolMetadata]) -> String {
    let mut doc = String::from("## AVAILABLE TOOLS\n");
    for tool in tools {
        doc.push_str(&format!("\n### `{}`\n\n{}\n", tool.name, tool.description));
        if tool.parameters.is_empty() {
            doc.push_str("\nParameters: none\n");
            continue;
        }
        doc.push_str("\nParameters:\n");
        for param in &tool.parameters {
            let requirement = if param.required { "required" } else { "optional" };
            let description = param.description.as_deref().unwrap_or("");
            doc.push_str(&format!(
                "- `{}` ({}, {}): {}\n",
                param.name,
                param.param_type.schema_name(),
                requirement,
                description
            ));
        }
    }
    doc
}
