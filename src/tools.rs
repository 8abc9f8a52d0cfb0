//! Tool definition and registry.
//!
//! Tools let the model act on the local workspace. Each tool declares a
//! name, a description, and a JSON Schema for its arguments; the registry
//! resolves name → schema → handler at startup, so an unknown tool name is
//! a validation failure at call time, never a dynamic lookup surprise.
//!
//! # Implementing a tool
//!
//! ```ignore
//! struct ListDir;
//!
//! #[async_trait]
//! impl Tool for ListDir {
//!     fn name(&self) -> &'static str { "list_dir" }
//!     fn description(&self) -> &'static str { "List directory entries" }
//!     fn input_schema(&self) -> Value {
//!         json!({
//!             "type": "object",
//!             "properties": { "path": { "type": "string" } },
//!             "required": ["path"]
//!         })
//!     }
//!     async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
//!         ...
//!     }
//! }
//! ```

use crate::llm::ToolSchema;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to every tool invocation.
///
/// Handlers must be safe for concurrent invocation against the same working
/// directory; the executor does not serialize filesystem access for them.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub working_dir: PathBuf,
}

impl ToolContext {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema describing the accepted arguments. Must be an object
    /// schema; the executor validates arguments against it before the
    /// handler runs.
    fn input_schema(&self) -> Value;

    /// Per-invocation timeout. `None` uses the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the tool. A returned error becomes an error tool result; it
    /// never aborts the batch or the turn.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Errors surfaced at registration time.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {name}")]
    Duplicate { name: String },

    #[error("invalid schema for tool {name}: {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Static registry of name → schema → handler triples.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names and non-object schemas are rejected
    /// here, at startup, rather than at call time.
    ///
    /// # Errors
    /// Returns [`RegistryError`] on a duplicate name or malformed schema.
    pub fn register<T>(&mut self, tool: T) -> Result<&mut Self, RegistryError>
    where
        T: Tool + 'static,
    {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }

        let schema = tool.input_schema();
        if schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(RegistryError::InvalidSchema {
                name,
                reason: "input schema must declare \"type\": \"object\"".to_string(),
            });
        }

        self.by_name.insert(name, self.tools.len());
        self.tools.push(Arc::new(tool));
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool declarations for the provider request, in registration order.
    #[must_use]
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }
}

/// Validate `args` against an object schema's `required` and property
/// `type` keywords.
///
/// This covers the failure modes models actually produce (missing fields,
/// wrong primitive types, non-object payloads) without pulling in a full
/// draft validator; tools deserialize their input and enforce the rest.
///
/// # Errors
/// Returns a human-readable description of the first violation.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(object) = args.as_object() else {
        return Err(format!("arguments must be a JSON object, got {args}"));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(format!("missing required argument: {field}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !value_matches_type(value, expected) {
                return Err(format!(
                    "argument {key} should be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
