use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use maestro_types::CoreError;

mod calculate;
mod vfs;

pub use calculate::CalculateTool;
pub use vfs::{VfsFileInfo, VirtualFs};

/// Tool failure classes. `Unauthorized` is produced by callers enforcing
/// allow-lists; the registry itself only knows names and schemas.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid parameters for `{tool}`: {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("unauthorized tool access: {0}")]
    Unauthorized(String),

    #[error("tool `{tool}` failed: {reason}")]
    Execution { tool: String, reason: String },
}

impl From<ToolError> for CoreError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::UnknownTool(name) => CoreError::UnknownTool(name),
            ToolError::InvalidParameters { tool, reason } => {
                CoreError::InvalidParameters(format!("{tool}: {reason}"))
            }
            ToolError::Unauthorized(detail) => CoreError::Unauthorized(detail),
            ToolError::Execution { tool, reason } => {
                CoreError::Internal(format!("tool {tool}: {reason}"))
            }
        }
    }
}

/// Published description of one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-schema shaped parameter description
    pub parameters: Value,
    #[serde(default)]
    pub category: String,
}

/// Per-call context handed to tools
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: String,
    pub virtual_fs: VirtualFs,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            virtual_fs: VirtualFs::default(),
        }
    }

    pub fn with_virtual_fs(mut self, virtual_fs: VirtualFs) -> Self {
        self.virtual_fs = virtual_fs;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Uniform execute(name, params, ctx) surface. Read-mostly after startup;
/// registration takes the write lock and is expected to be rare.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with the built-in tools
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut map = registry
                .tools
                .try_write()
                .expect("fresh registry is uncontended");
            map.insert("calculate".to_string(), Arc::new(CalculateTool));
            map.insert("write_todos".to_string(), Arc::new(WriteTodosTool));
        }
        registry
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let schema = tool.schema();
        validate_schema_shape(&schema)?;
        self.tools.write().await.insert(schema.name.clone(), tool);
        Ok(())
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn get_all(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate parameters against the tool's schema, then dispatch.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = {
            let tools = self.tools.read().await;
            tools
                .get(name)
                .cloned()
                .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?
        };

        let schema = tool.schema();
        validate_params(&schema, &params)?;
        tracing::debug!(tool = name, user = %ctx.user_id, "executing tool");
        tool.execute(params, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Reject structurally broken schemas at registration time.
fn validate_schema_shape(schema: &ToolSchema) -> Result<(), ToolError> {
    fn walk(tool: &str, path: &str, value: &Value) -> Result<(), ToolError> {
        let Some(obj) = value.as_object() else {
            return Ok(());
        };
        if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
            return Err(ToolError::InvalidParameters {
                tool: tool.to_string(),
                reason: format!("array schema at `{path}` missing items"),
            });
        }
        if let Some(items) = obj.get("items") {
            walk(tool, &format!("{path}.items"), items)?;
        }
        if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
            for (key, child) in props {
                walk(tool, &format!("{path}.properties.{key}"), child)?;
            }
        }
        Ok(())
    }
    walk(&schema.name, "$", &schema.parameters)
}

/// Structural parameter validation: object shape, required keys, primitive
/// type tags. Anything deeper is the tool's own business.
fn validate_params(schema: &ToolSchema, params: &Value) -> Result<(), ToolError> {
    let invalid = |reason: String| ToolError::InvalidParameters {
        tool: schema.name.clone(),
        reason,
    };

    let Some(spec) = schema.parameters.as_object() else {
        return Ok(());
    };
    if spec.get("type").and_then(|t| t.as_str()) == Some("object") && !params.is_object() {
        return Err(invalid("expected an object".to_string()));
    }

    if let Some(required) = spec.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if params.get(key).is_none() {
                return Err(invalid(format!("missing required field `{key}`")));
            }
        }
    }

    if let Some(props) = spec.get("properties").and_then(|v| v.as_object()) {
        for (key, prop) in props {
            let Some(value) = params.get(key) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(invalid(format!("field `{key}` is not a {expected}")));
            }
        }
    }

    Ok(())
}

// ============================================================================
// write_todos
// ============================================================================

/// Mirrors the planner's task list into the session's virtual filesystem so
/// downstream consumers can inspect it.
pub struct WriteTodosTool;

#[async_trait]
impl Tool for WriteTodosTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_todos".to_string(),
            description: "Record the current task list".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {"type": "object"}
                    }
                },
                "required": ["todos"]
            }),
            category: "planning".to_string(),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let todos = params.get("todos").cloned().unwrap_or(Value::Array(vec![]));
        let rendered = serde_json::to_string_pretty(&todos).map_err(|e| ToolError::Execution {
            tool: "write_todos".to_string(),
            reason: e.to_string(),
        })?;
        ctx.virtual_fs.write("todos.json", &rendered).await;
        let count = todos.as_array().map(|a| a.len()).unwrap_or(0);
        Ok(json!({"written": count, "path": "todos.json"}))
    }
}
