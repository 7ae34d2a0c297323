//! Tool declarations: the per-session schema catalog and the built-in `render` tool.

use crate::config::ToolDeclaration;
use crate::dispatcher::ToolHandler;
use crate::error::{LiveError, Result};
use crate::protocol::ToolCall;
use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Name of the built-in chart tool.
pub const RENDER_TOOL: &str = "render";

/// Compiled argument schemas for the tools declared in one session.
///
/// Built when the session connects and immutable until the next connect.
pub struct ToolCatalog {
    entries: HashMap<String, CatalogEntry>,
}

struct CatalogEntry {
    declaration: ToolDeclaration,
    validator: Validator,
}

impl ToolCatalog {
    /// Compile every declaration's parameter schema.
    pub fn compile(declarations: &[ToolDeclaration]) -> Result<Self> {
        let mut entries = HashMap::with_capacity(declarations.len());
        for declaration in declarations {
            let validator = Validator::new(&declaration.parameters).map_err(|e| {
                LiveError::config(format!(
                    "Invalid parameter schema for tool '{}': {}",
                    declaration.name, e
                ))
            })?;
            entries.insert(
                declaration.name.clone(),
                CatalogEntry { declaration: declaration.clone(), validator },
            );
        }
        Ok(Self { entries })
    }

    /// An empty catalog.
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Whether `name` was declared.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The declaration for `name`.
    pub fn declaration(&self, name: &str) -> Option<&ToolDeclaration> {
        self.entries.get(name).map(|entry| &entry.declaration)
    }

    /// Declared tool names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of declared tools.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no tools were declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check a call's arguments against its declared schema.
    ///
    /// Calls to undeclared tools pass; there is nothing to check them against.
    pub fn validate(&self, call: &ToolCall) -> Result<()> {
        let Some(entry) = self.entries.get(&call.name) else {
            return Ok(());
        };
        let problems: Vec<String> =
            entry.validator.iter_errors(&call.args).map(|e| e.to_string()).collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LiveError::protocol(format!(
                "arguments for '{}' (call {}) do not match its schema: {}",
                call.name,
                call.id,
                problems.join("; ")
            )))
        }
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ToolCatalog").field("tools", &names).finish()
    }
}

/// Declaration of the `render` tool: one required string `payload`.
pub fn render_declaration() -> ToolDeclaration {
    ToolDeclaration::new(RENDER_TOOL)
        .with_description(
            "Render a chart for the user. The payload is passed unchanged to the chart renderer.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "payload": {
                    "type": "string",
                    "description": "Chart specification understood by the renderer"
                }
            },
            "required": ["payload"]
        }))
}

/// Handler for `render` that forwards the payload to an external consumer.
#[derive(Debug, Clone)]
pub struct RenderTool {
    tx: mpsc::Sender<String>,
}

impl RenderTool {
    /// Create the tool and the receiver the chart renderer reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ToolHandler for RenderTool {
    async fn execute(&self, call: &ToolCall) -> Result<Value> {
        let payload = call
            .args
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| LiveError::tool("render requires a string 'payload'"))?;
        self.tx
            .send(payload.to_string())
            .await
            .map_err(|_| LiveError::tool("chart renderer is not listening"))?;
        tracing::debug!(call_id = %call.id, bytes = payload.len(), "Forwarded render payload");
        Ok(json!({ "success": true }))
    }
}
