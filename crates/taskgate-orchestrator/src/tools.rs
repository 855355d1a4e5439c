use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
}

/// An executable capability. The returned string is the tool's raw result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// # Errors
    /// Returns an error when the arguments are rejected or execution fails.
    async fn execute(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

#[derive(Clone)]
pub struct ToolEntry {
    pub description: String,
    pub input_schema: Value,
    pub requires_approval: bool,
    pub tool: Arc<dyn Tool>,
}

impl ToolEntry {
    #[must_use]
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            description: String::new(),
            input_schema: Value::Object(Map::new()),
            requires_approval: false,
            tool,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Always route calls through the approval gate, whatever the policy decides.
    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEntry")
            .field("description", &self.description)
            .field("requires_approval", &self.requires_approval)
            .finish_non_exhaustive()
    }
}

pub trait ToolRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<ToolEntry>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
}

impl StaticToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `echo` preinstalled.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new().with_tool(
            "echo",
            ToolEntry::new(Arc::new(EchoTool))
                .with_description("Returns its arguments as a JSON object."),
        )
    }

    #[must_use]
    pub fn with_tool(mut self, name: impl Into<String>, entry: ToolEntry) -> Self {
        self.register(name, entry);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, entry: ToolEntry) {
        self.entries.insert(name.into(), entry);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn lookup(&self, name: &str) -> Option<ToolEntry> {
        self.entries.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn execute(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        serde_json::to_string(args).map_err(|err| ToolError::Execution(err.to_string()))
    }
}
