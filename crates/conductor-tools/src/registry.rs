use crate::tool::{Tool, ToolDescriptor};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, Params, ToolExecutor, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Central registry for all available tools.
///
/// Constructed explicitly and handed to executors; there is no global instance.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "Replacing previously registered tool");
        }
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors sorted by tool name.
    pub fn list_descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut descriptors: Vec<&ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    /// Execute a tool by name, checking required parameters first.
    async fn execute_tool(&self, name: &str, params: Params) -> ConductorResult<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ConductorError::Tool(format!("Unknown tool: {name}")))?;

        let missing: Vec<&str> = tool
            .descriptor()
            .required_params()
            .into_iter()
            .filter(|p| params.get(*p).map_or(true, serde_json::Value::is_null))
            .collect();
        if !missing.is_empty() {
            warn!(tool = %name, missing = ?missing, "Rejected tool call with missing parameters");
            return Ok(ToolResult::failure(format!(
                "Missing required parameter(s) for '{name}': {}",
                missing.join(", ")
            )));
        }

        debug!(tool = %name, "Executing tool");
        tool.execute(params).await
    }
}
