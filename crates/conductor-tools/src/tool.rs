use conductor_core::{ConductorResult, Params, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Metadata describing a tool's interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted parameters. Only the top-level `required`
    /// list is enforced by the registry.
    pub parameters_schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Names listed under the schema's top-level `required` array.
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters_schema["required"]
            .as_array()
            .map(|names| names.iter().filter_map(|n| n.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, params: Params) -> ConductorResult<ToolResult>;
}
