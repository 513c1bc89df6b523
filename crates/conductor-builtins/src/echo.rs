use async_trait::async_trait;
use conductor_core::{ConductorResult, Params, ToolResult};
use conductor_tools::{Tool, ToolDescriptor};

/// Returns its parameters unchanged. Handy for wiring and dry runs.
pub struct EchoTool {
    descriptor: ToolDescriptor,
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "echo".to_string(),
                description: "Return the given parameters as the result.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "additionalProperties": true
                }),
            },
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, params: Params) -> ConductorResult<ToolResult> {
        Ok(ToolResult::success(serde_json::Value::Object(params)))
    }
}
