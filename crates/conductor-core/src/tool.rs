use crate::ConductorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Named parameters passed to a tool invocation.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// The result returned by the tool registry for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool reported success.
    pub success: bool,
    /// The tool's output, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tool-specific metrics (timings, byte counts, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metrics: None,
        }
    }

    /// Creates a failed tool result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            metrics: None,
        }
    }

    /// Attaches metrics to the result.
    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The error text, or a generic message for failures without one.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "tool reported failure without an error message".to_string())
    }
}

/// Anything that can execute a tool by name — normally the tool registry.
///
/// An `Err` means the call itself could not be made (unknown tool, transport
/// failure); a tool that ran and failed returns `Ok` with `success == false`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Invoke the tool `name` with the given parameters.
    async fn execute_tool(&self, name: &str, params: Params) -> ConductorResult<ToolResult>;
}
