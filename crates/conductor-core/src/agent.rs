use crate::ConductorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a single agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Whether the agent completed the task.
    pub success: bool,
    /// The agent's response (free text or structured).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    /// A successful result carrying `result`.
    pub fn success(result: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    /// A failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// An agent response rendered as text: strings verbatim, null as empty,
/// anything else as JSON.
pub fn response_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// An agent that can take a task description and produce a result.
///
/// LLM-backed agents, scripted agents and test doubles all implement this.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable name used for delegation and reporting.
    fn name(&self) -> &str;

    /// Run the agent on `task`. `options` carries the structured task payload.
    async fn run(
        &self,
        task: &str,
        options: Option<&serde_json::Value>,
    ) -> ConductorResult<AgentResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_response_text_of_string() {
        assert_eq!(response_text(&json!("done")), "done");
    }

    #[test]
    fn test_response_text_of_structured_value() {
        assert_eq!(response_text(&json!({"score": 1})), r#"{"score":1}"#);
        assert_eq!(response_text(&json!([1, "a"])), r#"[1,"a"]"#);
        assert_eq!(response_text(&serde_json::Value::Null), "");
    }
}
