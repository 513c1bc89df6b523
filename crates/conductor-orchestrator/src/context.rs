use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one step, recorded once the step (including retries) settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Values extracted through the step's `outputs` mapping.
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    pub retry_count: u32,
}

impl StepResult {
    /// A successful result that started at `start_time` and ends now.
    pub fn succeeded(step_id: impl Into<String>, result: Value, start_time: DateTime<Utc>) -> Self {
        Self::settle(step_id, Ok(result), start_time)
    }

    /// A failed result that started at `start_time` and ends now.
    pub fn failed(
        step_id: impl Into<String>,
        error: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self::settle(step_id, Err(error.into()), start_time)
    }

    fn settle(
        step_id: impl Into<String>,
        outcome: Result<Value, String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        let duration = (end_time - start_time).num_milliseconds().max(0) as u64;
        let (success, result, error) = match outcome {
            Ok(value) => (true, value, None),
            Err(e) => (false, Value::Null, Some(e)),
        };
        Self {
            step_id: step_id.into(),
            success,
            result,
            error,
            outputs: serde_json::Map::new(),
            start_time,
            end_time,
            duration,
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_outputs(mut self, outputs: serde_json::Map<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// One failed attempt that was followed by a retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub step: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retry_attempt: u32,
}

impl ErrorRecord {
    pub fn new(step: impl Into<String>, error: impl Into<String>, retry_attempt: u32) -> Self {
        Self {
            step: step.into(),
            error: error.into(),
            timestamp: Utc::now(),
            retry_attempt,
        }
    }
}

/// Bookkeeping for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub start_time: DateTime<Utc>,
    pub current_step_index: usize,
    pub total_steps: usize,
    /// Total retries performed in this run. Never decreases.
    pub retry_count: u32,
    pub error_history: Vec<ErrorRecord>,
}

/// Shared mutable state for one pipeline or chain run.
///
/// Owned by exactly one run. Steps read it through `&ExecutionContext`; only the
/// owning run loop mutates it, after a step (or a parallel group) has settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub pipeline_id: String,
    pub execution_id: String,
    /// The original run input, addressable through `input.<path>` references.
    pub input: Value,
    pub variables: HashMap<String, Value>,
    /// Settled step results in completion order. Ids are unique.
    pub step_results: Vec<StepResult>,
    pub metadata: ExecutionMetadata,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Create a context for a new run. Top-level keys of an object `input`
    /// seed the variables.
    pub fn new(pipeline_id: impl Into<String>, input: Value) -> Self {
        let variables = match &input {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        };
        Self {
            pipeline_id: pipeline_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            input,
            variables,
            step_results: Vec::new(),
            metadata: ExecutionMetadata {
                start_time: Utc::now(),
                current_step_index: 0,
                total_steps: 0,
                retry_count: 0,
                error_history: Vec::new(),
            },
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` as this run's cancellation signal.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set a variable, overwriting any previous value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Record a settled step. An existing entry for the same id is replaced in
    /// place, so ids stay unique.
    pub fn record_step(&mut self, result: StepResult) {
        match self
            .step_results
            .iter_mut()
            .find(|r| r.step_id == result.step_id)
        {
            Some(existing) => *existing = result,
            None => self.step_results.push(result),
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// True when `step_id` has a recorded, successful result.
    pub fn step_succeeded(&self, step_id: &str) -> bool {
        self.step_result(step_id).is_some_and(|r| r.success)
    }

    /// Append a retried failure to the error history and bump the retry count.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.metadata.retry_count += 1;
        self.metadata.error_history.push(record);
    }

    pub fn successful_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.success).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.step_results.len() - self.successful_steps()
    }

    /// Fraction of executed steps that succeeded (0.0 when nothing ran).
    pub fn success_rate(&self) -> f64 {
        if self.step_results.is_empty() {
            0.0
        } else {
            self.successful_steps() as f64 / self.step_results.len() as f64
        }
    }

    /// The variables as a JSON object, e.g. to seed a fallback run.
    pub fn variables_as_value(&self) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_context_seeds_variables() {
        let ctx = ExecutionContext::new("p1", json!({"user": "ana", "count": 2}));
        assert_eq!(ctx.variable("user"), Some(&json!("ana")));
        assert_eq!(ctx.variable("count"), Some(&json!(2)));
        assert!(ctx.step_results.is_empty());
        assert!(!ctx.execution_id.is_empty());
    }

    #[test]
    fn test_non_object_input_leaves_variables_empty() {
        let ctx = ExecutionContext::new("p1", json!("plain"));
        assert!(ctx.variables.is_empty());
        assert_eq!(ctx.input, json!("plain"));
    }

    #[test]
    fn test_set_variable_last_write_wins() {
        let mut ctx = ExecutionContext::new("p1", Value::Null);
        ctx.set_variable("x", json!(1));
        ctx.set_variable("x", json!(2));
        assert_eq!(ctx.variable("x"), Some(&json!(2)));
    }

    #[test]
    fn test_record_step_replaces_existing_entry() {
        let mut ctx = ExecutionContext::new("p1", Value::Null);
        let start = Utc::now();
        ctx.record_step(StepResult::failed("a", "boom", start));
        ctx.record_step(StepResult::succeeded("b", json!(1), start));
        ctx.record_step(StepResult::succeeded("a", json!(2), start));

        assert_eq!(ctx.step_results.len(), 2);
        assert_eq!(ctx.step_results[0].step_id, "a");
        assert!(ctx.step_succeeded("a"));
        assert_eq!(ctx.step_result("a").unwrap().result, json!(2));
    }

    #[test]
    fn test_step_succeeded_requires_success() {
        let mut ctx = ExecutionContext::new("p1", Value::Null);
        ctx.record_step(StepResult::failed("a", "boom", Utc::now()));
        assert!(!ctx.step_succeeded("a"));
        assert!(!ctx.step_succeeded("missing"));
    }

    #[test]
    fn test_record_error_increments_retry_count() {
        let mut ctx = ExecutionContext::new("p1", Value::Null);
        ctx.record_error(ErrorRecord::new("a", "timeout", 1));
        ctx.record_error(ErrorRecord::new("a", "timeout", 2));
        assert_eq!(ctx.metadata.retry_count, 2);
        assert_eq!(ctx.metadata.error_history.len(), 2);
        assert_eq!(ctx.metadata.error_history[1].retry_attempt, 2);
    }

    #[test]
    fn test_success_rate() {
        let mut ctx = ExecutionContext::new("p1", Value::Null);
        assert_eq!(ctx.success_rate(), 0.0);
        let start = Utc::now();
        ctx.record_step(StepResult::succeeded("a", Value::Null, start));
        ctx.record_step(StepResult::failed("b", "x", start));
        assert!((ctx.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ctx.failed_steps(), 1);
    }

    #[test]
    fn test_context_serialization_skips_token() {
        let ctx = ExecutionContext::new("p1", json!({"a": 1}));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["pipelineId"], "p1");
        assert!(json.get("cancel").is_none());
        let parsed: ExecutionContext = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.execution_id, ctx.execution_id);
        assert!(!parsed.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new("p1", Value::Null).with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
