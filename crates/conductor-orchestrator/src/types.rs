use crate::context::ExecutionContext;
use crate::plan::PlanNode;
use crate::retry::RetryPolicy;
use conductor_core::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// --- Pipelines ---

/// A declarative multi-step pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Output key -> reference expression, resolved once the run settles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps,
            output: None,
            error_handling: None,
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, reference: impl Into<Value>) -> Self {
        self.output
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), reference.into());
        self
    }

    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.error_handling = Some(handling);
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The configured strategy, `Continue` when none is set.
    pub fn strategy(&self) -> ErrorStrategy {
        self.error_handling
            .as_ref()
            .map(|h| h.strategy)
            .unwrap_or_default()
    }
}

/// What a pipeline does when a step without `continueOnError` fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Pipeline run in place of the primary one under [`ErrorStrategy::Fallback`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<PipelineDefinition>>,
}

impl ErrorHandling {
    pub fn stop() -> Self {
        Self {
            strategy: ErrorStrategy::Stop,
            fallback: None,
        }
    }

    pub fn fallback(pipeline: PipelineDefinition) -> Self {
        Self {
            strategy: ErrorStrategy::Fallback,
            fallback: Some(Box::new(pipeline)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Abort the run.
    Stop,
    /// Same as `Continue` at the pipeline level; per-step retries come from `retryPolicy`.
    Retry,
    /// Abort the run and execute the fallback pipeline.
    Fallback,
    /// Keep going with the next step. Unrecognized strategy names land here.
    #[default]
    #[serde(other)]
    Continue,
}

/// One step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Parameter name -> reference expression (strings) or literal (anything else).
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Variable name -> path into the step result (`.` or `.field.nested`).
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Type tag and type-specific payload of a pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered tool with the resolved inputs.
    Tool { tool: String },
    /// Run an inline chain; resolved inputs become the chain input.
    Chain { chain: Box<ChainDefinition> },
    /// Evaluate a boolean expression and record the branch decision.
    Condition {
        condition: String,
        #[serde(
            rename = "onTrue",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        on_true: Option<String>,
        #[serde(
            rename = "onFalse",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        on_false: Option<String>,
    },
    /// Apply a named pure function to one resolved input.
    Transform {
        transform: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },
    /// Run the named sibling steps concurrently.
    Parallel {
        steps: Vec<String>,
        #[serde(rename = "waitForAll", default = "default_wait_for_all")]
        wait_for_all: bool,
    },
    /// Sleep for `duration` milliseconds.
    Wait { duration: u64 },
}

fn default_wait_for_all() -> bool {
    true
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Tool { .. } => "tool",
            StepKind::Chain { .. } => "chain",
            StepKind::Condition { .. } => "condition",
            StepKind::Transform { .. } => "transform",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Wait { .. } => "wait",
        }
    }
}

impl StepDefinition {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: serde_json::Map::new(),
            outputs: BTreeMap::new(),
            dependencies: Vec::new(),
            retry_policy: None,
            continue_on_error: false,
        }
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::with_kind(id, StepKind::Tool { tool: tool.into() })
    }

    pub fn chain(id: impl Into<String>, chain: ChainDefinition) -> Self {
        Self::with_kind(
            id,
            StepKind::Chain {
                chain: Box::new(chain),
            },
        )
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Condition {
                condition: expression.into(),
                on_true: None,
                on_false: None,
            },
        )
    }

    pub fn transform(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Transform {
                transform: function.into(),
                input: None,
            },
        )
    }

    pub fn parallel(id: impl Into<String>, steps: Vec<String>, wait_for_all: bool) -> Self {
        Self::with_kind(
            id,
            StepKind::Parallel {
                steps,
                wait_for_all,
            },
        )
    }

    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::with_kind(
            id,
            StepKind::Wait {
                duration: duration_ms,
            },
        )
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(variable.into(), path.into());
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Set the branch targets of a condition step. No effect on other types.
    pub fn with_branches(mut self, on_true: Option<String>, on_false: Option<String>) -> Self {
        if let StepKind::Condition {
            on_true: t,
            on_false: f,
            ..
        } = &mut self.kind
        {
            *t = on_true;
            *f = on_false;
        }
        self
    }

    /// Name the resolved input a transform step operates on.
    pub fn with_transform_input(mut self, name: impl Into<String>) -> Self {
        if let StepKind::Transform { input, .. } = &mut self.kind {
            *input = Some(name.into());
        }
        self
    }
}

impl PlanNode for StepDefinition {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn node_dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

// --- Chains ---

/// A chain of tool invocations ordered by semantic number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<ChainStep>,
    /// Output key -> chain reference. When absent the output maps every step
    /// id to its raw result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub continue_on_step_failure: bool,
}

impl ChainDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<ChainStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps,
            output_mapping: None,
            continue_on_step_failure: false,
        }
    }

    pub fn with_output_mapping(
        mut self,
        key: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.output_mapping
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), reference.into());
        self
    }

    pub fn continue_on_step_failure(mut self) -> Self {
        self.continue_on_step_failure = true;
        self
    }
}

/// One tool invocation inside a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub id: String,
    pub tool: String,
    /// Dotted numeric string such as `"1"`, `"2.1"` or `"2.10"`.
    pub semantic_number: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub static_params: Params,
    /// Parameter name -> chain reference.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Declarative run condition over chain references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Programmatic run condition. Not serialized.
    #[serde(skip)]
    pub predicate: Option<StepPredicate>,
}

impl ChainStep {
    pub fn new(
        id: impl Into<String>,
        tool: impl Into<String>,
        semantic_number: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            semantic_number: semantic_number.into(),
            depends_on: Vec::new(),
            static_params: Params::new(),
            input_mapping: BTreeMap::new(),
            condition: None,
            predicate: None,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_static_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.static_params.insert(name.into(), value.into());
        self
    }

    pub fn with_input_mapping(
        mut self,
        param: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.input_mapping.insert(param.into(), reference.into());
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(StepPredicate(Arc::new(predicate)));
        self
    }
}

impl PlanNode for ChainStep {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn node_dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// A caller-supplied run condition for a chain step.
#[derive(Clone)]
pub struct StepPredicate(Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>);

impl StepPredicate {
    pub fn check(&self, context: &ExecutionContext) -> bool {
        (self.0)(context)
    }
}

impl fmt::Debug for StepPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepPredicate(..)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_definition_from_json() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "fetch",
            "type": "tool",
            "tool": "http_get",
            "inputs": {"url": "$target", "timeout": 30},
            "outputs": {"body": ".content"},
            "dependencies": ["auth"],
            "retryPolicy": {"maxRetries": 2, "backoffMs": 100},
            "continueOnError": true
        }))
        .unwrap();

        assert!(matches!(&step.kind, StepKind::Tool { tool } if tool == "http_get"));
        assert_eq!(step.inputs["timeout"], json!(30));
        assert_eq!(step.outputs["body"], ".content");
        assert_eq!(step.retry_policy.unwrap().max_retries, 2);
        assert!(step.continue_on_error);
    }

    #[test]
    fn test_parallel_defaults_to_wait_for_all() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "fan",
            "type": "parallel",
            "steps": ["a", "b"]
        }))
        .unwrap();
        assert!(matches!(
            step.kind,
            StepKind::Parallel { wait_for_all: true, .. }
        ));
    }

    #[test]
    fn test_condition_branch_fields_are_camel_case() {
        let step = StepDefinition::condition("check", "score > 5")
            .with_branches(Some("high".into()), None);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "condition");
        assert_eq!(json["onTrue"], "high");
        assert!(json.get("onFalse").is_none());
    }

    #[test]
    fn test_unknown_strategy_is_continue() {
        let handling: ErrorHandling =
            serde_json::from_value(json!({"strategy": "skip-it"})).unwrap();
        assert_eq!(handling.strategy, ErrorStrategy::Continue);
        let handling: ErrorHandling = serde_json::from_value(json!({"strategy": "stop"})).unwrap();
        assert_eq!(handling.strategy, ErrorStrategy::Stop);
        let strategy: ErrorStrategy = serde_json::from_value(json!("fallback")).unwrap();
        assert_eq!(strategy, ErrorStrategy::Fallback);
    }

    #[test]
    fn test_strategy_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ErrorStrategy::Continue).unwrap(), json!("continue"));
        assert_eq!(serde_json::to_value(ErrorStrategy::Retry).unwrap(), json!("retry"));
        let json = serde_json::to_value(ErrorHandling::stop()).unwrap();
        assert_eq!(json["strategy"], "stop");
    }

    #[test]
    fn test_pipeline_strategy_defaults_to_continue() {
        let def = PipelineDefinition::new("p", vec![]);
        assert_eq!(def.strategy(), ErrorStrategy::Continue);
        let def = def.with_error_handling(ErrorHandling::stop());
        assert_eq!(def.strategy(), ErrorStrategy::Stop);
    }

    #[test]
    fn test_chain_definition_from_json() {
        let chain: ChainDefinition = serde_json::from_value(json!({
            "id": "c",
            "steps": [
                {"id": "read", "tool": "file_read", "semantic_number": "1",
                 "static_params": {"path": "/tmp/x"}},
                {"id": "write", "tool": "file_write", "semantic_number": "2",
                 "depends_on": ["read"], "input_mapping": {"content": "read.result"}}
            ],
            "output_mapping": {"final": "."}
        }))
        .unwrap();
        assert_eq!(chain.steps.len(), 2);
        assert_eq!(chain.steps[1].depends_on, vec!["read"]);
        assert!(!chain.continue_on_step_failure);
        assert!(chain.steps[0].predicate.is_none());
    }

    #[test]
    fn test_pipeline_from_toml() {
        let def: PipelineDefinition = toml::from_str(
            r#"
            id = "nightly"
            name = "Nightly"

            [[steps]]
            id = "pause"
            type = "wait"
            duration = 10

            [[steps]]
            id = "shout"
            type = "transform"
            transform = "uppercase"
            inputs = { value = "$name" }
            "#,
        )
        .unwrap();
        assert_eq!(def.steps.len(), 2);
        assert!(matches!(def.steps[0].kind, StepKind::Wait { duration: 10 }));
        assert_eq!(def.steps[1].kind.type_name(), "transform");
    }

    #[test]
    fn test_predicate_checks_context() {
        let step = ChainStep::new("a", "echo", "1")
            .with_predicate(|ctx: &ExecutionContext| ctx.variable("go").is_some());
        let ctx = ExecutionContext::new("c", json!({"go": true}));
        assert!(step.predicate.as_ref().unwrap().check(&ctx));
        assert_eq!(format!("{:?}", step.predicate.unwrap()), "StepPredicate(..)");
    }
}
