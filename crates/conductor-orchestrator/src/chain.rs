use crate::context::{ExecutionContext, StepResult};
use crate::expression::evaluate_condition;
use crate::plan::validate_chain;
use crate::reference::{resolve_chain_mapping, resolve_chain_reference};
use crate::types::{ChainDefinition, ChainStep};
use chrono::Utc;
use conductor_core::{
    ConductorError, FailureKind, MetricsSink, NoopMetrics, Params, ToolExecutor,
};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs chains: semantic-number ordered tool calls with concurrent groups.
#[derive(Clone)]
pub struct ChainExecutor {
    tools: Arc<dyn ToolExecutor>,
    metrics: Arc<dyn MetricsSink>,
    max_concurrency: usize,
}

/// Outcome of a chain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainExecutionResult {
    pub chain_id: String,
    pub execution_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub output: Value,
    pub context: ExecutionContext,
    pub metrics: ChainMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMetrics {
    /// Milliseconds.
    pub total_duration: u64,
    pub step_count: usize,
    pub parallel_groups: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    /// Step id -> milliseconds.
    pub step_timings: BTreeMap<String, u64>,
}

/// `\d+(\.\d+)*`
pub fn is_valid_semantic_number(value: &str) -> bool {
    !value.is_empty()
        && value
            .split('.')
            .all(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

/// Segments with leading zeros stripped, so "0" and "00" both become "".
fn segments(value: &str) -> Vec<&str> {
    value
        .split('.')
        .map(|segment| segment.trim_start_matches('0'))
        .collect()
}

/// Compare two digit strings of any length by numeric value.
fn compare_segment(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Segment-wise numeric comparison; a missing segment counts as 0.
pub fn compare_semantic_numbers(a: &str, b: &str) -> Ordering {
    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or("");
            let y = b.get(i).copied().unwrap_or("");
            compare_segment(x, y)
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Sort steps by semantic number (stable) and split them into groups of
/// consecutive steps sharing the leading segment.
pub fn execution_groups(steps: &[ChainStep]) -> Vec<Vec<&ChainStep>> {
    let mut sorted: Vec<&ChainStep> = steps.iter().collect();
    sorted.sort_by(|a, b| compare_semantic_numbers(&a.semantic_number, &b.semantic_number));

    let mut groups: Vec<Vec<&ChainStep>> = Vec::new();
    let mut current_lead = None;
    for step in sorted {
        let lead = segments(&step.semantic_number).first().copied();
        match groups.last_mut() {
            Some(group) if current_lead == lead => group.push(step),
            _ => {
                groups.push(vec![step]);
                current_lead = lead;
            }
        }
    }
    groups
}

impl ChainExecutor {
    pub fn new(tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            tools,
            metrics: Arc::new(NoopMetrics),
            max_concurrency: 8,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Upper bound on concurrently running steps within one group.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Execute `chain` with `input` as the chain input.
    pub async fn execute_chain(&self, chain: &ChainDefinition, input: Value) -> ChainExecutionResult {
        self.execute_chain_with_cancellation(chain, input, CancellationToken::new())
            .await
    }

    /// Execute `chain`, stopping between groups (and aborting in-flight tool
    /// calls) once `cancel` fires.
    pub async fn execute_chain_with_cancellation(
        &self,
        chain: &ChainDefinition,
        input: Value,
        cancel: CancellationToken,
    ) -> ChainExecutionResult {
        let start = Instant::now();
        let mut ctx = ExecutionContext::new(&chain.id, input).with_cancellation(cancel);
        ctx.metadata.total_steps = chain.steps.len();

        info!(chain = %chain.id, execution_id = %ctx.execution_id, steps = chain.steps.len(), "Chain: starting");
        self.metrics
            .start(
                &ctx.execution_id,
                json!({"kind": "chain", "chainId": chain.id, "steps": chain.steps.len()}),
            )
            .await;

        if let Err(e) = validate_chain(chain) {
            warn!(chain = %chain.id, error = %e, "Chain: plan rejected");
            return self.finish(chain, ctx, start, 0, Some(e)).await;
        }

        let groups = execution_groups(&chain.steps);
        let group_count = groups.len();
        let mut fatal = None;

        for (index, group) in groups.into_iter().enumerate() {
            if ctx.is_cancelled() {
                fatal = Some(ConductorError::Cancelled(format!(
                    "chain '{}' cancelled before group {}",
                    chain.id,
                    index + 1
                )));
                break;
            }

            debug!(chain = %chain.id, group = index + 1, size = group.len(), "Chain: running group");
            let outcomes: Vec<(StepResult, Option<ConductorError>)> = {
                let ctx = &ctx;
                let pending: Vec<BoxFuture<'_, _>> = group
                    .iter()
                    .map(|step| self.run_step(step, ctx).boxed())
                    .collect();
                stream::iter(pending)
                    .buffered(self.max_concurrency)
                    .collect()
                    .await
            };

            let mut group_error = None;
            for (result, error) in outcomes {
                ctx.metadata.current_step_index += 1;
                ctx.record_step(result);
                if group_error.is_none() {
                    group_error = error;
                }
            }

            if let Some(error) = group_error {
                if !chain.continue_on_step_failure {
                    fatal = Some(error);
                    break;
                }
                warn!(chain = %chain.id, error = %error, "Chain: step failed, continuing");
            }
        }

        self.finish(chain, ctx, start, group_count, fatal).await
    }

    async fn run_step(
        &self,
        step: &ChainStep,
        ctx: &ExecutionContext,
    ) -> (StepResult, Option<ConductorError>) {
        let started = Utc::now();
        match self.invoke(step, ctx).await {
            Ok(value) => (StepResult::succeeded(&step.id, value, started), None),
            Err(e) => {
                warn!(step = %step.id, tool = %step.tool, error = %e, "Chain: step failed");
                (StepResult::failed(&step.id, e.to_string(), started), Some(e))
            }
        }
    }

    async fn invoke(&self, step: &ChainStep, ctx: &ExecutionContext) -> Result<Value, ConductorError> {
        if let Some(dep) = step.depends_on.iter().find(|d| !ctx.step_succeeded(d)) {
            return Err(ConductorError::DependencyNotMet {
                step: step.id.clone(),
                dependency: dep.clone(),
            });
        }

        if !self.should_run(step, ctx)? {
            debug!(step = %step.id, "Chain: condition not met, skipping");
            return Ok(json!({"skipped": true, "reason": "condition not met"}));
        }

        let mut params: Params = step.static_params.clone();
        params.extend(resolve_chain_mapping(&step.input_mapping, ctx));

        let call = self.tools.execute_tool(&step.tool, params);
        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = ctx.cancellation_token().cancelled() => {
                return Err(ConductorError::Cancelled(format!("step '{}' cancelled", step.id)));
            }
        };

        match outcome {
            Ok(result) if result.success => Ok(result.result.unwrap_or(Value::Null)),
            Ok(result) => Err(ConductorError::StepExecution {
                step: step.id.clone(),
                message: result.error_message(),
            }),
            Err(e) => Err(ConductorError::StepExecution {
                step: step.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn should_run(&self, step: &ChainStep, ctx: &ExecutionContext) -> Result<bool, ConductorError> {
        if let Some(predicate) = &step.predicate {
            if !predicate.check(ctx) {
                return Ok(false);
            }
        }
        match &step.condition {
            Some(expression) => {
                let lookup = |name: &str| {
                    resolve_chain_reference(name, ctx).or_else(|| ctx.variable(name).cloned())
                };
                evaluate_condition(expression, &lookup).map_err(|e| ConductorError::StepExecution {
                    step: step.id.clone(),
                    message: e.to_string(),
                })
            }
            None => Ok(true),
        }
    }

    async fn finish(
        &self,
        chain: &ChainDefinition,
        ctx: ExecutionContext,
        start: Instant,
        parallel_groups: usize,
        fatal: Option<ConductorError>,
    ) -> ChainExecutionResult {
        let success = fatal.is_none();
        let output = if !success {
            Value::Null
        } else if let Some(mapping) = &chain.output_mapping {
            Value::Object(resolve_chain_mapping(mapping, &ctx))
        } else {
            Value::Object(
                ctx.step_results
                    .iter()
                    .map(|r| (r.step_id.clone(), r.result.clone()))
                    .collect::<Map<String, Value>>(),
            )
        };

        let metrics = ChainMetrics {
            total_duration: start.elapsed().as_millis() as u64,
            step_count: chain.steps.len(),
            parallel_groups,
            completed_steps: ctx.successful_steps(),
            failed_steps: ctx.failed_steps(),
            step_timings: ctx
                .step_results
                .iter()
                .map(|r| (r.step_id.clone(), r.duration))
                .collect(),
        };

        match &fatal {
            None => info!(
                chain = %chain.id,
                duration_ms = metrics.total_duration,
                completed = metrics.completed_steps,
                "Chain: complete"
            ),
            Some(e) => warn!(chain = %chain.id, error = %e, "Chain: failed"),
        }
        self.metrics
            .end(
                &ctx.execution_id,
                json!({"success": success, "duration": metrics.total_duration}),
            )
            .await;

        ChainExecutionResult {
            chain_id: chain.id.clone(),
            execution_id: ctx.execution_id.clone(),
            success,
            error: fatal.as_ref().map(ToString::to_string),
            failure: fatal.as_ref().map(ConductorError::kind),
            output,
            context: ctx,
            metrics,
        }
    }
}
