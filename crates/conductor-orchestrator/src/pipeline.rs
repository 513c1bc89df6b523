use crate::chain::ChainExecutor;
use crate::config::OrchestratorConfig;
use crate::context::{ErrorRecord, ExecutionContext, StepResult};
use crate::expression::evaluate_condition;
use crate::plan::validate_pipeline;
use crate::reference::{extract_output, lookup_path, resolve_inputs, resolve_pipeline_reference};
use crate::retry::{run_with_retry, AttemptOutcome, RetryPolicy};
use crate::transform::apply_transform;
use crate::types::{ErrorStrategy, PipelineDefinition, StepDefinition, StepKind};
use chrono::Utc;
use conductor_core::{ConductorError, FailureKind, MetricsSink, NoopMetrics, ToolExecutor};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs pipeline definitions step by step.
///
/// Cheap to clone; clones share the tool registry and metrics sink.
#[derive(Clone)]
pub struct PipelineExecutor {
    tools: Arc<dyn ToolExecutor>,
    chains: ChainExecutor,
    metrics: Arc<dyn MetricsSink>,
    default_retry: RetryPolicy,
    max_concurrency: usize,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub result: PipelineRunOutput,
    pub metrics: PipelineMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunOutput {
    pub pipeline_id: String,
    pub execution_id: String,
    pub steps: Vec<StepResult>,
    pub output: Value,
    pub context: ExecutionContext,
    /// Result of the fallback pipeline, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<PipelineResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    /// Milliseconds.
    pub duration: u64,
    pub step_results: StepMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    pub steps_executed: usize,
    pub success_rate: f64,
    pub retry_count: u32,
}

/// A settled step together with everything it produced along the way.
struct StepRun {
    result: StepResult,
    errors: Vec<ErrorRecord>,
    children: Vec<StepRun>,
    detached: Vec<Detached>,
}

/// What one attempt of a step produced.
struct Dispatch {
    value: Result<Value, String>,
    children: Vec<StepRun>,
    detached: Vec<Detached>,
}

impl Dispatch {
    fn value(value: Result<Value, String>) -> Self {
        Self {
            value,
            children: Vec::new(),
            detached: Vec::new(),
        }
    }
}

impl AttemptOutcome for Dispatch {
    fn failure(&self) -> Option<String> {
        self.value.failure()
    }
}

/// Siblings of a `waitForAll: false` parallel step still running in the
/// background. Dropping this aborts them.
struct Detached {
    step_ids: Vec<String>,
    tasks: JoinSet<StepRun>,
}

impl Detached {
    fn owns_any(&self, ids: &[String]) -> bool {
        ids.iter().any(|id| self.step_ids.contains(id))
    }
}

impl PipelineExecutor {
    pub fn new(tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            chains: ChainExecutor::new(tools.clone()),
            tools,
            metrics: Arc::new(NoopMetrics),
            default_retry: RetryPolicy::default(),
            max_concurrency: 8,
        }
    }

    /// Apply the retry and concurrency settings from `config`.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.default_retry = config.default_retry.clone();
        self.max_concurrency = config.max_concurrency.max(1);
        self.chains = self.chains.with_max_concurrency(self.max_concurrency);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.chains = self.chains.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Retry policy for steps that do not declare one.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.chains = self.chains.with_max_concurrency(self.max_concurrency);
        self
    }

    /// Run `definition` with `input`. Never fails: every error is reported
    /// through the returned [`PipelineResult`].
    pub async fn execute(&self, definition: &PipelineDefinition, input: Value) -> PipelineResult {
        self.execute_with_cancellation(definition, input, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping before the next step (and
    /// interrupting waits, backoff and tool calls) once `cancel` fires.
    pub async fn execute_with_cancellation(
        &self,
        definition: &PipelineDefinition,
        input: Value,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let ctx = ExecutionContext::new(&definition.id, input).with_cancellation(cancel);
        self.run_pipeline(Arc::new(definition.clone()), ctx).await
    }

    fn run_pipeline(
        &self,
        definition: Arc<PipelineDefinition>,
        mut ctx: ExecutionContext,
    ) -> BoxFuture<'_, PipelineResult> {
        async move {
            let start = Instant::now();
            ctx.metadata.total_steps = definition.steps.len();

            info!(
                pipeline = %definition.id,
                execution_id = %ctx.execution_id,
                steps = definition.steps.len(),
                "Pipeline: starting"
            );
            self.metrics
                .start(
                    &ctx.execution_id,
                    json!({"kind": "pipeline", "pipelineId": definition.id}),
                )
                .await;

            if let Err(e) = validate_pipeline(&definition) {
                warn!(pipeline = %definition.id, error = %e, "Pipeline: plan rejected");
                return self.finish(&definition, ctx, start, Some(e), None).await;
            }

            let owned: HashSet<&str> = definition
                .steps
                .iter()
                .filter_map(|s| match &s.kind {
                    StepKind::Parallel { steps, .. } => Some(steps),
                    _ => None,
                })
                .flatten()
                .map(String::as_str)
                .collect();

            let mut detached: Vec<Detached> = Vec::new();
            let mut fatal = None;
            let mut fallback = None;

            for (index, step) in definition.steps.iter().enumerate() {
                if owned.contains(step.id.as_str()) {
                    continue;
                }
                ctx.metadata.current_step_index = index;

                if ctx.is_cancelled() {
                    fatal = Some(ConductorError::Cancelled(format!(
                        "pipeline '{}' cancelled before step '{}'",
                        definition.id, step.id
                    )));
                    break;
                }

                settle_detached(&mut ctx, &mut detached, Some(step.dependencies.as_slice())).await;
                if let Some(dep) = step.dependencies.iter().find(|d| !ctx.step_succeeded(d)) {
                    fatal = Some(ConductorError::DependencyNotMet {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                    break;
                }

                debug!(step = %step.id, kind = step.kind.type_name(), "Pipeline: running step");
                let run = self.run_step(&definition, step, &ctx).await;
                absorb(&mut ctx, run, &mut detached);

                let Some(result) = ctx.step_result(&step.id) else {
                    continue;
                };
                if result.success || step.continue_on_error {
                    continue;
                }

                let error = ConductorError::StepExecution {
                    step: step.id.clone(),
                    message: result.error.clone().unwrap_or_default(),
                };
                match definition.strategy() {
                    ErrorStrategy::Stop => {
                        warn!(step = %step.id, "Pipeline: stopping after step failure");
                        fatal = Some(error);
                        break;
                    }
                    ErrorStrategy::Fallback => {
                        let fallback_def = definition
                            .error_handling
                            .as_ref()
                            .and_then(|h| h.fallback.as_deref());
                        if let Some(fallback_def) = fallback_def {
                            warn!(
                                step = %step.id,
                                fallback = %fallback_def.id,
                                "Pipeline: step failed, running fallback pipeline"
                            );
                            let fallback_ctx =
                                ExecutionContext::new(&fallback_def.id, ctx.variables_as_value())
                                    .with_cancellation(ctx.cancellation_token().clone());
                            fallback = Some(
                                self.run_pipeline(Arc::new(fallback_def.clone()), fallback_ctx)
                                    .await,
                            );
                        } else {
                            warn!(step = %step.id, "Pipeline: fallback strategy without a fallback pipeline");
                        }
                        fatal = Some(error);
                        break;
                    }
                    ErrorStrategy::Continue | ErrorStrategy::Retry => {
                        warn!(step = %step.id, error = %error, "Pipeline: step failed, continuing");
                    }
                }
            }

            settle_detached(&mut ctx, &mut detached, None).await;
            self.finish(&definition, ctx, start, fatal, fallback).await
        }
        .boxed()
    }

    /// Run one step (with retries) against a read-only view of the context.
    fn run_step<'a>(
        &'a self,
        definition: &'a Arc<PipelineDefinition>,
        step: &'a StepDefinition,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, StepRun> {
        async move {
            let started = Utc::now();
            let unit = format!("{}:{}", ctx.execution_id, step.id);
            self.metrics
                .start(&unit, json!({"kind": step.kind.type_name(), "stepId": step.id}))
                .await;

            let policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry);
            let outcome = run_with_retry(policy, &step.id, ctx.cancellation_token(), |_| {
                self.dispatch(definition, step, ctx)
            })
            .await;

            let retries = outcome.retries();
            let Dispatch {
                value,
                children,
                detached,
            } = outcome.value;

            let result = match value {
                Ok(value) => {
                    let outputs: Map<String, Value> = step
                        .outputs
                        .iter()
                        .filter_map(|(variable, path)| {
                            let extracted = extract_output(&value, path);
                            if extracted.is_none() {
                                debug!(step = %step.id, path = %path, "Output path not found");
                            }
                            extracted.map(|v| (variable.clone(), v))
                        })
                        .collect();
                    StepResult::succeeded(&step.id, value, started).with_outputs(outputs)
                }
                Err(error) => {
                    warn!(step = %step.id, attempts = outcome.attempts, error = %error, "Step failed");
                    StepResult::failed(&step.id, error, started)
                }
            }
            .with_retry_count(retries);

            self.metrics
                .end(
                    &unit,
                    json!({"success": result.success, "duration": result.duration, "retries": retries}),
                )
                .await;

            StepRun {
                result,
                errors: outcome.errors,
                children,
                detached,
            }
        }
        .boxed()
    }

    /// A single attempt of a step.
    fn dispatch<'a>(
        &'a self,
        definition: &'a Arc<PipelineDefinition>,
        step: &'a StepDefinition,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Dispatch> {
        async move {
            let inputs = resolve_inputs(&step.inputs, ctx);
            match &step.kind {
                StepKind::Tool { tool } => Dispatch::value(self.call_tool(tool, inputs, ctx).await),
                StepKind::Chain { chain } => {
                    let result = self
                        .chains
                        .execute_chain_with_cancellation(
                            chain,
                            Value::Object(inputs),
                            ctx.cancellation_token().child_token(),
                        )
                        .await;
                    Dispatch::value(if result.success {
                        Ok(result.output)
                    } else {
                        Err(result
                            .error
                            .unwrap_or_else(|| format!("chain '{}' failed", chain.id)))
                    })
                }
                StepKind::Condition {
                    condition,
                    on_true,
                    on_false,
                } => {
                    let lookup = |name: &str| condition_lookup(name, &inputs, ctx);
                    Dispatch::value(
                        evaluate_condition(condition, &lookup)
                            .map(|decision| {
                                let next = if decision { on_true } else { on_false };
                                json!({
                                    "condition": condition,
                                    "result": decision,
                                    "nextStep": next,
                                })
                            })
                            .map_err(|e| e.to_string()),
                    )
                }
                StepKind::Transform { transform, input } => {
                    let value = transform_input(input.as_deref(), inputs);
                    Dispatch::value(apply_transform(transform, value))
                }
                StepKind::Parallel {
                    steps,
                    wait_for_all,
                } => {
                    self.run_parallel(definition, steps, *wait_for_all, ctx)
                        .await
                }
                StepKind::Wait { duration } => {
                    let value = tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(*duration)) => {
                            Ok(json!({"waited": duration}))
                        }
                        _ = ctx.cancellation_token().cancelled() => {
                            Err(format!("wait step '{}' cancelled", step.id))
                        }
                    };
                    Dispatch::value(value)
                }
            }
        }
        .boxed()
    }

    async fn call_tool(
        &self,
        tool: &str,
        params: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, String> {
        tokio::select! {
            outcome = self.tools.execute_tool(tool, params) => match outcome {
                Ok(result) if result.success => Ok(result.result.unwrap_or(Value::Null)),
                Ok(result) => Err(result.error_message()),
                Err(e) => Err(e.to_string()),
            },
            _ = ctx.cancellation_token().cancelled() => Err(format!("tool '{tool}' cancelled")),
        }
    }

    async fn run_parallel(
        &self,
        definition: &Arc<PipelineDefinition>,
        sibling_ids: &[String],
        wait_for_all: bool,
        ctx: &ExecutionContext,
    ) -> Dispatch {
        let siblings: Vec<&StepDefinition> = sibling_ids
            .iter()
            .filter_map(|id| definition.step(id))
            .collect();
        if siblings.len() != sibling_ids.len() {
            return Dispatch::value(Err("parallel step names an unknown sibling".to_string()));
        }

        if wait_for_all {
            let pending: Vec<BoxFuture<'_, StepRun>> = siblings
                .iter()
                .map(|sibling| self.run_sibling(definition, sibling, ctx).boxed())
                .collect();
            let runs: Vec<StepRun> = stream::iter(pending)
                .buffered(self.max_concurrency)
                .collect()
                .await;

            let completed = runs.iter().filter(|r| r.result.success).count();
            let failed: Vec<&str> = runs
                .iter()
                .zip(&siblings)
                .filter(|(run, sibling)| !run.result.success && !sibling.continue_on_error)
                .map(|(run, _)| run.result.step_id.as_str())
                .collect();
            let results: Map<String, Value> = runs
                .iter()
                .map(|r| (r.result.step_id.clone(), r.result.result.clone()))
                .collect();

            let value = if failed.is_empty() {
                Ok(json!({"completed": completed, "results": results}))
            } else {
                Err(format!(
                    "{} of {} parallel step(s) failed: {}",
                    failed.len(),
                    runs.len(),
                    failed.join(", ")
                ))
            };
            return Dispatch {
                value,
                children: runs,
                detached: Vec::new(),
            };
        }

        let mut tasks = JoinSet::new();
        for sibling in &siblings {
            let executor = self.clone();
            let definition = Arc::clone(definition);
            let sibling = (*sibling).clone();
            let snapshot = ctx.clone();
            tasks.spawn(async move { executor.run_sibling(&definition, &sibling, &snapshot).await });
        }

        let first = match tasks.join_next().await {
            Some(Ok(run)) => run,
            Some(Err(e)) => {
                return Dispatch::value(Err(format!("parallel sibling task failed: {e}")));
            }
            None => return Dispatch::value(Ok(json!({"completed": 0, "results": {}}))),
        };

        let value = if first.result.success {
            let mut results = Map::new();
            results.insert(first.result.step_id.clone(), first.result.result.clone());
            Ok(json!({
                "completed": 1,
                "first": first.result.step_id,
                "results": results,
            }))
        } else {
            Err(first
                .result
                .error
                .clone()
                .unwrap_or_else(|| format!("parallel sibling '{}' failed", first.result.step_id)))
        };

        let pending: Vec<String> = siblings
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| *id != first.result.step_id)
            .collect();
        let detached = if pending.is_empty() {
            Vec::new()
        } else {
            debug!(pending = ?pending, "Parallel: continuing without waiting for siblings");
            vec![Detached {
                step_ids: pending,
                tasks,
            }]
        };

        Dispatch {
            value,
            children: vec![first],
            detached,
        }
    }

    /// Run a sibling of a parallel step; its own dependencies must already
    /// have succeeded.
    async fn run_sibling(
        &self,
        definition: &Arc<PipelineDefinition>,
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> StepRun {
        if let Some(dep) = step.dependencies.iter().find(|d| !ctx.step_succeeded(d)) {
            let error = ConductorError::DependencyNotMet {
                step: step.id.clone(),
                dependency: dep.clone(),
            };
            return StepRun {
                result: StepResult::failed(&step.id, error.to_string(), Utc::now()),
                errors: Vec::new(),
                children: Vec::new(),
                detached: Vec::new(),
            };
        }
        self.run_step(definition, step, ctx).await
    }

    async fn finish(
        &self,
        definition: &PipelineDefinition,
        ctx: ExecutionContext,
        start: Instant,
        fatal: Option<ConductorError>,
        fallback: Option<PipelineResult>,
    ) -> PipelineResult {
        let mut success = fatal.is_none();
        let mut error = fatal.as_ref().map(ToString::to_string);
        let mut failure = fatal.as_ref().map(ConductorError::kind);

        let mut output = match &definition.output {
            Some(mapping) => Value::Object(
                mapping
                    .iter()
                    .map(|(key, reference)| (key.clone(), resolve_pipeline_reference(reference, &ctx)))
                    .collect(),
            ),
            None => ctx
                .step_results
                .iter()
                .rev()
                .find(|r| r.success)
                .map(|r| r.result.clone())
                .unwrap_or(Value::Null),
        };

        if let Some(fallback) = &fallback {
            if fallback.success {
                success = true;
                error = None;
                failure = None;
                output = fallback.result.output.clone();
            } else {
                error = Some(format!(
                    "{}; fallback pipeline '{}' failed: {}",
                    error.unwrap_or_default(),
                    fallback.result.pipeline_id,
                    fallback.error.clone().unwrap_or_default()
                ));
            }
        }

        let duration = start.elapsed().as_millis() as u64;
        let metrics = PipelineMetrics {
            duration,
            step_results: StepMetrics {
                steps_executed: ctx.step_results.len(),
                success_rate: ctx.success_rate(),
                retry_count: ctx.metadata.retry_count,
            },
        };

        if success {
            info!(
                pipeline = %definition.id,
                duration_ms = duration,
                steps = metrics.step_results.steps_executed,
                "Pipeline: complete"
            );
        } else {
            warn!(pipeline = %definition.id, error = ?error, "Pipeline: failed");
        }
        self.metrics
            .end(
                &ctx.execution_id,
                json!({"success": success, "duration": duration}),
            )
            .await;

        PipelineResult {
            success,
            error,
            failure,
            result: PipelineRunOutput {
                pipeline_id: definition.id.clone(),
                execution_id: ctx.execution_id.clone(),
                steps: ctx.step_results.clone(),
                output,
                context: ctx,
                fallback: fallback.map(Box::new),
            },
            metrics,
        }
    }
}

/// Record a settled step into the context: children first, then the step
/// itself, then output variables. Background siblings are handed to `detached`.
fn absorb(ctx: &mut ExecutionContext, run: StepRun, detached: &mut Vec<Detached>) {
    let StepRun {
        result,
        errors,
        children,
        detached: pending,
    } = run;

    let mut written: HashMap<String, String> = HashMap::new();
    for child in children {
        for key in child.result.outputs.keys() {
            if let Some(other) = written.insert(key.clone(), child.result.step_id.clone()) {
                warn!(
                    variable = %key,
                    first = %other,
                    second = %child.result.step_id,
                    "Parallel siblings wrote the same output variable"
                );
            }
        }
        absorb(ctx, child, detached);
    }

    for record in errors {
        ctx.record_error(record);
    }
    for (name, value) in &result.outputs {
        ctx.set_variable(name.clone(), value.clone());
    }
    ctx.record_step(result);
    detached.extend(pending);
}

/// Wait for background siblings. With `only` set, only groups that contain
/// one of those step ids are awaited.
async fn settle_detached(
    ctx: &mut ExecutionContext,
    detached: &mut Vec<Detached>,
    only: Option<&[String]>,
) {
    loop {
        let position = match only {
            Some(ids) => detached.iter().position(|d| d.owns_any(ids)),
            None => (!detached.is_empty()).then_some(0),
        };
        let Some(position) = position else {
            return;
        };

        let mut group = detached.remove(position);
        let mut settled: HashSet<String> = HashSet::new();
        while let Some(joined) = group.tasks.join_next().await {
            match joined {
                Ok(run) => {
                    settled.insert(run.result.step_id.clone());
                    absorb(ctx, run, detached);
                }
                Err(e) => warn!(error = %e, "Parallel sibling task did not complete"),
            }
        }
        for id in group.step_ids.iter().filter(|id| !settled.contains(*id)) {
            ctx.record_step(StepResult::failed(
                id,
                "parallel sibling task did not complete",
                Utc::now(),
            ));
        }
    }
}

/// Condition identifiers: resolved inputs, then variables, then the
/// `$var` / `@step` / `input.` reference forms.
fn condition_lookup(name: &str, inputs: &Map<String, Value>, ctx: &ExecutionContext) -> Option<Value> {
    let (head, path) = name.split_once('.').unwrap_or((name, ""));
    if let Some(value) = inputs.get(head).or_else(|| ctx.variable(head)) {
        return lookup_path(value, path).cloned();
    }
    if name == "input" {
        return Some(ctx.input.clone());
    }
    if name.starts_with(['$', '@']) || name.starts_with("input.") {
        return Some(resolve_pipeline_reference(&Value::String(name.to_string()), ctx));
    }
    None
}

/// Pick the value a transform operates on: the named input, else `value`,
/// else the only input.
fn transform_input(name: Option<&str>, mut inputs: Map<String, Value>) -> Value {
    if let Some(name) = name {
        return inputs.remove(name).unwrap_or(Value::Null);
    }
    if let Some(value) = inputs.remove("value") {
        return value;
    }
    if inputs.len() == 1 {
        return inputs
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .unwrap_or(Value::Null);
    }
    Value::Null
}
