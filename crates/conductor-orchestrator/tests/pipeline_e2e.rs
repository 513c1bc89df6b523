//! End-to-end pipeline tests against mock and built-in tool registries.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_builtins::register_builtins;
use conductor_core::{ConductorError, ConductorResult, FailureKind, Params, ToolExecutor, ToolResult};
use conductor_orchestrator::*;
use conductor_tools::ToolRegistry;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock tools
// ---------------------------------------------------------------------------

/// - `echo`: returns its params
/// - `fail`: always fails
/// - `flaky`: fails until the third call
/// - `sleep`: sleeps `ms` milliseconds, then echoes its params
#[derive(Default)]
struct MockTools {
    flaky_calls: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl ToolExecutor for MockTools {
    async fn execute_tool(&self, name: &str, params: Params) -> ConductorResult<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match name {
            "echo" => Ok(ToolResult::success(Value::Object(params))),
            "fail" => Ok(ToolResult::failure("service unavailable")),
            "flaky" => {
                let n = self.flaky_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Ok(ToolResult::failure(format!("transient error #{n}")))
                } else {
                    Ok(ToolResult::success(json!({"attempt": n})))
                }
            }
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolResult::success(Value::Object(params)))
            }
            other => Err(ConductorError::Tool(format!("Unknown tool: {other}"))),
        }
    }
}

fn executor() -> (PipelineExecutor, Arc<MockTools>) {
    let tools = Arc::new(MockTools::default());
    (PipelineExecutor::new(tools.clone()), tools)
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_dependency_rejected_before_any_step() {
    let (exec, tools) = executor();
    let def = PipelineDefinition::new(
        "plan",
        vec![
            StepDefinition::tool("first", "echo"),
            StepDefinition::tool("second", "echo").with_dependencies(vec!["ghost".into()]),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Planning));
    assert!(result.error.as_ref().unwrap().contains("ghost"));
    assert!(result.result.context.step_results.is_empty());
    assert_eq!(tools.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dependency_cycle_rejected() {
    let (exec, tools) = executor();
    let def = PipelineDefinition::new(
        "cycle",
        vec![
            StepDefinition::tool("a", "echo").with_dependencies(vec!["c".into()]),
            StepDefinition::tool("b", "echo").with_dependencies(vec!["a".into()]),
            StepDefinition::tool("c", "echo").with_dependencies(vec!["b".into()]),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Planning));
    assert!(result.error.unwrap().contains("cycle"));
    assert!(result.result.steps.is_empty());
    assert_eq!(tools.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_pipeline_definition_from_json() {
    let def: PipelineDefinition = serde_json::from_value(json!({
        "id": "ingest",
        "name": "Ingest",
        "steps": [
            {"id": "fetch", "type": "tool", "tool": "echo", "inputs": {"url": "$url"},
             "outputs": {"body": ".url"}, "retryPolicy": {"maxRetries": 2, "backoffMs": 10}},
            {"id": "wait", "type": "wait", "duration": 5, "dependencies": ["fetch"]}
        ],
        "errorHandling": {"strategy": "stop"}
    }))
    .unwrap();

    assert_eq!(def.steps.len(), 2);
    assert_eq!(def.strategy(), ErrorStrategy::Stop);
    assert_eq!(def.steps[0].retry_policy.as_ref().unwrap().max_retries, 2);
    assert!(validate_pipeline(&def).is_ok());
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_flaky_step_succeeds_on_third_attempt() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "retry",
        vec![StepDefinition::tool("call", "flaky").with_retry_policy(RetryPolicy::new(3, 1))],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(result.success, "{:?}", result.error);
    let step = &result.result.steps[0];
    assert!(step.success);
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.result["attempt"], json!(3));

    let history = &result.result.context.metadata.error_history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].retry_attempt, 1);
    assert_eq!(history[1].error, "transient error #2");
    assert_eq!(result.metrics.step_results.retry_count, 2);
}

#[tokio::test]
async fn test_retry_on_filter_skips_non_matching_errors() {
    let (exec, tools) = executor();
    let def = PipelineDefinition::new(
        "retry",
        vec![StepDefinition::tool("call", "fail")
            .with_retry_policy(RetryPolicy::new(5, 0).with_retry_on(vec!["timeout".into()]))],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert_eq!(tools.calls.load(Ordering::SeqCst), 1);
    assert!(result.result.context.metadata.error_history.is_empty());
}

// ---------------------------------------------------------------------------
// Error strategies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_continue_strategy_is_default() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "cont",
        vec![
            StepDefinition::tool("bad", "fail"),
            StepDefinition::tool("good", "echo").with_input("v", 1),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(result.success);
    assert_eq!(result.result.steps.len(), 2);
    assert_eq!(result.result.output, json!({"v": 1}));
    assert!((result.metrics.step_results.success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_fallback_pipeline_recovers() {
    let (exec, _) = executor();
    let fallback = PipelineDefinition::new(
        "backup",
        vec![StepDefinition::tool("cached", "echo").with_input("region", "$region")],
    );
    let def = PipelineDefinition::new(
        "primary",
        vec![
            StepDefinition::tool("live", "fail"),
            StepDefinition::tool("never", "echo"),
        ],
    )
    .with_error_handling(ErrorHandling::fallback(fallback));

    let result = exec.execute(&def, json!({"region": "eu"})).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.output, json!({"region": "eu"}));
    assert!(result.result.context.step_result("never").is_none());
    let fb = result.result.fallback.as_ref().unwrap();
    assert!(fb.success);
    assert_eq!(fb.result.pipeline_id, "backup");
}

#[tokio::test]
async fn test_failed_fallback_reports_both_errors() {
    let (exec, _) = executor();
    let fallback = PipelineDefinition::new("backup", vec![StepDefinition::tool("x", "fail")])
        .with_error_handling(ErrorHandling::stop());
    let def = PipelineDefinition::new("primary", vec![StepDefinition::tool("live", "fail")])
        .with_error_handling(ErrorHandling::fallback(fallback));

    let result = exec.execute(&def, Value::Null).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("'live'"));
    assert!(error.contains("fallback pipeline 'backup' failed"));
}

// ---------------------------------------------------------------------------
// Parallel steps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_to_settle_releases_parallel_step() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "race",
        vec![
            StepDefinition::tool("fast", "sleep").with_input("ms", 1),
            StepDefinition::tool("slow", "sleep")
                .with_input("ms", 80)
                .with_output("slow_ms", ".ms"),
            StepDefinition::parallel("either", vec!["fast".into(), "slow".into()], false),
            StepDefinition::tool("after", "echo")
                .with_input("from", "$slow_ms")
                .with_dependencies(vec!["slow".into()]),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(result.success, "{:?}", result.error);
    let ctx = &result.result.context;
    let either = ctx.step_result("either").unwrap();
    assert_eq!(either.result["completed"], json!(1));
    assert_eq!(either.result["first"], json!("fast"));
    assert!(ctx.step_succeeded("slow"));
    assert_eq!(ctx.step_result("after").unwrap().result, json!({"from": 80}));
}

#[tokio::test]
async fn test_unwaited_siblings_settle_before_run_ends() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "race",
        vec![
            StepDefinition::tool("fast", "echo"),
            StepDefinition::tool("slow", "sleep").with_input("ms", 30),
            StepDefinition::parallel("either", vec!["fast".into(), "slow".into()], false),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    let ids: Vec<&str> = result
        .result
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .collect();
    for id in ["fast", "slow", "either"] {
        assert!(ids.contains(&id), "missing {id} in {ids:?}");
    }
}

#[tokio::test]
async fn test_overlapping_sibling_outputs_keep_last_recorded() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "overlap",
        vec![
            StepDefinition::tool("slow", "sleep")
                .with_input("ms", 50)
                .with_input("tag", "slow")
                .with_output("k", ".tag"),
            StepDefinition::tool("fast", "echo")
                .with_input("tag", "fast")
                .with_output("k", ".tag"),
            StepDefinition::parallel("both", vec!["slow".into(), "fast".into()], true),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(result.success, "{:?}", result.error);
    let ctx = &result.result.context;
    // Siblings are recorded in declaration order, whatever order they finish in.
    assert_eq!(ctx.variable("k"), Some(&json!("fast")));
    let order: Vec<&str> = ctx
        .step_results
        .iter()
        .map(|r| r.step_id.as_str())
        .collect();
    assert_eq!(order, vec!["slow", "fast", "both"]);
}

#[tokio::test]
async fn test_unwaited_sibling_output_overwrites_first_settled() {
    let (exec, _) = executor();
    let def = PipelineDefinition::new(
        "overlap-race",
        vec![
            StepDefinition::tool("fast", "echo")
                .with_input("tag", "fast")
                .with_output("k", ".tag"),
            StepDefinition::tool("slow", "sleep")
                .with_input("ms", 40)
                .with_input("tag", "slow")
                .with_output("k", ".tag"),
            StepDefinition::parallel("either", vec!["fast".into(), "slow".into()], false),
            StepDefinition::tool("peek", "echo").with_input("seen", "$k"),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    assert!(result.success, "{:?}", result.error);
    let ctx = &result.result.context;
    assert_eq!(ctx.step_result("either").unwrap().result["first"], json!("fast"));
    // `peek` ran before the straggler settled, so it saw the first write.
    assert_eq!(ctx.step_result("peek").unwrap().result, json!({"seen": "fast"}));
    assert_eq!(ctx.variable("k"), Some(&json!("slow")));

    let position = |id: &str| ctx.step_results.iter().position(|r| r.step_id == id).unwrap();
    assert!(position("fast") < position("slow"));
}

#[tokio::test]
async fn test_pipeline_with_nested_fan_out_runs_on_spawned_task() {
    let tools = Arc::new(MockTools::default());
    let exec = PipelineExecutor::new(tools);
    let chain = ChainDefinition::new(
        "inner",
        vec![
            ChainStep::new("a", "echo", "1.1").with_static_param("n", 1),
            ChainStep::new("b", "echo", "1.2").with_static_param("n", 2),
        ],
    )
    .with_output_mapping("sum", "b.n");
    let def = PipelineDefinition::new(
        "spawned",
        vec![
            StepDefinition::tool("x", "echo").with_input("v", 1),
            StepDefinition::chain("y", chain).with_output("sum", ".sum"),
            StepDefinition::parallel("both", vec!["x".into(), "y".into()], true),
        ],
    );

    let handle = tokio::spawn(async move { exec.execute(&def, Value::Null).await });
    let result = handle.await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.context.variable("sum"), Some(&json!(2)));
    assert_eq!(
        result.result.context.step_result("both").unwrap().result["completed"],
        json!(2)
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let (exec, tools) = executor();
    let token = CancellationToken::new();
    token.cancel();
    let def = PipelineDefinition::new("c", vec![StepDefinition::tool("a", "echo")]);

    let result = exec.execute_with_cancellation(&def, Value::Null, token).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert_eq!(tools.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_long_tool_call() {
    let (exec, _) = executor();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let def = PipelineDefinition::new(
        "c",
        vec![
            StepDefinition::tool("long", "sleep").with_input("ms", 10_000),
            StepDefinition::tool("next", "echo"),
        ],
    );

    let started = std::time::Instant::now();
    let result = exec.execute_with_cancellation(&def, Value::Null, token).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert!(!result.result.context.step_succeeded("long"));
    assert!(result.result.context.step_result("next").is_none());
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_monitor_tracks_run_and_steps() {
    let tools = Arc::new(MockTools::default());
    let monitor = Arc::new(ExecutionMonitor::new());
    let exec = PipelineExecutor::new(tools).with_metrics(monitor.clone());
    let def = PipelineDefinition::new(
        "m",
        vec![
            StepDefinition::tool("a", "echo"),
            StepDefinition::tool("b", "fail"),
        ],
    );

    let result = exec.execute(&def, Value::Null).await;

    let summary = monitor.summary().await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.running, 0);
    assert_eq!(summary.failed, 1);
    let run = monitor.get(&result.result.execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_write_then_read_with_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    let path = path.to_str().unwrap();

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry);
    let exec = PipelineExecutor::new(Arc::new(registry));

    let def = PipelineDefinition::new(
        "files",
        vec![
            StepDefinition::tool("write", "file_write")
                .with_input("path", "$path")
                .with_input("content", "$text"),
            StepDefinition::tool("read", "file_read")
                .with_input("path", "$path")
                .with_output("content", ".content")
                .with_dependencies(vec!["write".into()]),
            StepDefinition::transform("shout", "uppercase")
                .with_input("value", "$content")
                .with_dependencies(vec!["read".into()]),
        ],
    )
    .with_output("text", "@shout")
    .with_output("bytes", "@write.bytes_written");

    let result = exec
        .execute(&def, json!({"path": path, "text": "hello conductor"}))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result.output,
        json!({"text": "HELLO CONDUCTOR", "bytes": 15})
    );
}

#[tokio::test]
async fn test_unknown_registry_tool_fails_step() {
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry);
    let exec = PipelineExecutor::new(Arc::new(registry));
    let def = PipelineDefinition::new("p", vec![StepDefinition::tool("x", "does_not_exist")])
        .with_error_handling(ErrorHandling::stop());

    let result = exec.execute(&def, Value::Null).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("Unknown tool: does_not_exist"));
}
