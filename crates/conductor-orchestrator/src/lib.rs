//! Workflow execution for Conductor: declarative pipelines, semantically
//! numbered tool chains and multi-agent teams.
//!
//! Pipelines and chains are validated up front (unknown dependencies, cycles,
//! duplicate ids), then executed against an injected tool registry with
//! bounded parallelism, retries and cancellation. Teams run a task payload
//! across several agents using one of five coordination strategies.
//!
//! # Main types
//!
//! - [`PipelineExecutor`] — Runs a [`PipelineDefinition`] step graph with error strategies and fallback.
//! - [`ChainExecutor`] — Runs a [`ChainDefinition`] in semantic-number groups.
//! - [`TeamCoordinator`] — Dispatches a task to a team of agents.
//! - [`ExecutionContext`] — Shared run state: inputs, variables, step results and errors.
//! - [`ExecutionMonitor`] — In-memory metrics sink tracking runs, steps and agent calls.
//! - [`OrchestratorConfig`] — Engine settings loaded from `conductor.toml`.

/// Semantically numbered tool chain executor.
pub mod chain;
/// Engine configuration and definition loading.
pub mod config;
/// Per-run execution state.
pub mod context;
/// Condition expression evaluator.
pub mod expression;
/// In-memory execution monitor.
pub mod monitor;
/// Pipeline executor.
pub mod pipeline;
/// Dependency graph validation.
pub mod plan;
/// `$variable`, `@step` and chain reference resolution.
pub mod reference;
/// Retry policy and retry loop.
pub mod retry;
/// Multi-agent team coordinator.
pub mod team;
/// Built-in value transforms.
pub mod transform;
/// Pipeline and chain definitions.
pub mod types;

pub use chain::{ChainExecutionResult, ChainExecutor, ChainMetrics};
pub use config::{load_definition, OrchestratorConfig, TeamSettings};
pub use context::{ErrorRecord, ExecutionContext, ExecutionMetadata, StepResult};
pub use monitor::{ExecutionMonitor, ExecutionRecord, ExecutionStatus, MonitorSummary};
pub use pipeline::{PipelineExecutor, PipelineMetrics, PipelineResult, PipelineRunOutput, StepMetrics};
pub use plan::{validate_chain, validate_pipeline};
pub use retry::{run_with_retry, RetryOutcome, RetryPolicy};
pub use team::{
    Delegation, MemberResult, TaskOptions, TeamConfig, TeamCoordinator, TeamExecutionStrategy,
    TeamMember, TeamResult,
};
pub use types::{
    ChainDefinition, ChainStep, ErrorHandling, ErrorStrategy, PipelineDefinition, StepDefinition,
    StepKind,
};
