//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the error taxonomy, the tool and agent interfaces consumed by the
//! orchestrators, and the metrics notification seam.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for planning, execution and validation failures.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`FailureKind`] — Serializable classification of a [`ConductorError`].
//! - [`ToolExecutor`] / [`ToolResult`] — Interface to the external tool registry.
//! - [`Agent`] / [`AgentResult`] — Interface to an external agent.
//! - [`MetricsSink`] — Start/end notifications for runs and steps.

/// Agent interface used by the team coordinator.
pub mod agent;
/// Error taxonomy shared by every crate.
pub mod error;
/// Metrics notification interface.
pub mod metrics;
/// Tool invocation interface and result type.
pub mod tool;

pub use agent::{response_text, Agent, AgentResult};
pub use error::{ConductorError, ConductorResult, FailureKind};
pub use metrics::{MetricsSink, NoopMetrics};
pub use tool::{Params, ToolExecutor, ToolResult};
