use serde::{Deserialize, Serialize};

/// Top-level error type for the Conductor engine.
///
/// Planning variants are raised before any step runs; execution variants are
/// captured into step results unless the run's error strategy says to stop.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A step references a dependency that does not exist in the definition.
    #[error("Planning error: step '{step}' depends on unknown step '{dependency}'")]
    Planning {
        /// The step declaring the dependency.
        step: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Planning error: dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Two steps in one definition share an id.
    #[error("Planning error: duplicate step id '{0}'")]
    DuplicateStep(String),

    /// A chain step carries a malformed semantic number.
    #[error("Planning error: step '{step}' has invalid semantic number '{value}'")]
    InvalidSemanticNumber {
        /// The offending step.
        step: String,
        /// The rejected value.
        value: String,
    },

    /// A prerequisite step did not succeed at run time.
    #[error("Dependency not met: step '{step}' requires '{dependency}' to succeed")]
    DependencyNotMet {
        /// The step that could not run.
        step: String,
        /// The unsatisfied dependency.
        dependency: String,
    },

    /// A step (tool, chain, transform, ...) failed.
    #[error("Step '{step}' failed: {message}")]
    StepExecution {
        /// The failing step.
        step: String,
        /// Failure description.
        message: String,
    },

    /// A team task payload is missing required fields.
    #[error("Payload validation error: missing required field(s): {}", .0.join(", "))]
    PayloadValidation(Vec<String>),

    /// Every participant of a fan-out failed.
    #[error("{0}")]
    AggregateFailure(String),

    /// An error raised by the tool registry or a tool.
    #[error("Tool error: {0}")]
    Tool(String),

    /// An error raised while invoking an agent.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A condition expression could not be parsed or evaluated.
    #[error("Expression error: {0}")]
    Expression(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The run was cancelled through its cancellation token.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Coarse classification of a failure, attached to failed run results so
/// callers can branch without matching on error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected before execution started.
    Planning,
    /// A prerequisite did not succeed.
    DependencyNotMet,
    /// A step, tool or agent call failed.
    StepExecution,
    /// A team payload was malformed.
    PayloadValidation,
    /// Every participant of a fan-out failed.
    AggregateFailure,
    /// The run was cancelled.
    Cancelled,
    /// Configuration or (de)serialization problem.
    Config,
}

impl ConductorError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            ConductorError::Planning { .. }
            | ConductorError::DependencyCycle(_)
            | ConductorError::DuplicateStep(_)
            | ConductorError::InvalidSemanticNumber { .. } => FailureKind::Planning,
            ConductorError::DependencyNotMet { .. } => FailureKind::DependencyNotMet,
            ConductorError::StepExecution { .. }
            | ConductorError::Tool(_)
            | ConductorError::Agent(_)
            | ConductorError::Expression(_) => FailureKind::StepExecution,
            ConductorError::PayloadValidation(_) => FailureKind::PayloadValidation,
            ConductorError::AggregateFailure(_) => FailureKind::AggregateFailure,
            ConductorError::Cancelled(_) => FailureKind::Cancelled,
            ConductorError::Config(_)
            | ConductorError::Json(_)
            | ConductorError::Toml(_)
            | ConductorError::Io(_) => FailureKind::Config,
        }
    }

    /// Whether the error was detected before any step ran.
    pub fn is_planning(&self) -> bool {
        self.kind() == FailureKind::Planning
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_error_names_step_and_dependency() {
        let err = ConductorError::Planning {
            step: "write".into(),
            dependency: "fetch".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'write'"));
        assert!(msg.contains("'fetch'"));
        assert!(err.is_planning());
    }

    #[test]
    fn test_cycle_display() {
        let err = ConductorError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            err.to_string(),
            "Planning error: dependency cycle detected: a -> b -> a"
        );
        assert_eq!(err.kind(), FailureKind::Planning);
    }

    #[test]
    fn test_payload_validation_lists_fields() {
        let err = ConductorError::PayloadValidation(vec!["id".into(), "title".into()]);
        assert!(err.to_string().ends_with("id, title"));
        assert_eq!(err.kind(), FailureKind::PayloadValidation);
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::DependencyNotMet).unwrap();
        assert_eq!(json, "\"dependency_not_met\"");
    }
}
