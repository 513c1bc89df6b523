use crate::retry::RetryPolicy;
use crate::team::TeamExecutionStrategy;
use conductor_core::{ConductorError, ConductorResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine-wide settings, usually read from `conductor.toml`.
///
/// ```toml
/// max_concurrency = 4
///
/// [default_retry]
/// max_retries = 2
/// backoff_ms = 250
///
/// [team]
/// default_strategy = "SEQUENTIAL"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Used by pipeline steps without a `retryPolicy`.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Upper bound on concurrently running steps in a parallel step or chain group.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub team: TeamSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSettings {
    /// Strategy used when a task does not pick one.
    #[serde(default)]
    pub default_strategy: TeamExecutionStrategy,
    /// Retry policy applied to every member invocation.
    #[serde(default)]
    pub member_retry: RetryPolicy,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            max_concurrency: default_max_concurrency(),
            team: TeamSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(text: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConductorError::Config(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a pipeline or chain definition from a `.json` or `.toml` file.
pub fn load_definition<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConductorResult<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&text)?),
        Some("toml") => Ok(toml::from_str(&text)?),
        other => Err(ConductorError::Config(format!(
            "unsupported definition format '{}' for {}",
            other.unwrap_or(""),
            path.display()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::PipelineDefinition;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.default_retry.max_attempts(), 1);
        assert_eq!(config.team.default_strategy, TeamExecutionStrategy::Parallel);
    }

    #[test]
    fn test_full_config() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_concurrency = 2

            [default_retry]
            max_retries = 3
            backoff_ms = 50
            retry_on = ["timeout"]

            [team]
            default_strategy = "ROLE_BASED"

            [team.member_retry]
            max_retries = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.default_retry.max_retries, 3);
        assert_eq!(config.default_retry.retry_on, vec!["timeout"]);
        assert_eq!(config.team.default_strategy, TeamExecutionStrategy::RoleBased);
        assert_eq!(config.team.member_retry.max_retries, 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = OrchestratorConfig::from_toml_str("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));
    }

    #[test]
    fn test_bad_toml_is_error() {
        let err = OrchestratorConfig::from_toml_str("max_concurrency = [").unwrap_err();
        assert!(matches!(err, ConductorError::Toml(_)));
    }

    #[test]
    fn test_load_definition_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("p.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(br#"{"id": "p", "steps": [{"id": "w", "type": "wait", "duration": 1}]}"#)
            .unwrap();
        let def: PipelineDefinition = load_definition(&json_path).unwrap();
        assert_eq!(def.id, "p");

        let toml_path = dir.path().join("p.toml");
        std::fs::write(&toml_path, "id = \"q\"\nsteps = []\n").unwrap();
        let def: PipelineDefinition = load_definition(&toml_path).unwrap();
        assert_eq!(def.id, "q");

        let yaml_path = dir.path().join("p.yaml");
        std::fs::write(&yaml_path, "id: p").unwrap();
        assert!(load_definition::<PipelineDefinition>(&yaml_path).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = OrchestratorConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConductorError::Io(_)));
    }
}
