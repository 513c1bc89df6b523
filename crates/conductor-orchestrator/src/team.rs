//! Multi-agent task execution.
//!
//! A [`TeamCoordinator`] owns a team of agents and runs a task payload through
//! one of five strategies:
//!
//! - `PARALLEL`: every member gets the task at once; succeeds if any member does.
//! - `SEQUENTIAL`: members run one after another; every member runs, and any
//!   failure fails the task.
//! - `PIPELINE`: each member's output is the next member's task; the first
//!   failure stops the pipeline.
//! - `ROLE_BASED`: the best-matching member alone handles the task.
//! - `COLLABORATIVE`: a manager answers first and may delegate sub-tasks with a
//!   `DELEGATIONS: {...}` directive; success follows the manager.

use crate::config::OrchestratorConfig;
use crate::retry::{run_with_retry, RetryPolicy};
use conductor_core::{
    response_text, Agent, AgentResult, ConductorError, ConductorResult, FailureKind, MetricsSink,
    NoopMetrics,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DELEGATION_MARKER: &str = "DELEGATIONS:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamExecutionStrategy {
    #[default]
    Parallel,
    Sequential,
    Pipeline,
    RoleBased,
    Collaborative,
}

impl fmt::Display for TeamExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamExecutionStrategy::Parallel => write!(f, "PARALLEL"),
            TeamExecutionStrategy::Sequential => write!(f, "SEQUENTIAL"),
            TeamExecutionStrategy::Pipeline => write!(f, "PIPELINE"),
            TeamExecutionStrategy::RoleBased => write!(f, "ROLE_BASED"),
            TeamExecutionStrategy::Collaborative => write!(f, "COLLABORATIVE"),
        }
    }
}

/// A named agent with an optional role and a list of capabilities.
#[derive(Clone)]
pub struct TeamMember {
    pub name: String,
    pub role: Option<String>,
    pub capabilities: Vec<String>,
    pub agent: Arc<dyn Agent>,
}

impl TeamMember {
    /// A member named after its agent.
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            name: agent.name().to_string(),
            role: None,
            capabilities: Vec::new(),
            agent,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl fmt::Debug for TeamMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamMember")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<TeamMember>,
    /// Required for `COLLABORATIVE`; otherwise the first member manages.
    pub manager: Option<TeamMember>,
}

impl TeamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            manager: None,
        }
    }

    pub fn with_member(mut self, member: TeamMember) -> Self {
        self.agents.push(member);
        self
    }

    pub fn with_manager(mut self, manager: TeamMember) -> Self {
        self.manager = Some(manager);
        self
    }

    fn member(&self, name: &str) -> Option<&TeamMember> {
        self.agents
            .iter()
            .chain(self.manager.as_ref())
            .find(|m| m.name == name)
    }
}

/// Per-task options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Overrides the coordinator's default strategy.
    pub strategy: Option<TeamExecutionStrategy>,
    /// Aborts in-flight agent calls and pending retries.
    pub cancel: CancellationToken,
}

impl TaskOptions {
    pub fn with_strategy(strategy: TeamExecutionStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            cancel: CancellationToken::new(),
        }
    }
}

/// What a single member produced for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResult {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub task: String,
    pub success: bool,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub duration: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamResult {
    pub success: bool,
    pub team: String,
    pub strategy: TeamExecutionStrategy,
    pub task_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Every member invocation, in invocation order.
    pub individual_results: Vec<MemberResult>,
    /// Manager and delegate contributions (`COLLABORATIVE` only).
    #[serde(default)]
    pub individual_contributions: Vec<MemberResult>,
    /// Milliseconds.
    pub duration: u64,
}

/// One sub-task named by a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub agent: String,
    pub task: String,
}

#[derive(Deserialize)]
struct DelegationDirective {
    #[serde(default)]
    delegations: Vec<Delegation>,
}

/// Extract the delegations following the `DELEGATIONS:` marker in `text`.
/// Returns an empty list when there is no marker or the JSON is malformed.
pub fn parse_delegations(text: &str) -> Vec<Delegation> {
    let Some(marker) = text.find(DELEGATION_MARKER) else {
        return Vec::new();
    };
    let after = &text[marker + DELEGATION_MARKER.len()..];
    let Some(open) = after.find('{') else {
        return Vec::new();
    };

    let mut stream =
        serde_json::Deserializer::from_str(&after[open..]).into_iter::<DelegationDirective>();
    match stream.next() {
        Some(Ok(directive)) => directive.delegations,
        Some(Err(e)) => {
            warn!(error = %e, "Malformed delegation directive");
            Vec::new()
        }
        None => Vec::new(),
    }
}

struct Outcome {
    success: bool,
    result: Value,
    error: Option<ConductorError>,
    results: Vec<MemberResult>,
    contributions: Vec<MemberResult>,
}

/// Runs tasks across a team of agents.
pub struct TeamCoordinator {
    team: TeamConfig,
    default_strategy: TeamExecutionStrategy,
    member_retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl TeamCoordinator {
    pub fn new(team: TeamConfig) -> Self {
        Self {
            team,
            default_strategy: TeamExecutionStrategy::default(),
            member_retry: RetryPolicy::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Apply the `[team]` section of the engine config.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.default_strategy = config.team.default_strategy;
        self.member_retry = config.team.member_retry.clone();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn team(&self) -> &TeamConfig {
        &self.team
    }

    /// Run `payload` through the team.
    ///
    /// `payload` must be an object with non-empty string `id` and `title`
    /// fields; `description`, `role` and `capabilities` are optional.
    /// Malformed payloads and empty teams are rejected before any agent runs.
    /// Every other failure is reported through the returned [`TeamResult`].
    pub async fn execute_task(
        &self,
        payload: &Value,
        options: TaskOptions,
    ) -> ConductorResult<TeamResult> {
        validate_payload(payload)?;
        let strategy = options.strategy.unwrap_or(self.default_strategy);
        if self.team.agents.is_empty()
            && !(strategy == TeamExecutionStrategy::Collaborative && self.team.manager.is_some())
        {
            return Err(ConductorError::Config(format!(
                "team '{}' has no members",
                self.team.name
            )));
        }

        let task_id = string_field(payload, "id").unwrap_or_default().to_string();
        let task = task_text(payload);
        let start = Instant::now();
        let unit = format!("team:{}:{task_id}", self.team.name);

        info!(team = %self.team.name, task_id = %task_id, strategy = %strategy, "Team: starting task");
        self.metrics
            .start(&unit, json!({"kind": "team", "strategy": strategy, "taskId": task_id}))
            .await;

        let outcome = match strategy {
            TeamExecutionStrategy::Parallel => self.run_parallel(&task, payload, &options.cancel).await,
            TeamExecutionStrategy::Sequential => {
                self.run_sequential(&task, payload, &options.cancel).await
            }
            TeamExecutionStrategy::Pipeline => self.run_pipeline(&task, payload, &options.cancel).await,
            TeamExecutionStrategy::RoleBased => {
                self.run_role_based(&task, payload, &options.cancel).await
            }
            TeamExecutionStrategy::Collaborative => {
                self.run_collaborative(&task, payload, &options.cancel).await
            }
        };

        let duration = start.elapsed().as_millis() as u64;
        match &outcome.error {
            None => info!(team = %self.team.name, task_id = %task_id, duration_ms = duration, "Team: task complete"),
            Some(e) => warn!(team = %self.team.name, task_id = %task_id, error = %e, "Team: task failed"),
        }
        self.metrics
            .end(&unit, json!({"success": outcome.success, "duration": duration}))
            .await;

        Ok(TeamResult {
            success: outcome.success,
            team: self.team.name.clone(),
            strategy,
            task_id,
            result: outcome.result,
            error: outcome.error.as_ref().map(ToString::to_string),
            failure: outcome.error.as_ref().map(ConductorError::kind),
            individual_results: outcome.results,
            individual_contributions: outcome.contributions,
            duration,
        })
    }

    async fn run_parallel(&self, task: &str, payload: &Value, cancel: &CancellationToken) -> Outcome {
        let results = join_all(
            self.team
                .agents
                .iter()
                .map(|member| self.invoke(member, task, payload, cancel)),
        )
        .await;

        let successes: Vec<Value> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.result.clone())
            .collect();
        let error = successes.is_empty().then(|| {
            ConductorError::AggregateFailure(format!(
                "All {} participating agents failed",
                results.len()
            ))
        });

        Outcome {
            success: error.is_none(),
            result: Value::Array(successes),
            error,
            results,
            contributions: Vec::new(),
        }
    }

    async fn run_sequential(
        &self,
        task: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut results = Vec::with_capacity(self.team.agents.len());
        for member in &self.team.agents {
            results.push(self.invoke(member, task, payload, cancel).await);
        }

        let failed: Vec<&str> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.agent.as_str())
            .collect();
        let error = (!failed.is_empty()).then(|| ConductorError::StepExecution {
            step: "sequential".to_string(),
            message: format!(
                "Sequential execution broken: {} of {} agents failed ({})",
                failed.len(),
                results.len(),
                failed.join(", ")
            ),
        });

        Outcome {
            success: error.is_none(),
            result: Value::Array(results.iter().map(|r| r.result.clone()).collect()),
            error,
            results,
            contributions: Vec::new(),
        }
    }

    async fn run_pipeline(&self, task: &str, payload: &Value, cancel: &CancellationToken) -> Outcome {
        let mut results: Vec<MemberResult> = Vec::new();
        let mut input = task.to_string();
        let mut error = None;

        for member in &self.team.agents {
            let result = self.invoke(member, &input, payload, cancel).await;
            if !result.success {
                error = Some(ConductorError::StepExecution {
                    step: member.name.clone(),
                    message: format!(
                        "Pipeline broken at agent '{}': {}",
                        member.name,
                        result.error.clone().unwrap_or_default()
                    ),
                });
                results.push(result);
                break;
            }
            input = response_text(&result.result);
            results.push(result);
        }

        let result = if error.is_none() {
            results.last().map(|r| r.result.clone()).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        Outcome {
            success: error.is_none(),
            result,
            error,
            results,
            contributions: Vec::new(),
        }
    }

    async fn run_role_based(
        &self,
        task: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(member) = select_member(&self.team.agents, task, payload) else {
            return Outcome {
                success: false,
                result: Value::Null,
                error: Some(ConductorError::Config(format!(
                    "team '{}' has no members",
                    self.team.name
                ))),
                results: Vec::new(),
                contributions: Vec::new(),
            };
        };
        debug!(member = %member.name, "Team: role-based selection");

        let result = self.invoke(member, task, payload, cancel).await;
        let error = (!result.success).then(|| ConductorError::Agent(format!(
            "{}: {}",
            member.name,
            result.error.clone().unwrap_or_default()
        )));
        Outcome {
            success: result.success,
            result: result.result.clone(),
            error,
            results: vec![result],
            contributions: Vec::new(),
        }
    }

    async fn run_collaborative(
        &self,
        task: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(manager) = self.team.manager.as_ref().or(self.team.agents.first()) else {
            return Outcome {
                success: false,
                result: Value::Null,
                error: Some(ConductorError::Config("no manager available".to_string())),
                results: Vec::new(),
                contributions: Vec::new(),
            };
        };
        if self.team.manager.is_none() {
            warn!(team = %self.team.name, manager = %manager.name, "No manager configured, using first member");
        }

        let prompt = self.manager_prompt(manager, task);
        let manager_result = self.invoke(manager, &prompt, payload, cancel).await;
        if !manager_result.success {
            let error = ConductorError::Agent(format!(
                "Manager '{}' failed: {}",
                manager.name,
                manager_result.error.clone().unwrap_or_default()
            ));
            return Outcome {
                success: false,
                result: Value::Null,
                error: Some(error),
                results: vec![manager_result.clone()],
                contributions: vec![manager_result],
            };
        }

        let delegations = parse_delegations(&response_text(&manager_result.result));
        if delegations.is_empty() {
            debug!(manager = %manager.name, "Manager answered without delegating");
            return Outcome {
                success: true,
                result: manager_result.result.clone(),
                error: None,
                results: vec![manager_result.clone()],
                contributions: vec![manager_result],
            };
        }

        info!(manager = %manager.name, count = delegations.len(), "Team: dispatching delegations");
        let delegated = join_all(delegations.iter().map(|d| async move {
            match self.team.member(&d.agent) {
                Some(member) => self.invoke(member, &d.task, payload, cancel).await,
                None => {
                    warn!(agent = %d.agent, "Delegation names an unknown team member");
                    MemberResult {
                        agent: d.agent.clone(),
                        role: None,
                        task: d.task.clone(),
                        success: false,
                        result: Value::Null,
                        error: Some(format!("Unknown team member '{}'", d.agent)),
                        duration: 0,
                        attempts: 0,
                    }
                }
            }
        }))
        .await;

        let summary: Vec<Value> = delegated
            .iter()
            .map(|r| {
                json!({
                    "agent": r.agent,
                    "task": r.task,
                    "success": r.success,
                    "result": r.result,
                    "error": r.error,
                })
            })
            .collect();
        let result = json!({"manager": manager_result.result, "delegations": summary});

        let mut contributions = vec![manager_result];
        contributions.extend(delegated);
        Outcome {
            success: true,
            result,
            error: None,
            results: contributions.clone(),
            contributions,
        }
    }

    fn manager_prompt(&self, manager: &TeamMember, task: &str) -> String {
        let roster: Vec<String> = self
            .team
            .agents
            .iter()
            .filter(|m| m.name != manager.name)
            .map(|m| {
                let mut line = format!("- {}", m.name);
                if let Some(role) = &m.role {
                    line.push_str(&format!(" (role: {role})"));
                }
                if !m.capabilities.is_empty() {
                    line.push_str(&format!(" [capabilities: {}]", m.capabilities.join(", ")));
                }
                line
            })
            .collect();

        format!(
            "You are the manager of team '{team}'.\n\
             Team members:\n{roster}\n\n\
             Answer the task yourself or delegate sub-tasks by ending your reply with:\n\
             {DELEGATION_MARKER} {{\"delegations\":[{{\"agent\":\"<member name>\",\"task\":\"<sub-task>\"}}]}}\n\n\
             Task:\n{task}",
            team = self.team.name,
            roster = roster.join("\n"),
        )
    }

    async fn invoke(
        &self,
        member: &TeamMember,
        task: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> MemberResult {
        let start = Instant::now();
        let outcome = run_with_retry(&self.member_retry, &member.name, cancel, move |_| async move {
            tokio::select! {
                result = member.agent.run(task, Some(payload)) => match result {
                    Ok(result) => result,
                    Err(e) => AgentResult::failure(e.to_string()),
                },
                _ = cancel.cancelled() => AgentResult::failure("agent call cancelled"),
            }
        })
        .await;

        let attempts = outcome.attempts;
        let AgentResult {
            success,
            result,
            error,
        } = outcome.value;
        if !success {
            warn!(agent = %member.name, attempts, error = ?error, "Team member failed");
        }

        MemberResult {
            agent: member.name.clone(),
            role: member.role.clone(),
            task: task.to_string(),
            success,
            result: result.unwrap_or(Value::Null),
            error: if success {
                None
            } else {
                Some(error.unwrap_or_else(|| "agent reported failure".to_string()))
            },
            duration: start.elapsed().as_millis() as u64,
            attempts,
        }
    }
}

fn string_field<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn validate_payload(payload: &Value) -> ConductorResult<()> {
    let missing: Vec<String> = ["id", "title"]
        .into_iter()
        .filter(|field| string_field(payload, field).is_none())
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConductorError::PayloadValidation(missing))
    }
}

fn task_text(payload: &Value) -> String {
    let title = string_field(payload, "title").unwrap_or_default();
    match string_field(payload, "description") {
        Some(description) => format!("{title}\n\n{description}"),
        None => title.to_string(),
    }
}

fn string_list(payload: &Value, field: &str) -> Vec<String> {
    payload
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Pick the member that best fits the task.
///
/// Scoring: exact match with the payload's `role` +10, each capability listed
/// in the payload's `capabilities` +5, the member's role named in the task
/// text +2, each of the member's capabilities named in the task text +1.
/// Ties go to the earlier member.
pub fn select_member<'a>(
    members: &'a [TeamMember],
    task: &str,
    payload: &Value,
) -> Option<&'a TeamMember> {
    let wanted_role = string_field(payload, "role").map(str::to_lowercase);
    let wanted_caps = string_list(payload, "capabilities");
    let text = task.to_lowercase();

    let score = |member: &TeamMember| -> u32 {
        let role = member.role.as_deref().map(str::to_lowercase);
        let caps: Vec<String> = member.capabilities.iter().map(|c| c.to_lowercase()).collect();

        let mut score = 0;
        if role.is_some() && role == wanted_role {
            score += 10;
        }
        score += 5 * wanted_caps.iter().filter(|c| caps.contains(c)).count() as u32;
        if role.as_deref().is_some_and(|r| text.contains(r)) {
            score += 2;
        }
        score += caps.iter().filter(|c| text.contains(c.as_str())).count() as u32;
        score
    };

    let mut best: Option<(&TeamMember, u32)> = None;
    for member in members {
        let s = score(member);
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((member, s));
        }
    }

    if let Some((member, 0)) = best {
        warn!(member = %member.name, "No member matches the task, using the first one");
    }
    best.map(|(member, _)| member)
}
