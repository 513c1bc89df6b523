//! Pre-execution validation of step graphs.
//!
//! Rejects duplicate ids, dangling dependency references and dependency
//! cycles before anything runs. Execution order is not changed: steps still
//! run in declaration (pipelines) or semantic-number (chains) order.

use crate::chain::is_valid_semantic_number;
use crate::types::{ChainDefinition, PipelineDefinition, StepKind};
use conductor_core::{ConductorError, ConductorResult};
use std::collections::{HashMap, HashSet};

/// A node in a dependency graph.
pub trait PlanNode {
    fn node_id(&self) -> &str;
    fn node_dependencies(&self) -> &[String];
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Validate ids, dependency references and acyclicity for `nodes`.
pub fn validate_plan<N: PlanNode>(nodes: &[N]) -> ConductorResult<()> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.node_id()) {
            return Err(ConductorError::DuplicateStep(node.node_id().to_string()));
        }
    }

    for node in nodes {
        for dep in node.node_dependencies() {
            if !seen.contains(dep.as_str()) {
                return Err(ConductorError::Planning {
                    step: node.node_id().to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(nodes) {
        return Err(ConductorError::DependencyCycle(cycle));
    }

    Ok(())
}

/// Returns the first dependency cycle found, as a path that starts and ends
/// with the same id.
pub fn find_cycle<N: PlanNode>(nodes: &[N]) -> Option<Vec<String>> {
    let index: HashMap<&str, &N> = nodes.iter().map(|n| (n.node_id(), n)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for node in nodes {
        if let Some(cycle) = visit(node.node_id(), &index, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a, N: PlanNode>(
    id: &'a str,
    index: &HashMap<&'a str, &'a N>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::InProgress) => {
            // back edge
            let start = stack.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(id, Mark::InProgress);
    stack.push(id);
    if let Some(node) = index.get(id) {
        for dep in node.node_dependencies() {
            if let Some(cycle) = visit(dep.as_str(), index, marks, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}

/// Validate a pipeline definition, including the sibling lists of parallel
/// steps.
pub fn validate_pipeline(definition: &PipelineDefinition) -> ConductorResult<()> {
    validate_plan(&definition.steps)?;

    let ids: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for step in &definition.steps {
        let StepKind::Parallel { steps, .. } = &step.kind else {
            continue;
        };
        for sibling in steps {
            if sibling == &step.id {
                return Err(ConductorError::DependencyCycle(vec![
                    step.id.clone(),
                    step.id.clone(),
                ]));
            }
            if !ids.contains(sibling.as_str()) {
                return Err(ConductorError::Planning {
                    step: step.id.clone(),
                    dependency: sibling.clone(),
                });
            }
            if let Some(owner) = owners.insert(sibling.as_str(), step.id.as_str()) {
                return Err(ConductorError::Config(format!(
                    "step '{sibling}' is claimed by parallel steps '{owner}' and '{}'",
                    step.id
                )));
            }
        }
    }

    if let Some(fallback) = definition
        .error_handling
        .as_ref()
        .and_then(|h| h.fallback.as_deref())
    {
        validate_pipeline(fallback)?;
    }

    Ok(())
}

/// Validate a chain definition: graph checks plus semantic-number format.
pub fn validate_chain(chain: &ChainDefinition) -> ConductorResult<()> {
    for step in &chain.steps {
        if !is_valid_semantic_number(&step.semantic_number) {
            return Err(ConductorError::InvalidSemanticNumber {
                step: step.id.clone(),
                value: step.semantic_number.clone(),
            });
        }
    }
    validate_plan(&chain.steps)
}
