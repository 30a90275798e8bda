//! Workflow request validation.
//!
//! Enforces the structural invariants before a thread is created: unique step
//! ids, acyclic deps, resolvable branch/parallel/loop references, exactly one
//! agent binding on task steps, none on control steps, and sane loop/human
//! parameters. Validation failures surface at the request boundary and are
//! never retried.

use std::collections::HashSet;

use studio_types::workflow::{LoopType, StepType, WorkflowStep};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A step's role or agent id matched nothing.
    #[error("agent unresolved for step '{step_id}': {detail}")]
    AgentUnresolved { step_id: String, detail: String },

    /// Condition parse or evaluation error.
    #[error("condition error: {0}")]
    ConditionError(String),

    /// Runtime execution failure.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Thread not found (for resume/status/abort).
    #[error("unknown thread: {0}")]
    UnknownThread(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a workflow request.
///
/// Checks:
/// - At least one step; unique, well-formed step ids
/// - `deps` form a DAG over existing steps
/// - Task/mock steps carry exactly one of `role`/`agentId`; control steps none
/// - Conditional steps carry a condition and at least one existing branch
/// - Parallel steps reference existing steps
/// - Loop steps carry a loop type, existing body steps, `maxIterations >= 1`,
///   and a condition when `loopType = while`
/// - Human steps carry a prompt and a timeout within [60, 86400] when set
pub fn validate_workflow(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    if steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !step
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WorkflowError::ValidationError(format!(
                "step id '{}' contains invalid characters (alphanumeric, hyphen, underscore only)",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step id: '{}'",
                step.id
            )));
        }
    }

    dag::validate_dag(steps)?;

    for step in steps {
        validate_step(step, &seen_ids)?;
    }

    // Human gates suspend the whole thread; they cannot run as children of a
    // parallel or loop parent.
    let human_ids: HashSet<&str> = steps
        .iter()
        .filter(|s| s.step_type == StepType::Human)
        .map(|s| s.id.as_str())
        .collect();
    for step in steps {
        for child in step.parallel_steps.iter().chain(step.loop_steps.iter()) {
            if human_ids.contains(child.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' references human step '{child}' as a child; human steps \
                     cannot run inside parallel or loop bodies",
                    step.id
                )));
            }
        }
    }

    Ok(())
}

fn validate_step(step: &WorkflowStep, ids: &HashSet<&str>) -> Result<(), WorkflowError> {
    let check_ref = |ref_id: &str, what: &str| {
        if ids.contains(ref_id) {
            Ok(())
        } else {
            Err(WorkflowError::ValidationError(format!(
                "step '{}' {what} references unknown step '{ref_id}'",
                step.id
            )))
        }
    };

    match step.step_type {
        StepType::Task | StepType::Mock => {
            match (&step.role, &step.agent_id) {
                (Some(_), Some(_)) => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' must set exactly one of role/agentId, not both",
                        step.id
                    )));
                }
                (None, None) if step.step_type == StepType::Task => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' must set one of role/agentId",
                        step.id
                    )));
                }
                // Mock steps may run unbound.
                _ => {}
            }
            if step.task.is_empty() && step.step_type == StepType::Task {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has an empty task",
                    step.id
                )));
            }
        }
        StepType::Conditional => {
            require_control_unbound(step)?;
            if step.condition.is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "conditional step '{}' has no condition",
                    step.id
                )));
            }
            if step.true_branch.is_none() && step.false_branch.is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "conditional step '{}' has no branches",
                    step.id
                )));
            }
            if let Some(branch) = &step.true_branch {
                check_ref(branch, "trueBranch")?;
            }
            if let Some(branch) = &step.false_branch {
                check_ref(branch, "falseBranch")?;
            }
        }
        StepType::Parallel => {
            require_control_unbound(step)?;
            if step.parallel_steps.is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "parallel step '{}' references no steps",
                    step.id
                )));
            }
            for ref_id in &step.parallel_steps {
                check_ref(ref_id, "parallelSteps")?;
            }
        }
        StepType::Loop => {
            require_control_unbound(step)?;
            let Some(loop_type) = step.loop_type else {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' has no loopType",
                    step.id
                )));
            };
            if step.loop_steps.is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' references no body steps",
                    step.id
                )));
            }
            for ref_id in &step.loop_steps {
                check_ref(ref_id, "loopSteps")?;
            }
            if let Some(max) = step.max_iterations {
                if max < 1 {
                    return Err(WorkflowError::ValidationError(format!(
                        "loop step '{}' maxIterations must be >= 1",
                        step.id
                    )));
                }
            } else if matches!(loop_type, LoopType::For | LoopType::Retry) {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' requires maxIterations for loopType {:?}",
                    step.id, loop_type
                )));
            }
            if loop_type == LoopType::While && step.loop_condition.is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "while loop step '{}' has no loopCondition",
                    step.id
                )));
            }
        }
        StepType::Human => {
            require_control_unbound(step)?;
            if step.prompt.as_deref().unwrap_or_default().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "human step '{}' has no prompt",
                    step.id
                )));
            }
            if let Some(timeout) = step.timeout_seconds {
                if !(60..=86_400).contains(&timeout) {
                    return Err(WorkflowError::ValidationError(format!(
                        "human step '{}' timeoutSeconds must be within [60, 86400]",
                        step.id
                    )));
                }
            }
        }
    }

    Ok(())
}

fn require_control_unbound(step: &WorkflowStep) -> Result<(), WorkflowError> {
    if step.role.is_some() || step.agent_id.is_some() {
        return Err(WorkflowError::ValidationError(format!(
            "control step '{}' must not carry role/agentId",
            step.id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use studio_types::condition::Condition;

    fn task(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::task(id, "dev", "do something", deps)
    }

    fn conditional(id: &str, true_branch: Option<&str>, false_branch: Option<&str>) -> WorkflowStep {
        let mut step = WorkflowStep::task(id, "dev", "", &[]);
        step.step_type = StepType::Conditional;
        step.role = None;
        step.condition = Some(Condition::Legacy("true".to_string()));
        step.true_branch = true_branch.map(String::from);
        step.false_branch = false_branch.map(String::from);
        step
    }

    #[test]
    fn accepts_minimal_workflow() {
        assert!(validate_workflow(&[task("a", &[]), task("b", &["a"])]).is_ok());
    }

    #[test]
    fn rejects_empty_workflow() {
        let err = validate_workflow(&[]).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = validate_workflow(&[task("a", &[]), task("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn rejects_bad_id_characters() {
        let err = validate_workflow(&[task("has space", &[])]).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn rejects_cycles_and_dangling_deps() {
        let err = validate_workflow(&[task("a", &["b"]), task("b", &["a"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));

        let err = validate_workflow(&[task("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    #[test]
    fn rejects_task_with_both_bindings() {
        let mut step = task("a", &[]);
        step.agent_id = Some("agent-1".to_string());
        let err = validate_workflow(&[step]).unwrap_err();
        assert!(err.to_string().contains("exactly one of role/agentId"));
    }

    #[test]
    fn rejects_task_with_no_binding() {
        let mut step = task("a", &[]);
        step.role = None;
        let err = validate_workflow(&[step]).unwrap_err();
        assert!(err.to_string().contains("must set one of role/agentId"));
    }

    #[test]
    fn mock_step_may_run_unbound() {
        let mut step = task("a", &[]);
        step.step_type = StepType::Mock;
        step.role = None;
        assert!(validate_workflow(&[step]).is_ok());
    }

    #[test]
    fn rejects_control_step_with_agent_binding() {
        let mut step = conditional("cond", Some("a"), None);
        step.role = Some("dev".to_string());
        let err = validate_workflow(&[task("a", &[]), step]).unwrap_err();
        assert!(err.to_string().contains("must not carry role/agentId"));
    }

    #[test]
    fn rejects_conditional_without_condition_or_branches() {
        let mut step = conditional("cond", Some("a"), None);
        step.condition = None;
        let err = validate_workflow(&[task("a", &[]), step]).unwrap_err();
        assert!(err.to_string().contains("no condition"));

        let step = conditional("cond", None, None);
        let err = validate_workflow(&[task("a", &[]), step]).unwrap_err();
        assert!(err.to_string().contains("no branches"));
    }

    #[test]
    fn rejects_dangling_branch_reference() {
        let step = conditional("cond", Some("ghost"), None);
        let err = validate_workflow(&[task("a", &[]), step]).unwrap_err();
        assert!(err.to_string().contains("references unknown step 'ghost'"));
    }

    #[test]
    fn rejects_parallel_with_dangling_or_empty_refs() {
        let mut step = task("par", &[]);
        step.step_type = StepType::Parallel;
        step.role = None;
        let err = validate_workflow(&[step.clone()]).unwrap_err();
        assert!(err.to_string().contains("references no steps"));

        step.parallel_steps = vec!["ghost".to_string()];
        let err = validate_workflow(&[step]).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn loop_validation() {
        let mut lp = task("lp", &[]);
        lp.step_type = StepType::Loop;
        lp.role = None;
        lp.loop_type = Some(LoopType::Retry);
        lp.loop_steps = vec!["body".to_string()];
        lp.max_iterations = Some(3);
        assert!(validate_workflow(&[task("body", &[]), lp.clone()]).is_ok());

        lp.max_iterations = Some(0);
        let err = validate_workflow(&[task("body", &[]), lp.clone()]).unwrap_err();
        assert!(err.to_string().contains("maxIterations must be >= 1"));

        lp.max_iterations = None;
        let err = validate_workflow(&[task("body", &[]), lp.clone()]).unwrap_err();
        assert!(err.to_string().contains("requires maxIterations"));

        lp.loop_type = Some(LoopType::While);
        lp.max_iterations = Some(5);
        let err = validate_workflow(&[task("body", &[]), lp.clone()]).unwrap_err();
        assert!(err.to_string().contains("no loopCondition"));

        lp.loop_condition = Some(Condition::Legacy("true".to_string()));
        assert!(validate_workflow(&[task("body", &[]), lp]).is_ok());
    }

    #[test]
    fn rejects_human_step_inside_parallel_body() {
        let mut human = task("review", &[]);
        human.step_type = StepType::Human;
        human.role = None;
        human.prompt = Some("Approve?".to_string());

        let mut par = task("par", &[]);
        par.step_type = StepType::Parallel;
        par.role = None;
        par.parallel_steps = vec!["review".to_string()];

        let err = validate_workflow(&[human, par]).unwrap_err();
        assert!(err.to_string().contains("cannot run inside parallel or loop"));
    }

    #[test]
    fn human_step_validation() {
        let mut human = task("review", &[]);
        human.step_type = StepType::Human;
        human.role = None;
        let err = validate_workflow(&[human.clone()]).unwrap_err();
        assert!(err.to_string().contains("no prompt"));

        human.prompt = Some("Approve?".to_string());
        human.timeout_seconds = Some(30);
        let err = validate_workflow(&[human.clone()]).unwrap_err();
        assert!(err.to_string().contains("[60, 86400]"));

        human.timeout_seconds = Some(600);
        assert!(validate_workflow(&[human]).is_ok());
    }
}
