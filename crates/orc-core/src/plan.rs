use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::GateType;

// ---------------------------------------------------------------------------
// Completion criteria
// ---------------------------------------------------------------------------

/// How a phase declares that its iterations are done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CompletionCriterion {
    /// A marker string the agent emits when it considers the phase done.
    Marker { marker: String },
    /// A file that must exist in the worktree.
    ArtifactExists { path: String },
    /// The agent's final message must be non-empty.
    NonEmptyOutput,
}

// ---------------------------------------------------------------------------
// Quality checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CheckKind {
    /// A named command resolved from the project commands registry
    /// (tests, lint, build, typecheck, ...).
    Code { name: String },
    /// An explicit shell command string.
    Custom { command: String },
}

/// What a failing check means for the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCheckFailure {
    /// Reject the completion; failure context is injected into the next
    /// iteration's prompt.
    #[default]
    Block,
    /// Record the failure but accept the completion.
    Warn,
    /// Ignore entirely.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckSpec {
    #[serde(flatten)]
    pub kind: CheckKind,
    #[serde(default)]
    pub on_failure: OnCheckFailure,
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Which prior outputs and task fields a gate sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateInputConfig {
    /// Phase ids whose final outputs are included in the gate input.
    #[serde(default)]
    pub include_phases: Vec<String>,
    /// Task fields (by name) included in the gate input.
    #[serde(default)]
    pub include_task_fields: Vec<String>,
}

/// Per-outcome action taken after a gate resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum GateAction {
    Continue,
    Retry { retry_from: String },
    Fail,
    SkipPhase,
    RunScript { command: String },
}

impl Default for GateAction {
    fn default() -> Self {
        GateAction::Continue
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutputConfig {
    /// Workflow variable set to the gate outcome, if any.
    pub set_variable: Option<String>,
    #[serde(default)]
    pub on_approved: GateAction,
    #[serde(default = "default_rejected_action")]
    pub on_rejected: GateAction,
}

fn default_rejected_action() -> GateAction {
    GateAction::Fail
}

/// Deterministic predicates available to `auto` gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "predicate")]
pub enum AutoPredicate {
    NonEmpty,
    NoError,
    CompletionMarker { marker: String },
    Contains { needle: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub gate_type: GateType,
    /// Predicates evaluated for `auto` gates; all must pass.
    #[serde(default)]
    pub predicates: Vec<AutoPredicate>,
    /// Rubric handed to the agent for `ai` gates.
    pub rubric: Option<String>,
    #[serde(default)]
    pub input: GateInputConfig,
    #[serde(default)]
    pub output: GateOutputConfig,
}

impl GateSpec {
    pub fn auto() -> Self {
        Self {
            gate_type: GateType::Auto,
            predicates: vec![AutoPredicate::NonEmpty, AutoPredicate::NoError],
            rubric: None,
            input: GateInputConfig::default(),
            output: GateOutputConfig::default(),
        }
    }

    pub fn skip() -> Self {
        Self {
            gate_type: GateType::Skip,
            predicates: Vec::new(),
            rubric: None,
            input: GateInputConfig::default(),
            output: GateOutputConfig::default(),
        }
    }

    pub fn human() -> Self {
        Self {
            gate_type: GateType::Human,
            predicates: Vec::new(),
            rubric: None,
            input: GateInputConfig::default(),
            output: GateOutputConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a trigger participates in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Blocking; the outcome matters.
    Gate,
    /// Fire-and-forget; failures are logged, never fatal.
    Reaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    OnTaskCreated,
    OnTaskCompleted,
    OnTaskFailed,
    OnInitiativePlanned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    pub mode: TriggerMode,
    /// Shell command run when the trigger fires.
    pub command: String,
}

// ---------------------------------------------------------------------------
// PhaseSpec / Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase id, unique within the plan (research, spec, implement, ...).
    pub id: String,
    /// Prompt template this phase is built from.
    pub template_id: String,
    pub gate: GateSpec,
    pub max_iterations: u32,
    /// Per-phase timeout in seconds.
    pub timeout_secs: u64,
    #[serde(default)]
    pub completion_criteria: Vec<CompletionCriterion>,
    #[serde(default)]
    pub quality_checks: Vec<QualityCheckSpec>,
    #[serde(default)]
    pub before_triggers: Vec<TriggerSpec>,
    /// Artifact that, when already present, lets the phase be skipped.
    pub artifact: Option<String>,
}

impl PhaseSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            template_id: id.clone(),
            id,
            gate: GateSpec::auto(),
            max_iterations: 3,
            timeout_secs: 1_800,
            completion_criteria: vec![CompletionCriterion::NonEmptyOutput],
            quality_checks: Vec::new(),
            before_triggers: Vec::new(),
            artifact: None,
        }
    }
}

/// The ordered phase sequence for a task.
///
/// Immutable after task start; an explicit re-plan replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub phases: Vec<PhaseSpec>,
    /// Cross-phase retry routing: failed phase -> phase to resume from.
    #[serde(default)]
    pub retry_routes: HashMap<String, String>,
    /// Cap on retry-route applications before the task fails.
    pub max_retries: u32,
}

impl Plan {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self {
            phases,
            retry_routes: HashMap::new(),
            max_retries: 2,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Every retry route must point at a phase that exists and precedes the
    /// failing phase.
    pub fn validate(&self) -> Result<(), PlanError> {
        for (from, to) in &self.retry_routes {
            let from_idx = self
                .phase_index(from)
                .ok_or_else(|| PlanError::UnknownPhase(from.clone()))?;
            let to_idx = self
                .phase_index(to)
                .ok_or_else(|| PlanError::UnknownPhase(to.clone()))?;
            if to_idx > from_idx {
                return Err(PlanError::ForwardRetryRoute {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan references unknown phase: {0}")]
    UnknownPhase(String),

    #[error("retry route {from} -> {to} points forward in the plan")]
    ForwardRetryRoute { from: String, to: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_routes(routes: &[(&str, &str)]) -> Plan {
        let mut plan = Plan::new(vec![
            PhaseSpec::new("implement"),
            PhaseSpec::new("test"),
            PhaseSpec::new("validate"),
        ]);
        for (from, to) in routes {
            plan.retry_routes
                .insert((*from).to_string(), (*to).to_string());
        }
        plan
    }

    #[test]
    fn validate_accepts_backward_route() {
        let plan = plan_with_routes(&[("test", "implement")]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_phase() {
        let plan = plan_with_routes(&[("test", "design")]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::UnknownPhase(p)) if p == "design"
        ));
    }

    #[test]
    fn validate_rejects_forward_route() {
        let plan = plan_with_routes(&[("implement", "validate")]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::ForwardRetryRoute { .. })
        ));
    }

    #[test]
    fn gate_spec_defaults() {
        let gate = GateSpec::auto();
        assert_eq!(gate.gate_type, GateType::Auto);
        assert_eq!(gate.output.on_approved, GateAction::Continue);
        assert_eq!(gate.output.on_rejected, GateAction::Fail);
    }

    #[test]
    fn phase_spec_serde_roundtrip() {
        let spec = PhaseSpec {
            quality_checks: vec![QualityCheckSpec {
                kind: CheckKind::Code {
                    name: "tests".into(),
                },
                on_failure: OnCheckFailure::Block,
            }],
            ..PhaseSpec::new("test")
        };
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: PhaseSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, spec);
    }
}
