use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use orc_core::config::EffectiveConfig;
use orc_core::plan::{
    CheckKind, CompletionCriterion, GateSpec, OnCheckFailure, PhaseSpec, Plan, QualityCheckSpec,
};
use orc_core::types::{GateType, TaskWeight};

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// A recorded decision to skip a phase because its artifact already exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipDecision {
    pub phase: String,
    pub artifact: String,
    pub rationale: String,
}

pub struct Planner;

impl Planner {
    /// Ordered phase ids for a weight. Heavier tasks get the longer
    /// pipeline; finalize is the terminal flow after the last phase, not a
    /// phase of its own.
    pub fn phases_for_weight(weight: TaskWeight) -> &'static [&'static str] {
        match weight {
            TaskWeight::Trivial => &["implement"],
            TaskWeight::Small => &["implement", "test"],
            TaskWeight::Medium => &["spec", "implement", "test"],
            TaskWeight::Large => &["research", "spec", "implement", "test", "validate"],
            TaskWeight::Greenfield => &["research", "spec", "implement", "test", "validate"],
        }
    }

    /// Artifact produced by a phase, when it has one. Paths are relative to
    /// the task directory.
    fn artifact_for(phase: &str) -> Option<&'static str> {
        match phase {
            "research" => Some("research.md"),
            "spec" => Some("spec.md"),
            _ => None,
        }
    }

    /// Build the plan for a task from its weight and the resolved config.
    pub fn build_plan(weight: TaskWeight, config: &EffectiveConfig) -> Plan {
        let phase_ids = Self::phases_for_weight(weight);

        let phases = phase_ids
            .iter()
            .map(|&id| {
                let gate_type = config
                    .gates
                    .overrides
                    .get(id)
                    .copied()
                    .unwrap_or(config.gates.default);

                let mut gate = match gate_type {
                    GateType::Auto => GateSpec::auto(),
                    GateType::Human => GateSpec::human(),
                    GateType::Skip => GateSpec::skip(),
                    GateType::Ai => GateSpec {
                        gate_type: GateType::Ai,
                        rubric: Some(default_rubric(id)),
                        ..GateSpec::auto()
                    },
                };
                // Phase completion markers come from config.
                if gate.gate_type == GateType::Auto {
                    for marker in &config.completion.markers {
                        gate.predicates.push(
                            orc_core::plan::AutoPredicate::CompletionMarker {
                                marker: marker.clone(),
                            },
                        );
                    }
                }

                // Configured markers are the completion signal; only a
                // project with no markers falls back to any-output.
                let completion_criteria = if config.completion.markers.is_empty() {
                    vec![CompletionCriterion::NonEmptyOutput]
                } else {
                    config
                        .completion
                        .markers
                        .iter()
                        .map(|m| CompletionCriterion::Marker { marker: m.clone() })
                        .collect()
                };

                let mut spec = PhaseSpec {
                    gate,
                    timeout_secs: config.timeouts.phase_secs,
                    completion_criteria,
                    artifact: Self::artifact_for(id).map(String::from),
                    ..PhaseSpec::new(id)
                };

                // Test-flavoured phases run the project's registered checks.
                if matches!(id, "test" | "validate") {
                    for name in ["tests", "lint", "build", "typecheck"] {
                        if config.commands.contains_key(name) {
                            spec.quality_checks.push(QualityCheckSpec {
                                kind: CheckKind::Code { name: name.into() },
                                on_failure: OnCheckFailure::Block,
                            });
                        }
                    }
                }
                spec
            })
            .collect();

        let mut plan = Plan::new(phases);
        plan.max_retries = config.retry.max_retries;

        // Failures in verification phases route back to implementation.
        for (from, to) in [("test", "implement"), ("validate", "implement")] {
            if plan.phase(from).is_some() && plan.phase(to).is_some() {
                plan.retry_routes.insert(from.into(), to.into());
            }
        }
        plan
    }

    /// Whether a phase can be skipped because its artifact already exists.
    pub fn evaluate_skip(
        spec: &PhaseSpec,
        task_dir: &Path,
        artifact_skip_enabled: bool,
    ) -> Option<SkipDecision> {
        if !artifact_skip_enabled {
            return None;
        }
        let artifact = spec.artifact.as_deref()?;
        let path = task_dir.join(artifact);
        if path.exists() {
            info!(phase = %spec.id, artifact = %artifact, "artifact present; skipping phase");
            Some(SkipDecision {
                phase: spec.id.clone(),
                artifact: artifact.to_string(),
                rationale: format!("artifact {artifact} already exists"),
            })
        } else {
            None
        }
    }
}

fn default_rubric(phase: &str) -> String {
    format!(
        "Review the output of the '{phase}' phase. Reply APPROVED if it \
         fully satisfies the task requirements, REJECTED with reasons if it \
         does not, or NEEDS_CLARIFICATION followed by your questions if the \
         requirements are ambiguous."
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::config::EffectiveConfig;

    #[test]
    fn weights_map_to_pipelines() {
        assert_eq!(Planner::phases_for_weight(TaskWeight::Trivial), &["implement"]);
        assert_eq!(
            Planner::phases_for_weight(TaskWeight::Small),
            &["implement", "test"]
        );
        assert_eq!(
            Planner::phases_for_weight(TaskWeight::Large),
            &["research", "spec", "implement", "test", "validate"]
        );
    }

    #[test]
    fn plan_wires_retry_routes_and_validates() {
        let config = EffectiveConfig::default();
        let plan = Planner::build_plan(TaskWeight::Small, &config);
        assert_eq!(plan.retry_routes["test"], "implement");
        assert!(plan.validate().is_ok());
        assert_eq!(plan.max_retries, config.retry.max_retries);
    }

    #[test]
    fn trivial_plan_has_no_routes() {
        let plan = Planner::build_plan(TaskWeight::Trivial, &EffectiveConfig::default());
        assert!(plan.retry_routes.is_empty());
        assert_eq!(plan.phases.len(), 1);
    }

    #[test]
    fn gate_overrides_apply_per_phase() {
        let mut config = EffectiveConfig::default();
        config
            .gates
            .overrides
            .insert("test".into(), GateType::Human);
        let plan = Planner::build_plan(TaskWeight::Small, &config);
        assert_eq!(plan.phase("implement").unwrap().gate.gate_type, GateType::Auto);
        assert_eq!(plan.phase("test").unwrap().gate.gate_type, GateType::Human);
    }

    #[test]
    fn registered_commands_become_checks() {
        let mut config = EffectiveConfig::default();
        config.commands.insert("tests".into(), "cargo test".into());
        config.commands.insert("lint".into(), "cargo clippy".into());
        let plan = Planner::build_plan(TaskWeight::Small, &config);

        let test_phase = plan.phase("test").unwrap();
        assert_eq!(test_phase.quality_checks.len(), 2);
        assert!(plan.phase("implement").unwrap().quality_checks.is_empty());
    }

    #[test]
    fn artifact_skip_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PhaseSpec {
            artifact: Some("spec.md".into()),
            ..PhaseSpec::new("spec")
        };

        assert!(Planner::evaluate_skip(&spec, dir.path(), true).is_none());

        std::fs::write(dir.path().join("spec.md"), "# spec").unwrap();
        let decision = Planner::evaluate_skip(&spec, dir.path(), true).unwrap();
        assert_eq!(decision.phase, "spec");

        // Disabled skip never fires.
        assert!(Planner::evaluate_skip(&spec, dir.path(), false).is_none());
    }
}
