use async_trait::async_trait;

use orc_core::plan::{AutoPredicate, GateAction, GateSpec};
use orc_core::types::{GateOutcome, GateType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("ai gate requires a delegate agent")]
    NoAgent,

    #[error("ai gate delegate failed: {0}")]
    Agent(String),
}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// What the evaluator sees of a finished phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome<'a> {
    pub output: &'a str,
    pub error: Option<&'a str>,
    /// Extra context assembled per the gate's input config (prior phase
    /// outputs, task fields).
    pub context: String,
}

/// The evaluator's verdict. Human involvement is surfaced as a state, not
/// performed here: the evaluator produces and receives decisions but never
/// blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvaluation {
    Approved { action: GateAction },
    Rejected { action: GateAction, rationale: Option<String> },
    /// A human decision is required (human gate, or an ai gate that answered
    /// NEEDS_CLARIFICATION and was promoted).
    NeedsHuman { questions: Vec<String> },
}

/// Delegate used by `ai` gates: hands the rubric and input to the agent and
/// returns its raw verdict text.
#[async_trait]
pub trait GateAgent: Send + Sync {
    async fn evaluate(&self, rubric: &str, input: &str) -> Result<String, String>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub async fn evaluate_gate(
    spec: &GateSpec,
    outcome: &PhaseOutcome<'_>,
    agent: Option<&dyn GateAgent>,
) -> Result<GateEvaluation, GateError> {
    match spec.gate_type {
        GateType::Skip => Ok(GateEvaluation::Approved {
            action: spec.output.on_approved.clone(),
        }),

        GateType::Auto => {
            for predicate in &spec.predicates {
                if let Some(reason) = check_predicate(predicate, outcome) {
                    return Ok(GateEvaluation::Rejected {
                        action: spec.output.on_rejected.clone(),
                        rationale: Some(reason),
                    });
                }
            }
            Ok(GateEvaluation::Approved {
                action: spec.output.on_approved.clone(),
            })
        }

        GateType::Human => Ok(GateEvaluation::NeedsHuman {
            questions: Vec::new(),
        }),

        GateType::Ai => {
            let agent = agent.ok_or(GateError::NoAgent)?;
            let rubric = spec.rubric.as_deref().unwrap_or("Reply APPROVED or REJECTED.");
            let input = format!("{}\n\n{}", outcome.context, outcome.output);
            let verdict_text = agent
                .evaluate(rubric, &input)
                .await
                .map_err(GateError::Agent)?;

            let (verdict, questions) = parse_ai_verdict(&verdict_text);
            Ok(match verdict {
                GateOutcome::Approved => GateEvaluation::Approved {
                    action: spec.output.on_approved.clone(),
                },
                GateOutcome::NeedsClarification => GateEvaluation::NeedsHuman { questions },
                _ => GateEvaluation::Rejected {
                    action: spec.output.on_rejected.clone(),
                    rationale: Some(verdict_text),
                },
            })
        }
    }
}

/// `None` when the predicate holds; the failure reason otherwise.
fn check_predicate(predicate: &AutoPredicate, outcome: &PhaseOutcome<'_>) -> Option<String> {
    match predicate {
        AutoPredicate::NonEmpty => outcome
            .output
            .trim()
            .is_empty()
            .then(|| "phase produced no output".to_string()),
        AutoPredicate::NoError => outcome
            .error
            .map(|e| format!("phase recorded an error: {e}")),
        AutoPredicate::CompletionMarker { marker } => {
            (!outcome.output.contains(marker))
                .then(|| format!("completion marker '{marker}' not found"))
        }
        AutoPredicate::Contains { needle } => (!outcome.output.contains(needle))
            .then(|| format!("expected output to contain '{needle}'")),
    }
}

/// Parse an ai gate's free-text verdict.
///
/// NEEDS_CLARIFICATION wins over the other keywords; question lines are the
/// bulleted or question-marked lines after the keyword (free text, no
/// structured schema).
pub fn parse_ai_verdict(text: &str) -> (GateOutcome, Vec<String>) {
    if let Some(idx) = text.find("NEEDS_CLARIFICATION") {
        let questions = text[idx..]
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|l| l.starts_with('-') || l.starts_with('*') || l.ends_with('?'))
            .map(|l| l.trim_start_matches(['-', '*', ' ']).to_string())
            .filter(|l| !l.is_empty())
            .collect();
        return (GateOutcome::NeedsClarification, questions);
    }
    if text.contains("APPROVED") {
        return (GateOutcome::Approved, Vec::new());
    }
    if text.contains("REJECTED") {
        return (GateOutcome::Rejected, Vec::new());
    }
    // An unparseable verdict is a rejection, not an approval.
    (GateOutcome::Rejected, Vec::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::plan::GateOutputConfig;

    struct CannedAgent(String);

    #[async_trait]
    impl GateAgent for CannedAgent {
        async fn evaluate(&self, _rubric: &str, _input: &str) -> Result<String, String> {
            Ok(self.0.clone())
        }
    }

    fn outcome(output: &str) -> PhaseOutcome<'_> {
        PhaseOutcome {
            output,
            error: None,
            context: String::new(),
        }
    }

    #[tokio::test]
    async fn auto_gate_approves_clean_output() {
        let spec = GateSpec::auto();
        let eval = evaluate_gate(&spec, &outcome("did the work"), None)
            .await
            .unwrap();
        assert_eq!(
            eval,
            GateEvaluation::Approved {
                action: GateAction::Continue
            }
        );
    }

    #[tokio::test]
    async fn auto_gate_rejects_empty_output() {
        let spec = GateSpec::auto();
        let eval = evaluate_gate(&spec, &outcome("   "), None).await.unwrap();
        assert!(matches!(eval, GateEvaluation::Rejected { .. }));
    }

    #[tokio::test]
    async fn auto_gate_rejects_recorded_error() {
        let spec = GateSpec::auto();
        let out = PhaseOutcome {
            output: "some output",
            error: Some("boom"),
            context: String::new(),
        };
        let eval = evaluate_gate(&spec, &out, None).await.unwrap();
        match eval {
            GateEvaluation::Rejected { rationale, .. } => {
                assert!(rationale.unwrap().contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_gate_checks_marker() {
        let spec = GateSpec {
            predicates: vec![AutoPredicate::CompletionMarker {
                marker: "PHASE_COMPLETE".into(),
            }],
            ..GateSpec::auto()
        };
        let ok = evaluate_gate(&spec, &outcome("done. PHASE_COMPLETE"), None)
            .await
            .unwrap();
        assert!(matches!(ok, GateEvaluation::Approved { .. }));

        let missing = evaluate_gate(&spec, &outcome("done."), None).await.unwrap();
        assert!(matches!(missing, GateEvaluation::Rejected { .. }));
    }

    #[tokio::test]
    async fn human_gate_needs_human() {
        let spec = GateSpec::human();
        let eval = evaluate_gate(&spec, &outcome("whatever"), None).await.unwrap();
        assert_eq!(eval, GateEvaluation::NeedsHuman { questions: vec![] });
    }

    #[tokio::test]
    async fn ai_gate_approval_and_rejection() {
        let spec = GateSpec {
            gate_type: GateType::Ai,
            rubric: Some("judge".into()),
            ..GateSpec::auto()
        };

        let approve = CannedAgent("APPROVED — looks solid".into());
        let eval = evaluate_gate(&spec, &outcome("work"), Some(&approve))
            .await
            .unwrap();
        assert!(matches!(eval, GateEvaluation::Approved { .. }));

        let reject = CannedAgent("REJECTED: tests are missing".into());
        let eval = evaluate_gate(&spec, &outcome("work"), Some(&reject))
            .await
            .unwrap();
        match eval {
            GateEvaluation::Rejected { rationale, .. } => {
                assert!(rationale.unwrap().contains("tests are missing"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ai_clarification_promotes_to_human() {
        let spec = GateSpec {
            gate_type: GateType::Ai,
            rubric: Some("judge".into()),
            ..GateSpec::auto()
        };
        let agent = CannedAgent(
            "NEEDS_CLARIFICATION\n- which database should be used?\n- is downtime acceptable?"
                .into(),
        );
        let eval = evaluate_gate(&spec, &outcome("work"), Some(&agent))
            .await
            .unwrap();
        match eval {
            GateEvaluation::NeedsHuman { questions } => {
                assert_eq!(questions.len(), 2);
                assert!(questions[0].contains("database"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ai_gate_without_agent_errors() {
        let spec = GateSpec {
            gate_type: GateType::Ai,
            ..GateSpec::auto()
        };
        assert!(matches!(
            evaluate_gate(&spec, &outcome("x"), None).await,
            Err(GateError::NoAgent)
        ));
    }

    #[test]
    fn verdict_parsing_priorities() {
        assert_eq!(parse_ai_verdict("APPROVED").0, GateOutcome::Approved);
        assert_eq!(parse_ai_verdict("REJECTED: no").0, GateOutcome::Rejected);
        // Clarification wins even when other keywords appear in the text.
        let (verdict, _) =
            parse_ai_verdict("NEEDS_CLARIFICATION (would otherwise be REJECTED)\n- why?");
        assert_eq!(verdict, GateOutcome::NeedsClarification);
        // Unparseable output is never an approval.
        assert_eq!(parse_ai_verdict("shrug").0, GateOutcome::Rejected);
    }

    #[tokio::test]
    async fn rejected_action_follows_output_config() {
        let spec = GateSpec {
            output: GateOutputConfig {
                on_rejected: GateAction::Retry {
                    retry_from: "implement".into(),
                },
                ..GateOutputConfig::default()
            },
            ..GateSpec::auto()
        };
        let eval = evaluate_gate(&spec, &outcome(""), None).await.unwrap();
        match eval {
            GateEvaluation::Rejected { action, .. } => {
                assert_eq!(
                    action,
                    GateAction::Retry {
                        retry_from: "implement".into()
                    }
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
