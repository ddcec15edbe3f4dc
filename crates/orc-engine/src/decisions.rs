//! Pending human decisions.
//!
//! Registered while a task is blocked on a human gate (or an ai gate that
//! asked for clarification). The registry is in-memory only: it lives as
//! long as the server process, and blocked tasks persist independently so a
//! decision can still be posted after a restart re-registers them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use orc_core::id::TaskId;
use orc_core::types::GateType;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("no pending decision with id {0}")]
    NotFound(String),

    #[error("decision {0} was already resolved")]
    AlreadyResolved(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub decision_id: String,
    pub task_id: TaskId,
    pub phase: String,
    pub gate_type: GateType,
    pub question: String,
    pub context: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approve,
    Reject,
    Clarify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResolution {
    pub outcome: DecisionOutcome,
    pub comment: Option<String>,
    pub clarification: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DecisionRegistry {
    pending: DashMap<String, (PendingDecision, oneshot::Sender<DecisionResolution>)>,
}

impl DecisionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending decision. The executor awaits the returned
    /// receiver; whoever posts the decision completes it.
    pub fn register(
        &self,
        task_id: TaskId,
        phase: impl Into<String>,
        gate_type: GateType,
        question: impl Into<String>,
        context: impl Into<String>,
    ) -> (PendingDecision, oneshot::Receiver<DecisionResolution>) {
        let decision = PendingDecision {
            decision_id: Uuid::new_v4().to_string(),
            task_id,
            phase: phase.into(),
            gate_type,
            question: question.into(),
            context: context.into(),
            requested_at: Utc::now(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(decision.decision_id.clone(), (decision.clone(), tx));
        (decision, rx)
    }

    /// Post a resolution for a pending decision.
    pub fn resolve(
        &self,
        decision_id: &str,
        resolution: DecisionResolution,
    ) -> Result<PendingDecision, DecisionError> {
        let (_, (decision, tx)) = self
            .pending
            .remove(decision_id)
            .ok_or_else(|| DecisionError::NotFound(decision_id.to_string()))?;
        tx.send(resolution)
            .map_err(|_| DecisionError::AlreadyResolved(decision_id.to_string()))?;
        Ok(decision)
    }

    pub fn list(&self) -> Vec<PendingDecision> {
        self.pending.iter().map(|e| e.value().0.clone()).collect()
    }

    /// Drop a pending decision without resolving it (task cancelled).
    pub fn withdraw(&self, decision_id: &str) {
        self.pending.remove(decision_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let registry = DecisionRegistry::new();
        let (decision, rx) = registry.register(
            TaskId::new(1),
            "merge",
            GateType::Human,
            "merge to main?",
            "",
        );
        assert_eq!(registry.list().len(), 1);

        registry
            .resolve(
                &decision.decision_id,
                DecisionResolution {
                    outcome: DecisionOutcome::Approve,
                    comment: Some("lgtm".into()),
                    clarification: None,
                },
            )
            .unwrap();

        let resolution = rx.await.unwrap();
        assert_eq!(resolution.outcome, DecisionOutcome::Approve);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = DecisionRegistry::new();
        let err = registry
            .resolve(
                "nope",
                DecisionResolution {
                    outcome: DecisionOutcome::Reject,
                    comment: None,
                    clarification: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecisionError::NotFound(_)));
    }

    #[tokio::test]
    async fn withdraw_cancels_silently() {
        let registry = DecisionRegistry::new();
        let (decision, rx) = registry.register(
            TaskId::new(2),
            "merge",
            GateType::Human,
            "q",
            "",
        );
        registry.withdraw(&decision.decision_id);
        assert!(rx.await.is_err());
        assert!(registry.list().is_empty());
    }
}
