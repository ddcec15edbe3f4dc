//! Per-turn cost recording and budget surveillance.
//!
//! Every agent turn lands in the cost log (with its per-day aggregate) and
//! updates the session metrics. Crossing the budget alert threshold or the
//! limit publishes an event; execution is never blocked on budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use orc_agent::UsageSample;
use orc_core::id::TaskId;
use orc_core::types::CostEntry;
use orc_events::{Event, EventBus};
use orc_store::{Store, StoreError};

pub struct CostRecorder {
    store: Arc<Store>,
    bus: EventBus,
    alerted: AtomicBool,
    overran: AtomicBool,
}

impl CostRecorder {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            alerted: AtomicBool::new(false),
            overran: AtomicBool::new(false),
        }
    }

    /// Record one turn: append the cost entry, refresh session metrics,
    /// publish a token update, and surface budget status changes.
    pub async fn record_turn(
        &self,
        project_id: &str,
        task_id: &TaskId,
        phase: &str,
        model: &str,
        iteration: u32,
        sample: &UsageSample,
    ) -> Result<CostEntry, StoreError> {
        let entry = CostEntry::from_usage(
            project_id,
            task_id.clone(),
            phase,
            model,
            iteration,
            sample.cost_usd,
            &sample.usage,
        );
        // Persist first; events follow persistence.
        self.store.record_cost(&entry).await?;

        self.bus.update_metrics(|m| {
            m.total_tokens += sample.usage.total();
            m.input_tokens += sample.usage.effective_input();
            m.output_tokens += sample.usage.output_tokens;
            m.estimated_cost_usd += sample.cost_usd;
        });

        self.bus.publish(Event::for_task(
            "token_update",
            task_id,
            serde_json::json!({
                "phase": phase,
                "iteration": iteration,
                "input_tokens": entry.input_tokens,
                "output_tokens": entry.output_tokens,
                "cache_creation_tokens": entry.cache_creation_tokens,
                "cache_read_tokens": entry.cache_read_tokens,
                "effective_input": entry.effective_input(),
                "total_tokens": entry.total_tokens,
                "cost_usd": entry.cost_usd,
            }),
        ));

        self.check_budget(project_id, task_id).await?;
        Ok(entry)
    }

    async fn check_budget(&self, project_id: &str, task_id: &TaskId) -> Result<(), StoreError> {
        let Some(status) = self.store.budget_status(project_id).await? else {
            return Ok(());
        };

        if status.over_budget && !self.overran.swap(true, Ordering::Relaxed) {
            warn!(project = %project_id, spent = status.spent_usd, limit = status.limit_usd, "monthly budget exceeded");
            self.bus.publish(Event::for_task(
                "budget_alert",
                task_id,
                serde_json::json!({
                    "kind": "over_budget",
                    "limit_usd": status.limit_usd,
                    "spent_usd": status.spent_usd,
                    "percent_used": status.percent_used,
                }),
            ));
        } else if status.at_alert && !self.alerted.swap(true, Ordering::Relaxed) {
            warn!(project = %project_id, percent = status.percent_used, "budget alert threshold crossed");
            self.bus.publish(Event::for_task(
                "budget_alert",
                task_id,
                serde_json::json!({
                    "kind": "at_alert_threshold",
                    "limit_usd": status.limit_usd,
                    "spent_usd": status.spent_usd,
                    "percent_used": status.percent_used,
                }),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::TokenUsage;
    use orc_events::GLOBAL_SUBJECT;

    fn sample(cost: f64) -> UsageSample {
        UsageSample {
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cache_creation_tokens: 100,
                cache_read_tokens: 1_000,
            },
            cost_usd: cost,
        }
    }

    #[tokio::test]
    async fn records_and_publishes_token_update() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bus = EventBus::new();
        let rx = bus.subscribe(GLOBAL_SUBJECT);
        let _ = rx.try_recv(); // snapshot

        let recorder = CostRecorder::new(store.clone(), bus.clone());
        let entry = recorder
            .record_turn("proj", &TaskId::new(1), "implement", "sonnet", 1, &sample(0.5))
            .await
            .unwrap();

        assert_eq!(entry.total_tokens, 1_115);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, "token_update");
        assert_eq!(event.data["effective_input"], 1_110);

        let metrics = bus.metrics();
        assert_eq!(metrics.total_tokens, 1_115);
        assert!((metrics.estimated_cost_usd - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_overrun_alerts_once_and_never_blocks() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.set_budget("proj", 20.0, 0.8).await.unwrap();
        let bus = EventBus::new();
        let rx = bus.subscribe(GLOBAL_SUBJECT);
        let _ = rx.try_recv();

        let recorder = CostRecorder::new(store.clone(), bus.clone());
        let id = TaskId::new(1);

        recorder
            .record_turn("proj", &id, "implement", "sonnet", 1, &sample(17.0))
            .await
            .unwrap();
        // token_update + at_alert
        let events: Vec<_> = rx.drain().collect();
        assert!(events.iter().any(|e| e.event == "budget_alert"
            && e.data["kind"] == "at_alert_threshold"));

        recorder
            .record_turn("proj", &id, "implement", "sonnet", 2, &sample(4.0))
            .await
            .unwrap();
        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| e.event == "budget_alert" && e.data["kind"] == "over_budget"));

        // Recording continues after overrun — never blocked.
        recorder
            .record_turn("proj", &id, "implement", "sonnet", 3, &sample(1.0))
            .await
            .unwrap();
        let events: Vec<_> = rx.drain().collect();
        // No duplicate over_budget alert.
        assert!(events.iter().all(|e| e.event != "budget_alert"));
        assert!(events.iter().any(|e| e.event == "token_update"));
    }
}
