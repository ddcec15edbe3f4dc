//! In-process event bus.
//!
//! Multi-producer, multi-consumer, keyed by task id with a reserved global
//! subject `*`. Delivery is best-effort over per-subscriber bounded
//! channels: a slow subscriber misses that broadcast instead of blocking
//! the producer. Subscribing to `*` replays the current session metrics
//! snapshot immediately, and a ticker re-emits `session_update` at a fixed
//! cadence while any task is running.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use orc_core::id::TaskId;

/// The reserved subject that receives every event.
pub const GLOBAL_SUBJECT: &str = "*";

/// Per-subscriber buffer size. A subscriber this far behind starts missing
/// broadcasts.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// Cadence of `session_update` re-emission while tasks are running.
pub const SESSION_TICK: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// Wire envelope: `{ type: 'event', event, task_id, time, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub task_id: Option<String>,
    pub time: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event: impl Into<String>, task_id: Option<&TaskId>, data: serde_json::Value) -> Self {
        Self {
            kind: "event".into(),
            event: event.into(),
            task_id: task_id.map(|id| id.to_string()),
            time: Utc::now(),
            data,
        }
    }

    pub fn for_task(event: impl Into<String>, task_id: &TaskId, data: serde_json::Value) -> Self {
        Self::new(event, Some(task_id), data)
    }

    pub fn global(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(event, None, data)
    }
}

// ---------------------------------------------------------------------------
// Session metrics
// ---------------------------------------------------------------------------

/// Aggregated metrics carried by `session_update` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub duration_seconds: u64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub tasks_running: u32,
    pub is_paused: bool,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct BusInner {
    subscribers: DashMap<String, Vec<flume::Sender<Event>>>,
    metrics: RwLock<SessionMetrics>,
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                metrics: RwLock::new(SessionMetrics::default()),
            }),
        }
    }

    /// Subscribe to one task's events, or to everything via [`GLOBAL_SUBJECT`].
    ///
    /// A global subscriber immediately receives the current session metrics
    /// snapshot.
    pub fn subscribe(&self, subject: &str) -> flume::Receiver<Event> {
        let (tx, rx) = flume::bounded(SUBSCRIBER_BUFFER);

        if subject == GLOBAL_SUBJECT {
            let snapshot = self.metrics();
            let _ = tx.try_send(Event::global(
                "session_update",
                serde_json::to_value(&snapshot).expect("metrics serialize"),
            ));
        }

        self.inner
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish to the event's task subject and to `*`. Full buffers drop the
    /// event for that subscriber only; disconnected subscribers are pruned.
    pub fn publish(&self, event: Event) {
        if let Some(task_id) = &event.task_id {
            self.fan_out(task_id.as_str(), &event);
        }
        self.fan_out(GLOBAL_SUBJECT, &event);
    }

    fn fan_out(&self, subject: &str, event: &Event) {
        if let Some(mut senders) = self.inner.subscribers.get_mut(subject) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    tracing::debug!(subject = %subject, event = %event.event, "subscriber behind; dropping broadcast");
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            });
        }
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subscribers
            .get(subject)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Session metrics
    // -----------------------------------------------------------------------

    pub fn metrics(&self) -> SessionMetrics {
        self.inner.metrics.read().expect("metrics lock").clone()
    }

    /// Mutate the session metrics snapshot without emitting.
    pub fn update_metrics(&self, f: impl FnOnce(&mut SessionMetrics)) {
        let mut metrics = self.inner.metrics.write().expect("metrics lock");
        f(&mut metrics);
    }

    /// Emit a `session_update` with the current snapshot.
    pub fn emit_session_update(&self) {
        let snapshot = self.metrics();
        self.publish(Event::global(
            "session_update",
            serde_json::to_value(&snapshot).expect("metrics serialize"),
        ));
    }

    /// Background ticker: re-emits `session_update` every [`SESSION_TICK`]
    /// while any task is running; quiet when idle.
    pub fn spawn_session_ticker(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if bus.metrics().tasks_running > 0 {
                    bus.emit_session_update();
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_subscriber_sees_only_its_task() {
        let bus = EventBus::new();
        let a = TaskId::new(1);
        let b = TaskId::new(2);
        let rx = bus.subscribe(&a.to_string());

        bus.publish(Event::for_task("phase_started", &a, serde_json::json!({"phase": "implement"})));
        bus.publish(Event::for_task("phase_started", &b, serde_json::json!({"phase": "test"})));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.task_id.as_deref(), Some("TASK-001"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn global_subscriber_sees_everything_and_gets_snapshot() {
        let bus = EventBus::new();
        bus.update_metrics(|m| m.tasks_running = 3);
        let rx = bus.subscribe(GLOBAL_SUBJECT);

        // Replayed snapshot first.
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.event, "session_update");
        assert_eq!(snapshot.data["tasks_running"], 3);

        bus.publish(Event::for_task(
            "task_started",
            &TaskId::new(1),
            serde_json::Value::Null,
        ));
        assert_eq!(rx.try_recv().unwrap().event, "task_started");
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(GLOBAL_SUBJECT);
        drop(rx);
        bus.publish(Event::global("session_update", serde_json::Value::Null));
        assert_eq!(bus.subscriber_count(GLOBAL_SUBJECT), 0);
    }

    #[test]
    fn slow_subscriber_misses_broadcasts_but_stays() {
        let bus = EventBus::new();
        let rx = bus.subscribe("TASK-001");
        let id = TaskId::new(1);

        for _ in 0..(SUBSCRIBER_BUFFER + 50) {
            bus.publish(Event::for_task("iteration_tick", &id, serde_json::Value::Null));
        }

        // Buffer capped; subscriber still registered.
        assert_eq!(rx.len(), SUBSCRIBER_BUFFER);
        assert_eq!(bus.subscriber_count("TASK-001"), 1);
    }

    #[test]
    fn envelope_shape() {
        let event = Event::for_task(
            "decision_required",
            &TaskId::new(5),
            serde_json::json!({"decision_id": "d-1"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "decision_required");
        assert_eq!(json["task_id"], "TASK-005");
        assert!(json["time"].is_string());
        assert_eq!(json["data"]["decision_id"], "d-1");
    }

    #[tokio::test]
    async fn ticker_emits_only_while_running() {
        tokio::time::pause();
        let bus = EventBus::new();
        let rx = bus.subscribe(GLOBAL_SUBJECT);
        let _ = rx.try_recv(); // drain snapshot

        let ticker = bus.spawn_session_ticker();
        tokio::time::advance(SESSION_TICK + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "idle bus must stay quiet");

        bus.update_metrics(|m| m.tasks_running = 1);
        tokio::time::advance(SESSION_TICK).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap().event, "session_update");

        ticker.abort();
    }
}
