//! Plan computation, quality checks, gate evaluation, and workflow
//! triggers.
//!
//! The planner turns a task weight plus project configuration into an
//! ordered phase sequence with retry routing. After a phase's iterations
//! claim completion, quality checks run; then the phase's gate decides
//! whether to advance, retry an earlier phase, skip, or fail.

pub mod checks;
pub mod gates;
pub mod planner;
pub mod triggers;

pub use checks::{run_checks, CheckDisposition, CheckResult};
pub use gates::{evaluate_gate, parse_ai_verdict, GateAgent, GateError, GateEvaluation, PhaseOutcome};
pub use planner::{Planner, SkipDecision};
pub use triggers::{run_before_triggers, LifecycleTriggers, TriggerError};
