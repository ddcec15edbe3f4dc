//! The orc task execution engine.
//!
//! One [`executor::TaskExecutor`] per project drives tasks through their
//! plans: worktree isolation, agent iterations with checkpointing, quality
//! checks and gates, suspension and crash recovery, and the finalize flow
//! that hands the branch to the hosting platform. State is persisted to
//! the embedded store before any event reaches subscribers.

pub mod decisions;
pub mod executor;
pub mod finalize;
pub mod paths;
pub mod prompts;
pub mod recorder;
pub mod recovery;

pub use decisions::{DecisionOutcome, DecisionRegistry, DecisionResolution, PendingDecision};
pub use executor::{EngineError, FailureInfo, RunOptions, TaskExecutor, TaskReport};
pub use finalize::FinalizeOutcome;
pub use paths::ProjectLayout;
pub use recorder::CostRecorder;
pub use recovery::{RecoveryPolicy, RecoveryReport};
