use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TaskId;

// ---------------------------------------------------------------------------
// TaskWeight
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

impl std::fmt::Display for TaskWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskWeight::Trivial => "trivial",
            TaskWeight::Small => "small",
            TaskWeight::Medium => "medium",
            TaskWeight::Large => "large",
            TaskWeight::Greenfield => "greenfield",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Lifecycle:
    /// - Planned  -> Running
    /// - Running  -> Paused | Blocked | Completed | Failed | Cancelled
    /// - Paused   -> Running | Cancelled
    /// - Blocked  -> Planned | Running | Failed | Cancelled
    ///
    /// Completed / Failed / Cancelled are terminal.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Planned, TaskStatus::Running)
                | (TaskStatus::Planned, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Paused)
                | (TaskStatus::Running, TaskStatus::Blocked)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Paused, TaskStatus::Running)
                | (TaskStatus::Paused, TaskStatus::Cancelled)
                | (TaskStatus::Blocked, TaskStatus::Planned)
                | (TaskStatus::Blocked, TaskStatus::Running)
                | (TaskStatus::Blocked, TaskStatus::Failed)
                | (TaskStatus::Blocked, TaskStatus::Cancelled)
        )
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Queue / Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueue {
    #[default]
    Active,
    Backlog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub weight: TaskWeight,
    pub status: TaskStatus,
    /// The phase the executor is currently in; empty before first run.
    pub current_phase: Option<String>,
    pub branch: Option<String>,
    pub queue: TaskQueue,
    pub priority: TaskPriority,
    pub category: Option<String>,
    pub initiative_id: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
    #[serde(default)]
    pub related_to: Vec<TaskId>,
    #[serde(default)]
    pub requires_ui_testing: bool,
    pub testing_requirements: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        id: TaskId,
        project_id: impl Into<String>,
        title: impl Into<String>,
        weight: TaskWeight,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id: project_id.into(),
            title: title.into(),
            description: None,
            weight,
            status: TaskStatus::Planned,
            current_phase: None,
            branch: None,
            queue: TaskQueue::Active,
            priority: TaskPriority::Normal,
            category: None,
            initiative_id: None,
            blocked_by: Vec::new(),
            related_to: Vec::new(),
            requires_ui_testing: false,
            testing_requirements: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            metadata: None,
        }
    }

    /// Transition to a new status, enforcing the lifecycle table.
    pub fn set_status(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(&status) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("dependency cycle involving {0}")]
    DependencyCycle(TaskId),
}

/// Reject dependency cycles over `blocked_by` edges.
///
/// `edges` maps a task to the tasks it is blocked by. Returns the first task
/// found on a cycle, if any.
pub fn find_dependency_cycle(
    edges: &std::collections::HashMap<TaskId, Vec<TaskId>>,
) -> Option<TaskId> {
    use std::collections::HashSet;

    fn visit(
        node: &TaskId,
        edges: &std::collections::HashMap<TaskId, Vec<TaskId>>,
        visiting: &mut HashSet<TaskId>,
        done: &mut HashSet<TaskId>,
    ) -> Option<TaskId> {
        if done.contains(node) {
            return None;
        }
        if !visiting.insert(node.clone()) {
            return Some(node.clone());
        }
        for dep in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(dep, edges, visiting, done) {
                return Some(cycle);
            }
        }
        visiting.remove(node);
        done.insert(node.clone());
        None
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for node in edges.keys() {
        if let Some(cycle) = visit(node, edges, &mut visiting, &mut done) {
            return Some(cycle);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// PhaseStatus / PhaseState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

/// Per-phase execution record for a task.
///
/// Monotonic: once `Completed`, only an explicit retry mutates it again, and
/// a retry goes back through `Running` with a fresh iteration window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: String,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub iterations: u32,
    /// VCS commit id of the last checkpoint for this phase.
    pub last_checkpoint: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

impl PhaseState {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            iterations: 0,
            last_checkpoint: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            error: None,
            files_changed: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = PhaseStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = PhaseStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn skip(&mut self) {
        self.status = PhaseStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Reset for an explicit retry: back to Running, iterations continue
    /// counting (the window boundary is visible via the retry context).
    pub fn reset_for_retry(&mut self) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_creation_tokens += usage.cache_creation_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
    }
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Token counters for a single agent turn.
///
/// With prompt caching active, raw `input_tokens` alone is misleadingly
/// small; the effective context size is input + cache_creation + cache_read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Effective input: raw input plus cache creation and cache reads.
    pub fn effective_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// Total across all four counters.
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_tokens
            + self.cache_read_tokens
    }
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Live agent session identity and counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Opaque id issued by the agent tool; carried by value, never parsed.
    pub id: Option<String>,
    pub model: Option<String>,
    pub turn_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Context injected into a phase that is being re-run after a failure
/// elsewhere in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    /// The phase whose failure routed us back here.
    pub from_phase: String,
    pub reason: String,
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
}

/// State of the single executor instance that owns a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub session: SessionInfo,
    pub retry_context: Option<RetryContext>,
}

impl ExecutionState {
    pub fn new(pid: u32, hostname: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pid,
            hostname: hostname.into(),
            started_at: now,
            last_heartbeat: now,
            session: SessionInfo::default(),
            retry_context: None,
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Gate decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Auto,
    Ai,
    Human,
    Skip,
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GateType::Auto => "auto",
            GateType::Ai => "ai",
            GateType::Human => "human",
            GateType::Skip => "skip",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Approved,
    Rejected,
    NeedsClarification,
    Override,
}

/// One appended entry in a task's gate audit trail. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecisionRecord {
    pub phase: String,
    pub gate_type: GateType,
    pub decision: GateOutcome,
    pub approver: Option<String>,
    pub rationale: Option<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl GateDecisionRecord {
    pub fn new(phase: impl Into<String>, gate_type: GateType, decision: GateOutcome) -> Self {
        Self {
            phase: phase.into(),
            gate_type,
            decision,
            approver: None,
            rationale: None,
            questions: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// CostEntry
// ---------------------------------------------------------------------------

/// Immutable per-turn cost record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub project_id: String,
    pub task_id: TaskId,
    pub phase: String,
    pub model: String,
    pub iteration: u32,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

impl CostEntry {
    /// Build an entry from a usage block; `total_tokens` is derived so the
    /// equality `total = input + output + cache_creation + cache_read`
    /// holds by construction.
    pub fn from_usage(
        project_id: impl Into<String>,
        task_id: TaskId,
        phase: impl Into<String>,
        model: impl Into<String>,
        iteration: u32,
        cost_usd: f64,
        usage: &TokenUsage,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            task_id,
            phase: phase.into(),
            model: model.into(),
            iteration,
            cost_usd,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            total_tokens: usage.total(),
            timestamp: Utc::now(),
        }
    }

    pub fn effective_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

// ---------------------------------------------------------------------------
// Transcripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    Tool,
}

/// Append-only transcript line for a task/phase/iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub task_id: TaskId,
    pub phase: String,
    pub iteration: u32,
    pub role: TranscriptRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Monthly budget status for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub limit_usd: f64,
    pub spent_usd: f64,
    pub percent_used: f64,
    pub at_alert: bool,
    pub over_budget: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Planned.can_transition_to(&TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(&TaskStatus::Blocked));
        assert!(TaskStatus::Blocked.can_transition_to(&TaskStatus::Running));
        assert!(TaskStatus::Paused.can_transition_to(&TaskStatus::Running));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Running));
        assert!(!TaskStatus::Planned.can_transition_to(&TaskStatus::Completed));
    }

    #[test]
    fn set_status_enforces_table() {
        let mut task = Task::new(
            TaskId::new(1),
            "proj",
            "add feature",
            TaskWeight::Small,
        );
        assert!(task.set_status(TaskStatus::Running).is_ok());
        assert!(task.set_status(TaskStatus::Completed).is_ok());
        let err = task.set_status(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[test]
    fn token_usage_math() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cache_creation_tokens: 30,
            cache_read_tokens: 40,
        };
        assert_eq!(usage.effective_input(), 80);
        assert_eq!(usage.total(), 100);
    }

    #[test]
    fn cost_entry_total_equality() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_tokens: 2_000,
            cache_read_tokens: 30_000,
        };
        let entry = CostEntry::from_usage(
            "proj",
            TaskId::new(7),
            "implement",
            "sonnet",
            2,
            0.42,
            &usage,
        );
        assert_eq!(
            entry.total_tokens,
            entry.input_tokens
                + entry.output_tokens
                + entry.cache_creation_tokens
                + entry.cache_read_tokens
        );
        assert_eq!(entry.effective_input(), 32_100);
    }

    #[test]
    fn phase_state_lifecycle() {
        let mut ps = PhaseState::new("implement");
        assert_eq!(ps.status, PhaseStatus::Pending);
        ps.start();
        assert_eq!(ps.status, PhaseStatus::Running);
        assert!(ps.started_at.is_some());
        ps.fail("tests failed");
        assert_eq!(ps.status, PhaseStatus::Failed);
        ps.reset_for_retry();
        assert_eq!(ps.status, PhaseStatus::Running);
        assert!(ps.error.is_none());
        ps.complete();
        assert_eq!(ps.status, PhaseStatus::Completed);
    }

    #[test]
    fn cycle_detection_finds_cycle() {
        let a = TaskId::new(1);
        let b = TaskId::new(2);
        let c = TaskId::new(3);
        let mut edges = HashMap::new();
        edges.insert(a.clone(), vec![b.clone()]);
        edges.insert(b.clone(), vec![c.clone()]);
        edges.insert(c.clone(), vec![a.clone()]);
        assert!(find_dependency_cycle(&edges).is_some());
    }

    #[test]
    fn cycle_detection_accepts_dag() {
        let a = TaskId::new(1);
        let b = TaskId::new(2);
        let c = TaskId::new(3);
        let mut edges = HashMap::new();
        edges.insert(a, vec![b.clone(), c.clone()]);
        edges.insert(b, vec![c.clone()]);
        edges.insert(c, vec![]);
        assert!(find_dependency_cycle(&edges).is_none());
    }
}
