//! The per-task state machine.
//!
//! One executor instance owns one running task: it resolves configuration,
//! sets up the worktree and PID guard, drives the agent through the plan's
//! phases with checkpointing, quality checks, and gates, and finishes with
//! the finalize flow. Every state transition is persisted before the
//! corresponding event is published.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use orc_agent::{AgentConfig, AgentMessage, AgentRunner, TurnSpec};
use orc_core::config::{
    CleanupPolicy, ConfigResolver, EffectiveConfig, Provenance, SyncStrategy,
};
use orc_core::id::{sanitize_tag, TaskId};
use orc_core::mode::{self, Mode};
use orc_core::pid_guard::{PidGuard, PidGuardError};
use orc_core::plan::{CompletionCriterion, GateAction, Plan, PhaseSpec};
use orc_core::types::{
    ExecutionState, GateDecisionRecord, GateOutcome, GateType, PhaseState, PhaseStatus,
    RetryContext, Task, TaskStatus,
};
use orc_events::{Event, EventBus};
use orc_host::HostingProvider;
use orc_store::{Store, StoreError};
use orc_vcs::{GitRunner, SyncMode, SyncOutcome, Vcs, WorktreeError, WorktreeManager};
use orc_workflow::{
    evaluate_gate, run_before_triggers, run_checks, GateAgent, GateEvaluation, LifecycleTriggers,
    PhaseOutcome, Planner,
};

use crate::decisions::{DecisionOutcome, DecisionRegistry};
use crate::finalize::{run_finalize, FinalizeError, FinalizeOutcome};
use crate::paths::ProjectLayout;
use crate::prompts::PromptBuilder;
use crate::recorder::CostRecorder;
use crate::recovery::{self, RecoveryPolicy, RecoveryReport};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that escape the executor. Recoverable conditions (check failures,
/// gate rejections, conflicts, timeouts) are consumed internally and end up
/// in the task's persisted status instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Precondition(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] orc_core::config::ConfigError),

    #[error("vcs error: {0}")]
    Vcs(#[from] orc_vcs::VcsError),

    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error("pid guard error: {0}")]
    Guard(#[from] PidGuardError),

    #[error("layout error: {0}")]
    Layout(#[from] crate::paths::LayoutError),
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What / why / how-to-fix for a terminal failure or a blocked task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub reason: String,
    pub details: serde_json::Value,
    pub remediation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub failure: Option<FailureInfo>,
    pub recovery: Option<RecoveryReport>,
    pub finalize: Option<FinalizeOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub recovery: RecoveryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            recovery: RecoveryPolicy::ResumeFromCheckpoint,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal phase results
// ---------------------------------------------------------------------------

enum PhaseEnd {
    Completed { output: String },
    Failed { error: String },
    Paused,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Gate delegate
// ---------------------------------------------------------------------------

/// AI-gate delegate backed by the same agent CLI, run in the worktree.
struct ExecGateAgent {
    runner: Arc<AgentRunner>,
    workdir: PathBuf,
}

#[async_trait::async_trait]
impl GateAgent for ExecGateAgent {
    async fn evaluate(&self, rubric: &str, input: &str) -> Result<String, String> {
        let prompt = format!("{rubric}\n\n---\n\n{input}");
        let handle = self
            .runner
            .spawn_turn(TurnSpec {
                workdir: self.workdir.clone(),
                prompt,
                resume_session: None,
            })
            .map_err(|e| e.to_string())?;
        // Drain without forwarding; only the verdict text matters here.
        while handle.messages.recv_async().await.is_ok() {}
        let summary = handle.finish().await.map_err(|e| e.to_string())?;
        Ok(summary.final_text)
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    layout: ProjectLayout,
    config: EffectiveConfig,
    provenance: Provenance,
    mode: Mode,
    executor_tag: Option<String>,
    store: Arc<Store>,
    bus: EventBus,
    git: Arc<dyn GitRunner>,
    host: Option<Arc<dyn HostingProvider>>,
    decisions: Arc<DecisionRegistry>,
    recorder: CostRecorder,
    prompts: PromptBuilder,
    agent: Arc<AgentRunner>,
    lifecycle: Option<LifecycleTriggers>,
    pause_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl TaskExecutor {
    /// Resolve configuration for the project and build an executor.
    pub fn new(
        project_root: impl Into<PathBuf>,
        store: Arc<Store>,
        bus: EventBus,
        git: Arc<dyn GitRunner>,
        host: Option<Arc<dyn HostingProvider>>,
        decisions: Arc<DecisionRegistry>,
    ) -> Result<Self, EngineError> {
        let root: PathBuf = project_root.into();
        let (config, provenance) = ConfigResolver::resolve(&root)?;
        Ok(Self::with_config(
            root, config, provenance, store, bus, git, host, decisions,
        ))
    }

    /// Build with an explicit configuration (tests, embedders).
    #[allow(clippy::too_many_arguments)]
    pub fn with_config(
        project_root: PathBuf,
        config: EffectiveConfig,
        provenance: Provenance,
        store: Arc<Store>,
        bus: EventBus,
        git: Arc<dyn GitRunner>,
        host: Option<Arc<dyn HostingProvider>>,
        decisions: Arc<DecisionRegistry>,
    ) -> Self {
        let mode = mode::detect(&config, &project_root);
        let executor_tag = if mode.uses_identity() {
            config.executor_tag.as_deref().map(sanitize_tag)
        } else {
            None
        };
        let agent = Arc::new(AgentRunner::new(AgentConfig {
            command: config.agent_command.clone(),
            model: config.model.clone(),
            turn_timeout: Duration::from_secs(config.timeouts.turn_secs),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            cancel_grace: Duration::from_secs(5),
        }));
        let recorder = CostRecorder::new(store.clone(), bus.clone());
        let prompts = PromptBuilder::new(&project_root);
        Self {
            layout: ProjectLayout::new(&project_root),
            config,
            provenance,
            mode,
            executor_tag,
            store,
            bus,
            git,
            host,
            decisions,
            recorder,
            prompts,
            agent,
            lifecycle: None,
            pause_tx: watch::channel(false).0,
            cancel_tx: watch::channel(false).0,
        }
    }

    /// Attach workflow lifecycle triggers (on_task_created and friends).
    pub fn with_lifecycle(mut self, lifecycle: LifecycleTriggers) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Fire a lifecycle event. Gate-mode trigger failures surface to the
    /// caller only for task creation; terminal events never fail the task
    /// they describe.
    async fn fire_lifecycle(&self, event: orc_core::plan::LifecycleEvent) -> Result<(), String> {
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.fire(event).await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Cooperative pause: the current agent turn is wound down and the task
    /// moves to `paused`.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume_signal(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn decisions(&self) -> &Arc<DecisionRegistry> {
        &self.decisions
    }

    /// Remove worktrees whose PID file is absent or names a dead process.
    pub async fn gc_worktrees(&self) -> Result<Vec<PathBuf>, EngineError> {
        let manager = WorktreeManager::new(self.layout.root(), self.git.clone());
        Ok(manager.gc().await?)
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.subscribe().borrow()
    }

    fn is_paused(&self) -> bool {
        *self.pause_tx.subscribe().borrow()
    }

    // -----------------------------------------------------------------------
    // Task creation
    // -----------------------------------------------------------------------

    /// Create a new task: persist, mirror, publish. A blocking
    /// `on_task_created` trigger can refuse the creation.
    pub async fn create_task(&self, task: &Task) -> Result<(), EngineError> {
        self.layout.ensure()?;
        self.fire_lifecycle(orc_core::plan::LifecycleEvent::OnTaskCreated)
            .await
            .map_err(EngineError::Precondition)?;
        self.store.create_task(task).await?;
        self.layout.mirror_task(task, None, None)?;
        self.bus.publish(Event::for_task(
            "task_created",
            &task.id,
            serde_json::json!({ "title": task.title, "weight": task.weight }),
        ));
        Ok(())
    }

    /// Record an initiative and fire its planning trigger.
    pub async fn plan_initiative(
        &self,
        initiative: &orc_store::Initiative,
    ) -> Result<(), EngineError> {
        self.store.upsert_initiative(initiative).await?;
        if let Err(e) = self
            .fire_lifecycle(orc_core::plan::LifecycleEvent::OnInitiativePlanned)
            .await
        {
            warn!(error = %e, "on_initiative_planned trigger failed");
        }
        self.bus.publish(Event::global(
            "initiative_planned",
            serde_json::json!({ "initiative_id": initiative.id, "title": initiative.title }),
        ));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    pub async fn run(
        &self,
        task_id: &TaskId,
        options: RunOptions,
    ) -> Result<TaskReport, EngineError> {
        let mut task = match self.store.load_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                return Err(EngineError::TaskNotFound(task_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        if task.status.is_terminal() {
            return Err(EngineError::Precondition(format!(
                "task {task_id} is {}; create a new task or delete this one",
                task.status
            )));
        }
        if self.mode.uses_identity() && self.executor_tag.is_none() {
            return Err(EngineError::Precondition(
                "p2p/team mode requires an executor tag; set executor_tag in \
                 .orc/config.local.yaml or ORC_EXECUTOR_TAG"
                    .into(),
            ));
        }

        self.layout.ensure()?;

        // Worktree + PID guard: the one mutual exclusion for this task.
        let manager = WorktreeManager::new(self.layout.root(), self.git.clone());
        let handle = match manager
            .create_or_reuse(task_id, self.executor_tag.as_deref(), &self.config.target_branch)
            .await
        {
            Ok(handle) => handle,
            Err(WorktreeError::InUse(pid)) => {
                return Err(EngineError::Precondition(format!(
                    "task {task_id} is already being executed by pid {pid}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let guard = PidGuard::for_worktree(&handle.path);
        let guard_info = guard.acquire()?;

        let result = self
            .run_guarded(&mut task, options, &manager, &handle, guard_info.pid)
            .await;

        guard.release();
        result
    }

    async fn run_guarded(
        &self,
        task: &mut Task,
        options: RunOptions,
        manager: &WorktreeManager,
        handle: &orc_vcs::WorktreeHandle,
        pid: u32,
    ) -> Result<TaskReport, EngineError> {
        let task_id = task.id.clone();
        let vcs = Vcs::new(&handle.path, self.git.clone());

        // Inherit a prior execution state where one survives — the session
        // id in it is what makes an agent-side resume possible.
        let mut exec_state = match self.store.load_execution_state(&task_id).await? {
            Some(mut prior) => {
                prior.pid = pid;
                prior.hostname = orc_core::pid_guard::hostname();
                prior.heartbeat();
                prior
            }
            None => ExecutionState::new(pid, orc_core::pid_guard::hostname()),
        };

        // Crash recovery when we inherited a dead executor's worktree.
        let mut recovery_report = None;
        if handle.reused {
            let report = recovery::inspect(&self.store, &vcs, &task_id)
                .await
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
            let proceed = recovery::apply(options.recovery, &report, &self.store, &vcs)
                .await
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
            if !proceed {
                return Ok(TaskReport {
                    task_id,
                    status: task.status,
                    failure: None,
                    recovery: Some(report),
                    finalize: None,
                });
            }
            recovery_report = Some(report);
        }

        // Plan: reuse a persisted one, otherwise compute and persist.
        let plan = match self.store.load_plan(&task_id).await {
            Ok(plan) => plan,
            Err(StoreError::NotFound(_)) => {
                let plan = Planner::build_plan(task.weight, &self.config);
                self.store.save_plan(&task_id, &plan).await?;
                plan
            }
            Err(e) => return Err(e.into()),
        };
        plan.validate()
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        // Seed the project budget from config so status checks have a limit.
        if let Some(limit) = self.config.budget.monthly_limit_usd {
            self.store
                .set_budget(&task.project_id, limit, self.config.budget.alert_threshold)
                .await?;
        }

        // Transition to running. Persist, then publish.
        task.branch = Some(handle.branch.clone());
        if task.started_at.is_none() {
            task.started_at = Some(chrono::Utc::now());
        }
        task.set_status(TaskStatus::Running)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        exec_state.retry_context = None;
        self.store.save_task(task).await?;
        self.store.save_execution_state(&task_id, &exec_state).await?;
        self.layout.mirror_task(task, Some(&plan), Some(&exec_state))?;
        self.bus.publish(Event::for_task(
            "task_started",
            &task_id,
            serde_json::json!({ "branch": handle.branch, "mode": self.mode }),
        ));
        self.bus.update_metrics(|m| m.tasks_running += 1);
        self.bus.emit_session_update();

        let recovery_phase = recovery_report.as_ref().and_then(|r| r.phase.clone());
        let outcome = self
            .drive_phases(task, &plan, &vcs, &handle.path, &mut exec_state, recovery_phase)
            .await;

        self.bus.update_metrics(|m| m.tasks_running = m.tasks_running.saturating_sub(1));
        self.bus.emit_session_update();

        let mut report = match outcome {
            Ok(report) => report,
            Err(e) => {
                // A fatal error still leaves the task in a consistent,
                // persisted state before propagating.
                self.fail_task(
                    task,
                    FailureInfo {
                        reason: e.to_string(),
                        details: serde_json::Value::Null,
                        remediation: format!(
                            "inspect the worktree at {} and the task state under {}",
                            handle.path.display(),
                            self.layout.task_dir(&task_id).display()
                        ),
                    },
                )
                .await?;
                return Err(e);
            }
        };
        report.recovery = recovery_report;

        // Worktree cleanup policy.
        let remove = match self.config.worktree_cleanup {
            CleanupPolicy::Always => true,
            CleanupPolicy::OnSuccess => report.status == TaskStatus::Completed,
            CleanupPolicy::Never => false,
        };
        if remove {
            if let Err(e) = manager.remove(&handle.path).await {
                warn!(error = %e, "worktree cleanup failed");
            }
        }
        self.store.clear_execution_state(&task_id).await?;

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Phase loop
    // -----------------------------------------------------------------------

    async fn drive_phases(
        &self,
        task: &mut Task,
        plan: &Plan,
        vcs: &Vcs,
        workdir: &PathBuf,
        exec_state: &mut ExecutionState,
        mut recovery_phase: Option<String>,
    ) -> Result<TaskReport, EngineError> {
        let task_id = task.id.clone();

        // Pre-execution sync catches stale worktrees from parallel merges.
        if self.config.sync.sync_on_start && self.config.sync.strategy != SyncStrategy::None {
            match vcs.sync(&self.config.target_branch, SyncMode::Rebase).await? {
                SyncOutcome::Clean => {}
                SyncOutcome::Conflicts {
                    files,
                    resolution_script,
                } => {
                    return self.block_on_conflict(task, files, resolution_script).await;
                }
            }
        }

        let mut states = self.store.load_phase_states(&task_id).await?;
        let mut phase_outputs: HashMap<String, String> = HashMap::new();
        let mut retry_count: u32 = 0;
        let mut clarification: Option<String> = None;
        let mut index = 0;

        while index < plan.phases.len() {
            let spec = &plan.phases[index];

            let state = states
                .entry(spec.id.clone())
                .or_insert_with(|| PhaseState::new(&spec.id));
            if matches!(state.status, PhaseStatus::Completed | PhaseStatus::Skipped) {
                index += 1;
                continue;
            }

            if self.is_cancelled() {
                return self.cancel_task(task).await;
            }

            // Before-phase triggers; blocking failures fail the task.
            if let Err(e) = run_before_triggers(&spec.before_triggers, workdir).await {
                let report = self
                    .fail_task(
                        task,
                        FailureInfo {
                            reason: e.to_string(),
                            details: serde_json::json!({ "phase": spec.id }),
                            remediation: "fix or remove the failing before-phase trigger".into(),
                        },
                    )
                    .await?;
                return Ok(report);
            }

            // Artifact skip.
            if let Some(skip) = Planner::evaluate_skip(
                spec,
                &self.layout.task_dir(&task_id),
                self.config.artifact_skip_enabled,
            ) {
                let state = states.get_mut(&spec.id).expect("state just inserted");
                state.skip();
                self.store.save_phase_state(&task_id, state).await?;

                let mut record =
                    GateDecisionRecord::new(&spec.id, GateType::Skip, GateOutcome::Override);
                record.rationale = Some(skip.rationale.clone());
                self.store.append_decision(&task_id, &record).await?;

                self.bus.publish(Event::for_task(
                    "phase_skipped",
                    &task_id,
                    serde_json::json!({ "phase": spec.id, "rationale": skip.rationale }),
                ));
                index += 1;
                continue;
            }

            // Run the phase's iterations.
            task.current_phase = Some(spec.id.clone());
            self.store.save_task(task).await?;
            {
                let state = states.get_mut(&spec.id).expect("state exists");
                if state.status == PhaseStatus::Pending {
                    state.start();
                } else {
                    state.reset_for_retry();
                }
                self.store.save_phase_state(&task_id, state).await?;
            }
            self.bus.publish(Event::for_task(
                "phase_started",
                &task_id,
                serde_json::json!({ "phase": spec.id }),
            ));

            // Continuation applies once, to the phase a crashed executor
            // was interrupted in.
            let crash_resume = recovery_phase.as_deref() == Some(spec.id.as_str());
            if crash_resume {
                recovery_phase = None;
            }

            let end = self
                .run_phase(
                    task,
                    spec,
                    states.get_mut(&spec.id).expect("state exists"),
                    vcs,
                    workdir,
                    exec_state,
                    clarification.take(),
                    crash_resume,
                )
                .await?;

            match end {
                PhaseEnd::Paused => {
                    task.set_status(TaskStatus::Paused)
                        .map_err(|e| EngineError::Fatal(e.to_string()))?;
                    self.store.save_task(task).await?;
                    self.layout.mirror_task(task, Some(plan), Some(exec_state))?;
                    self.bus.publish(Event::for_task(
                        "task_paused",
                        &task_id,
                        serde_json::json!({ "phase": spec.id }),
                    ));
                    return Ok(TaskReport {
                        task_id,
                        status: TaskStatus::Paused,
                        failure: None,
                        recovery: None,
                        finalize: None,
                    });
                }

                PhaseEnd::Cancelled => return self.cancel_task(task).await,

                PhaseEnd::Failed { error } => {
                    let state = states.get_mut(&spec.id).expect("state exists");
                    state.fail(&error);
                    self.store.save_phase_state(&task_id, state).await?;
                    self.bus.publish(Event::for_task(
                        "phase_failed",
                        &task_id,
                        serde_json::json!({ "phase": spec.id, "error": error }),
                    ));

                    // Retry routing consumes the failure when an edge exists
                    // and the budget allows.
                    if let Some(target) = plan.retry_routes.get(&spec.id) {
                        retry_count += 1;
                        if retry_count <= plan.max_retries {
                            index = self
                                .apply_retry(
                                    plan,
                                    &mut states,
                                    vcs,
                                    task,
                                    &spec.id,
                                    target,
                                    &error,
                                    retry_count,
                                    exec_state,
                                )
                                .await?;
                            continue;
                        }
                    }
                    let report = self
                        .fail_task(
                            task,
                            FailureInfo {
                                reason: format!("phase {} failed: {error}", spec.id),
                                details: serde_json::json!({
                                    "phase": spec.id,
                                    "retries_used": retry_count,
                                }),
                                remediation: format!(
                                    "inspect transcripts under {} and re-run",
                                    self.layout.task_dir(&task_id).display()
                                ),
                            },
                        )
                        .await?;
                    return Ok(report);
                }

                PhaseEnd::Completed { output } => {
                    phase_outputs.insert(spec.id.clone(), output.clone());

                    // Retry context applies to the re-run phase only.
                    if exec_state.retry_context.is_some() {
                        exec_state.retry_context = None;
                        self.store.save_execution_state(&task_id, exec_state).await?;
                    }

                    // Gate.
                    let gate_agent = ExecGateAgent {
                        runner: self.agent.clone(),
                        workdir: workdir.clone(),
                    };
                    let outcome = PhaseOutcome {
                        output: &output,
                        error: None,
                        context: gate_context(&spec.gate.input, task, &phase_outputs),
                    };
                    let evaluation = evaluate_gate(&spec.gate, &outcome, Some(&gate_agent))
                        .await
                        .map_err(|e| EngineError::Fatal(e.to_string()))?;

                    match evaluation {
                        GateEvaluation::Approved { action } => {
                            let next = self
                                .apply_gate_action(
                                    task, plan, &mut states, vcs, workdir, spec, index, &action,
                                    GateOutcome::Approved, None, &mut retry_count, exec_state,
                                )
                                .await?;
                            match next {
                                Some(next_index) => index = next_index,
                                None => {
                                    return self.fail_after_gate(task, spec, "gate action failed").await
                                }
                            }
                        }
                        GateEvaluation::Rejected { action, rationale } => {
                            let next = self
                                .apply_gate_action(
                                    task, plan, &mut states, vcs, workdir, spec, index, &action,
                                    GateOutcome::Rejected, rationale.clone(), &mut retry_count,
                                    exec_state,
                                )
                                .await?;
                            match next {
                                Some(next_index) => index = next_index,
                                None => {
                                    let reason = rationale
                                        .unwrap_or_else(|| "gate rejected the phase".into());
                                    return self.fail_after_gate(task, spec, &reason).await;
                                }
                            }
                        }
                        GateEvaluation::NeedsHuman { questions } => {
                            match self
                                .await_human_decision(task, plan, spec, &questions, exec_state)
                                .await?
                            {
                                HumanVerdict::Approved => {
                                    let next = self
                                        .apply_gate_action(
                                            task, plan, &mut states, vcs, workdir, spec, index,
                                            &GateAction::Continue, GateOutcome::Approved, None,
                                            &mut retry_count, exec_state,
                                        )
                                        .await?;
                                    index = next.expect("continue always advances");
                                }
                                HumanVerdict::Rejected { comment } => {
                                    let mut record = GateDecisionRecord::new(
                                        &spec.id,
                                        spec.gate.gate_type,
                                        GateOutcome::Rejected,
                                    );
                                    record.rationale = comment.clone();
                                    self.store.append_decision(&task_id, &record).await?;
                                    let reason =
                                        comment.unwrap_or_else(|| "rejected by reviewer".into());
                                    return self.fail_after_gate(task, spec, &reason).await;
                                }
                                HumanVerdict::Clarified { text } => {
                                    // Re-run the originating phase with the
                                    // clarification appended to its context.
                                    let mut record = GateDecisionRecord::new(
                                        &spec.id,
                                        spec.gate.gate_type,
                                        GateOutcome::NeedsClarification,
                                    );
                                    record.questions = questions.clone();
                                    record.rationale = Some(text.clone());
                                    self.store.append_decision(&task_id, &record).await?;
                                    clarification = Some(text);
                                    let state =
                                        states.get_mut(&spec.id).expect("state exists");
                                    state.reset_for_retry();
                                    self.store.save_phase_state(&task_id, state).await?;
                                    // index unchanged: same phase again
                                }
                                HumanVerdict::Detached => {
                                    return Ok(TaskReport {
                                        task_id,
                                        status: TaskStatus::Blocked,
                                        failure: None,
                                        recovery: None,
                                        finalize: None,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        // All phases done: finalize, then complete.
        let finalize = match run_finalize(
            task,
            task.branch.as_deref().unwrap_or_default(),
            &self.config,
            vcs,
            self.host.as_ref(),
            &self.bus,
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(FinalizeError::SyncConflict {
                files,
                resolution_script,
                ..
            }) => {
                return self.block_on_conflict(task, files, resolution_script).await;
            }
            Err(FinalizeError::Vcs(orc_vcs::VcsError::ProtectedBranch(branch))) => {
                let report = self
                    .fail_task(
                        task,
                        FailureInfo {
                            reason: format!("protected_branch: refusing to force-push {branch}"),
                            details: serde_json::json!({ "branch": branch }),
                            remediation: "point target_branch at an integration branch or \
                                          remove it from protected_branches"
                                .into(),
                        },
                    )
                    .await?;
                return Ok(report);
            }
            Err(e) => {
                let report = self
                    .fail_task(
                        task,
                        FailureInfo {
                            reason: format!("finalize failed: {e}"),
                            details: serde_json::Value::Null,
                            remediation: "re-run the task to retry finalize; completed phases \
                                          are checkpointed"
                                .into(),
                        },
                    )
                    .await?;
                return Ok(report);
            }
        };

        task.completed_at = Some(chrono::Utc::now());
        task.set_status(TaskStatus::Completed)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        self.store.save_task(task).await?;
        self.layout.mirror_task(task, Some(plan), Some(exec_state))?;
        self.bus.publish(Event::for_task(
            "task_completed",
            &task.id,
            serde_json::json!({ "finalize": finalize }),
        ));
        if let Err(e) = self
            .fire_lifecycle(orc_core::plan::LifecycleEvent::OnTaskCompleted)
            .await
        {
            warn!(error = %e, "on_task_completed trigger failed");
        }

        Ok(TaskReport {
            task_id: task.id.clone(),
            status: TaskStatus::Completed,
            failure: None,
            recovery: None,
            finalize,
        })
    }

    // -----------------------------------------------------------------------
    // One phase: the iteration loop
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        task: &Task,
        spec: &PhaseSpec,
        state: &mut PhaseState,
        vcs: &Vcs,
        workdir: &PathBuf,
        exec_state: &mut ExecutionState,
        mut clarification: Option<String>,
        crash_resume: bool,
    ) -> Result<PhaseEnd, EngineError> {
        let task_id = task.id.clone();
        let phase_deadline = Instant::now() + Duration::from_secs(spec.timeout_secs);
        let mut failure_context: Option<String> = None;
        let retry_context = exec_state.retry_context.clone();

        // Resuming a crashed run continues the session on its first prompt
        // instead of restating the phase; possible only while the opaque
        // session id survived.
        let mut crash_resume = crash_resume && exec_state.session.id.is_some();

        // Each (re)entry opens a fresh iteration window on top of whatever
        // the counter already holds; replayed work gets new iteration
        // numbers, so prior cost entries are never duplicated.
        let iteration_limit = state.iterations + spec.max_iterations;

        while state.iterations < iteration_limit {
            if self.is_cancelled() {
                return Ok(PhaseEnd::Cancelled);
            }
            if self.is_paused() {
                return Ok(PhaseEnd::Paused);
            }
            if Instant::now() >= phase_deadline {
                return Ok(PhaseEnd::Failed {
                    error: format!("phase timeout after {}s", spec.timeout_secs),
                });
            }

            state.iterations += 1;
            let iteration = state.iterations;
            self.store.save_phase_state(&task_id, state).await?;
            self.bus.publish(Event::for_task(
                "iteration_tick",
                &task_id,
                serde_json::json!({ "phase": spec.id, "iteration": iteration }),
            ));

            let prompt = if crash_resume {
                crash_resume = false;
                let last = self
                    .store
                    .last_transcript(&task_id, Some(orc_core::types::TranscriptRole::Assistant))
                    .await?
                    .unwrap_or_default();
                orc_agent::build_continuation_prompt(&last, &spec.id, iteration)
            } else {
                self.prompts.build(
                    task,
                    spec,
                    &self.config.completion.markers,
                    retry_context.as_ref(),
                    failure_context.as_deref(),
                    clarification.take().as_deref(),
                )
            };
            self.append_transcript(&task_id, &spec.id, iteration, "user", &prompt)
                .await?;

            let summary = match self
                .stream_turn(task, spec, state, iteration, workdir, exec_state, &prompt, phase_deadline)
                .await?
            {
                TurnEnd::Summary(summary) => summary,
                TurnEnd::Paused => return Ok(PhaseEnd::Paused),
                TurnEnd::Cancelled => return Ok(PhaseEnd::Cancelled),
                TurnEnd::IterationFailed(error) => {
                    warn!(task_id = %task_id, phase = %spec.id, iteration, error = %error, "iteration failed");
                    failure_context = Some(format!("The previous attempt failed: {error}"));
                    continue;
                }
            };

            if summary.had_error {
                failure_context =
                    Some("The previous attempt ended with an agent error.".to_string());
                continue;
            }

            if !completion_satisfied(&spec.completion_criteria, &summary.final_text, workdir) {
                failure_context = Some(
                    "The previous attempt did not declare completion. Finish the \
                     remaining work and emit the completion marker."
                        .to_string(),
                );
                continue;
            }

            // The phase claims completion; quality checks arbitrate.
            let results = run_checks(&spec.quality_checks, &self.config.commands, workdir).await;
            let blocking: Vec<_> = results.iter().filter(|r| r.blocks()).collect();
            if blocking.is_empty() {
                state.files_changed = vcs.changed_paths().await?;
                self.store.save_phase_state(&task_id, state).await?;
                return Ok(PhaseEnd::Completed {
                    output: summary.final_text,
                });
            }

            let context = orc_workflow::checks::failure_context(&results);
            warn!(task_id = %task_id, phase = %spec.id, blocked = blocking.len(), "quality checks rejected completion");
            failure_context = Some(context);
        }

        Ok(PhaseEnd::Failed {
            error: format!(
                "no accepted completion after {} iterations",
                spec.max_iterations
            ),
        })
    }

    /// Stream one agent turn, forwarding messages to transcripts, costs,
    /// and events. Enforces the phase deadline on top of the runner's own
    /// turn/idle timeouts.
    #[allow(clippy::too_many_arguments)]
    async fn stream_turn(
        &self,
        task: &Task,
        spec: &PhaseSpec,
        state: &mut PhaseState,
        iteration: u32,
        workdir: &PathBuf,
        exec_state: &mut ExecutionState,
        prompt: &str,
        phase_deadline: Instant,
    ) -> Result<TurnEnd, EngineError> {
        let task_id = task.id.clone();
        let resume_session = exec_state.session.id.clone();
        let handle = match self.agent.spawn_turn(TurnSpec {
            workdir: workdir.clone(),
            prompt: prompt.to_string(),
            resume_session,
        }) {
            Ok(handle) => handle,
            Err(e) => return Ok(TurnEnd::IterationFailed(e.to_string())),
        };

        let mut pause_rx = self.pause_tx.subscribe();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut winding_down: Option<TurnEnd> = None;

        loop {
            tokio::select! {
                message = handle.messages.recv_async() => {
                    match message {
                        Ok(message) => {
                            self.on_message(task, spec, state, iteration, exec_state, message)
                                .await?;
                        }
                        Err(_) => break, // stream ended
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(phase_deadline)),
                    if winding_down.is_none() =>
                {
                    handle.cancel();
                    winding_down = Some(TurnEnd::IterationFailed(format!(
                        "phase timeout after {}s", spec.timeout_secs
                    )));
                }
                _ = cancel_rx.changed(), if winding_down.is_none() => {
                    handle.cancel();
                    winding_down = Some(TurnEnd::Cancelled);
                }
                _ = pause_rx.changed(), if winding_down.is_none() => {
                    handle.cancel();
                    winding_down = Some(TurnEnd::Paused);
                }
            }
        }

        let finish = handle.finish().await;
        self.store.save_phase_state(&task_id, state).await?;
        self.store.save_execution_state(&task_id, exec_state).await?;

        if let Some(interrupted) = winding_down {
            return Ok(interrupted);
        }
        match finish {
            Ok(summary) => Ok(TurnEnd::Summary(summary)),
            Err(e) => Ok(TurnEnd::IterationFailed(e.to_string())),
        }
    }

    async fn on_message(
        &self,
        task: &Task,
        spec: &PhaseSpec,
        state: &mut PhaseState,
        iteration: u32,
        exec_state: &mut ExecutionState,
        message: AgentMessage,
    ) -> Result<(), EngineError> {
        let task_id = &task.id;
        match message {
            AgentMessage::Init { session_id, model } => {
                // Persisted immediately so a crash can still resume the
                // session.
                exec_state.session.id = Some(session_id);
                exec_state.session.model = model;
                exec_state.heartbeat();
                self.store.save_execution_state(task_id, exec_state).await?;
            }
            AgentMessage::Assistant { text, tool_uses } => {
                exec_state.session.last_activity = Some(chrono::Utc::now());
                if !text.is_empty() {
                    self.append_transcript(task_id, &spec.id, iteration, "assistant", &text)
                        .await?;
                }
                for tool in tool_uses {
                    let line = format!(
                        "tool_use {}: {}",
                        tool.name.as_deref().unwrap_or("unknown"),
                        tool.payload
                    );
                    self.append_transcript(task_id, &spec.id, iteration, "tool", &line)
                        .await?;
                }
            }
            AgentMessage::ToolResult { tool, content } => {
                let line = format!(
                    "tool_result {}: {content}",
                    tool.as_deref().unwrap_or("unknown")
                );
                self.append_transcript(task_id, &spec.id, iteration, "tool", &line)
                    .await?;
            }
            AgentMessage::Result { sample, .. } => {
                state.record_usage(&sample.usage);
                exec_state.session.turn_count += 1;
                exec_state.heartbeat();
                self.recorder
                    .record_turn(
                        &task.project_id,
                        task_id,
                        &spec.id,
                        exec_state.session.model.as_deref().unwrap_or(&self.config.model),
                        iteration,
                        &sample,
                    )
                    .await?;
            }
            AgentMessage::Error { message } => {
                self.append_transcript(
                    task_id,
                    &spec.id,
                    iteration,
                    "assistant",
                    &format!("error: {message}"),
                )
                .await?;
            }
            AgentMessage::Heartbeat => {
                exec_state.heartbeat();
                self.store.save_execution_state(task_id, exec_state).await?;
                self.bus.publish(Event::for_task(
                    "iteration_tick",
                    task_id,
                    serde_json::json!({ "phase": spec.id, "iteration": iteration, "heartbeat": true }),
                ));
            }
            AgentMessage::Other { .. } => {}
        }
        Ok(())
    }

    async fn append_transcript(
        &self,
        task_id: &TaskId,
        phase: &str,
        iteration: u32,
        role: &str,
        content: &str,
    ) -> Result<(), EngineError> {
        use orc_core::types::{TranscriptRecord, TranscriptRole};
        let role = match role {
            "user" => TranscriptRole::User,
            "tool" => TranscriptRole::Tool,
            _ => TranscriptRole::Assistant,
        };
        let record = TranscriptRecord {
            task_id: task_id.clone(),
            phase: phase.to_string(),
            iteration,
            role,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
        };
        // Persist first, then publish; the mirror file is best-effort.
        self.store.append_transcript(&record).await?;
        if let Err(e) = self
            .layout
            .mirror_transcript(task_id, phase, iteration, content)
        {
            warn!(error = %e, "transcript mirror write failed");
        }
        self.bus.publish(Event::for_task(
            "transcript_line",
            task_id,
            serde_json::json!({
                "phase": phase,
                "iteration": iteration,
                "role": record.role,
                "content": content,
            }),
        ));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Gate actions
    // -----------------------------------------------------------------------

    /// Apply a gate action. Returns the next phase index, or `None` when
    /// the action demands task failure.
    #[allow(clippy::too_many_arguments)]
    async fn apply_gate_action(
        &self,
        task: &mut Task,
        plan: &Plan,
        states: &mut HashMap<String, PhaseState>,
        vcs: &Vcs,
        workdir: &PathBuf,
        spec: &PhaseSpec,
        index: usize,
        action: &GateAction,
        verdict: GateOutcome,
        rationale: Option<String>,
        retry_count: &mut u32,
        exec_state: &mut ExecutionState,
    ) -> Result<Option<usize>, EngineError> {
        let task_id = task.id.clone();

        let mut record = GateDecisionRecord::new(&spec.id, spec.gate.gate_type, verdict);
        record.rationale = rationale.clone();
        self.store.append_decision(&task_id, &record).await?;

        match action {
            GateAction::Continue => {
                self.complete_phase(task, states, vcs, spec, exec_state).await?;
                Ok(Some(index + 1))
            }

            GateAction::SkipPhase => {
                self.complete_phase(task, states, vcs, spec, exec_state).await?;
                // Skip the phase after this one.
                if let Some(next) = plan.phases.get(index + 1) {
                    let state = states
                        .entry(next.id.clone())
                        .or_insert_with(|| PhaseState::new(&next.id));
                    state.skip();
                    self.store.save_phase_state(&task_id, state).await?;
                    let record =
                        GateDecisionRecord::new(&next.id, GateType::Skip, GateOutcome::Override);
                    self.store.append_decision(&task_id, &record).await?;
                    self.bus.publish(Event::for_task(
                        "phase_skipped",
                        &task_id,
                        serde_json::json!({ "phase": next.id, "rationale": "skip_phase gate action" }),
                    ));
                }
                Ok(Some(index + 2))
            }

            GateAction::Retry { retry_from } => {
                *retry_count += 1;
                if *retry_count > plan.max_retries {
                    return Ok(None);
                }
                let reason =
                    rationale.unwrap_or_else(|| format!("gate on {} requested retry", spec.id));
                let next = self
                    .apply_retry(
                        plan, states, vcs, task, &spec.id, retry_from, &reason, *retry_count,
                        exec_state,
                    )
                    .await?;
                Ok(Some(next))
            }

            GateAction::Fail => Ok(None),

            GateAction::RunScript { command } => {
                info!(task_id = %task_id, command = %command, "running gate script");
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(workdir)
                    .output()
                    .await
                    .map_err(|e| EngineError::Fatal(e.to_string()))?;
                if output.status.success() {
                    self.complete_phase(task, states, vcs, spec, exec_state).await?;
                    Ok(Some(index + 1))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Checkpoint and mark the phase completed: persist, then publish.
    async fn complete_phase(
        &self,
        task: &Task,
        states: &mut HashMap<String, PhaseState>,
        vcs: &Vcs,
        spec: &PhaseSpec,
        exec_state: &ExecutionState,
    ) -> Result<(), EngineError> {
        let task_id = task.id.clone();
        let state = states.get_mut(&spec.id).expect("phase state exists");

        let duration_secs = state
            .started_at
            .map(|s| (chrono::Utc::now() - s).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let checkpoint = vcs
            .checkpoint(
                &self.config.commit_prefix,
                &task_id,
                &spec.id,
                "completed",
                state.iterations,
                duration_secs,
            )
            .await?;

        state.complete();
        if checkpoint.commit_id.is_some() {
            state.last_checkpoint = checkpoint.commit_id.clone();
            state.files_changed = checkpoint.files.clone();
        }
        self.store.save_phase_state(&task_id, state).await?;
        self.store.save_execution_state(&task_id, exec_state).await?;

        if let Some(commit) = &checkpoint.commit_id {
            self.bus.publish(Event::for_task(
                "checkpoint_created",
                &task_id,
                serde_json::json!({
                    "phase": spec.id,
                    "commit": commit,
                    "files": checkpoint.files,
                }),
            ));
        }
        self.bus.publish(Event::for_task(
            "phase_completed",
            &task_id,
            serde_json::json!({ "phase": spec.id, "iterations": state.iterations }),
        ));
        Ok(())
    }

    /// Rewind to an earlier phase and inject retry context.
    #[allow(clippy::too_many_arguments)]
    async fn apply_retry(
        &self,
        plan: &Plan,
        states: &mut HashMap<String, PhaseState>,
        vcs: &Vcs,
        task: &Task,
        failed_phase: &str,
        target_phase: &str,
        reason: &str,
        attempt: u32,
        exec_state: &mut ExecutionState,
    ) -> Result<usize, EngineError> {
        let task_id = task.id.clone();
        let target_index = plan
            .phase_index(target_phase)
            .ok_or_else(|| EngineError::Fatal(format!("retry targets unknown phase {target_phase}")))?;
        let failed_index = plan
            .phase_index(failed_phase)
            .ok_or_else(|| EngineError::Fatal(format!("unknown phase {failed_phase}")))?;

        info!(
            task_id = %task_id,
            from = %failed_phase,
            to = %target_phase,
            attempt,
            "retry routing"
        );

        // Drop uncommitted leftovers of the failed phase, then fall back to
        // the target's checkpoint when it exists.
        vcs.discard_changes().await?;
        if let Some(commit) = states
            .get(target_phase)
            .and_then(|s| s.last_checkpoint.clone())
        {
            vcs.rewind(&commit).await?;
        }

        // Rewind phase bookkeeping: the target and everything after it (up
        // to the failed phase) go back through running. Iteration and token
        // counters are preserved — the re-run appends a new iteration
        // window, so per-iteration records never collide.
        for spec in &plan.phases[target_index..=failed_index] {
            let state = states
                .entry(spec.id.clone())
                .or_insert_with(|| PhaseState::new(&spec.id));
            state.reset_for_retry();
            self.store.save_phase_state(&task_id, state).await?;
        }

        exec_state.retry_context = Some(RetryContext {
            from_phase: failed_phase.to_string(),
            reason: reason.to_string(),
            attempt,
            failed_at: chrono::Utc::now(),
        });
        self.store.save_execution_state(&task_id, exec_state).await?;

        self.bus.publish(Event::for_task(
            "retry_routed",
            &task_id,
            serde_json::json!({
                "from": failed_phase,
                "to": target_phase,
                "attempt": attempt,
                "reason": reason,
            }),
        ));
        Ok(target_index)
    }

    // -----------------------------------------------------------------------
    // Human decisions
    // -----------------------------------------------------------------------

    async fn await_human_decision(
        &self,
        task: &mut Task,
        plan: &Plan,
        spec: &PhaseSpec,
        questions: &[String],
        exec_state: &ExecutionState,
    ) -> Result<HumanVerdict, EngineError> {
        let task_id = task.id.clone();

        // Persist blocked before anyone hears about it.
        task.set_status(TaskStatus::Blocked)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        self.store.save_task(task).await?;
        self.layout.mirror_task(task, Some(plan), Some(exec_state))?;

        let question = if questions.is_empty() {
            format!("Approve the '{}' phase of {}?", spec.id, task.title)
        } else {
            questions.join("\n")
        };
        let (decision, rx) = self.decisions.register(
            task_id.clone(),
            &spec.id,
            spec.gate.gate_type,
            question.clone(),
            String::new(),
        );
        self.bus.publish(Event::for_task(
            "decision_required",
            &task_id,
            serde_json::json!({
                "decision_id": decision.decision_id,
                "task_id": task_id,
                "phase": spec.id,
                "gate_type": spec.gate.gate_type,
                "question": question,
                "context": "",
                "requested_at": decision.requested_at,
            }),
        ));
        self.bus.publish(Event::for_task(
            "task_blocked",
            &task_id,
            serde_json::json!({ "phase": spec.id, "decision_id": decision.decision_id }),
        ));

        let mut cancel_rx = self.cancel_tx.subscribe();
        let resolution = tokio::select! {
            resolution = rx => match resolution {
                Ok(resolution) => resolution,
                Err(_) => return Ok(HumanVerdict::Detached),
            },
            _ = cancel_rx.changed() => {
                self.decisions.withdraw(&decision.decision_id);
                return Ok(HumanVerdict::Detached);
            }
        };

        // Back to running; persist, then publish the resolution.
        task.set_status(TaskStatus::Running)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        self.store.save_task(task).await?;
        self.bus.publish(Event::for_task(
            "decision_resolved",
            &task_id,
            serde_json::json!({
                "decision_id": decision.decision_id,
                "outcome": resolution.outcome,
            }),
        ));
        self.bus.publish(Event::for_task(
            "task_resumed",
            &task_id,
            serde_json::json!({ "phase": spec.id }),
        ));

        Ok(match resolution.outcome {
            DecisionOutcome::Approve => HumanVerdict::Approved,
            DecisionOutcome::Reject => HumanVerdict::Rejected {
                comment: resolution.comment,
            },
            DecisionOutcome::Clarify => HumanVerdict::Clarified {
                text: resolution
                    .clarification
                    .or(resolution.comment)
                    .unwrap_or_default(),
            },
        })
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn block_on_conflict(
        &self,
        task: &mut Task,
        files: Vec<String>,
        resolution_script: String,
    ) -> Result<TaskReport, EngineError> {
        let task_id = task.id.clone();
        if task.status != TaskStatus::Blocked {
            task.set_status(TaskStatus::Blocked)
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
        }
        self.store.save_task(task).await?;
        self.bus.publish(Event::for_task(
            "task_blocked",
            &task_id,
            serde_json::json!({
                "reason": "sync_conflict",
                "files": files,
                "resolution_script": resolution_script,
            }),
        ));
        Ok(TaskReport {
            task_id,
            status: TaskStatus::Blocked,
            failure: Some(FailureInfo {
                reason: format!(
                    "sync with {} conflicted in {} file(s)",
                    self.config.target_branch,
                    files.len()
                ),
                details: serde_json::json!({ "files": files }),
                remediation: resolution_script,
            }),
            recovery: None,
            finalize: None,
        })
    }

    async fn fail_task(
        &self,
        task: &mut Task,
        failure: FailureInfo,
    ) -> Result<TaskReport, EngineError> {
        let task_id = task.id.clone();
        error!(task_id = %task_id, reason = %failure.reason, "task failed");
        if task.status.can_transition_to(&TaskStatus::Failed) {
            task.set_status(TaskStatus::Failed)
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
        }
        self.store.save_task(task).await?;
        self.bus.publish(Event::for_task(
            "task_failed",
            &task_id,
            serde_json::json!({
                "reason": failure.reason,
                "details": failure.details,
                "remediation": failure.remediation,
            }),
        ));
        if let Err(e) = self
            .fire_lifecycle(orc_core::plan::LifecycleEvent::OnTaskFailed)
            .await
        {
            warn!(error = %e, "on_task_failed trigger failed");
        }
        Ok(TaskReport {
            task_id,
            status: TaskStatus::Failed,
            failure: Some(failure),
            recovery: None,
            finalize: None,
        })
    }

    async fn fail_after_gate(
        &self,
        task: &mut Task,
        spec: &PhaseSpec,
        reason: &str,
    ) -> Result<TaskReport, EngineError> {
        self.fail_task(
            task,
            FailureInfo {
                reason: format!("gate on {} failed the task: {reason}", spec.id),
                details: serde_json::json!({ "phase": spec.id }),
                remediation: format!(
                    "review the gate decision audit: decisions for {}",
                    task.id
                ),
            },
        )
        .await
    }

    async fn cancel_task(&self, task: &mut Task) -> Result<TaskReport, EngineError> {
        let task_id = task.id.clone();
        task.set_status(TaskStatus::Cancelled)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        self.store.save_task(task).await?;
        self.bus.publish(Event::for_task(
            "task_cancelled",
            &task_id,
            serde_json::Value::Null,
        ));
        Ok(TaskReport {
            task_id,
            status: TaskStatus::Cancelled,
            failure: None,
            recovery: None,
            finalize: None,
        })
    }
}

enum TurnEnd {
    Summary(orc_agent::TurnSummary),
    IterationFailed(String),
    Paused,
    Cancelled,
}

enum HumanVerdict {
    Approved,
    Rejected { comment: Option<String> },
    Clarified { text: String },
    /// The registry went away (restart, cancel); the task stays blocked.
    Detached,
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Any satisfied criterion completes the phase.
fn completion_satisfied(
    criteria: &[CompletionCriterion],
    final_text: &str,
    workdir: &PathBuf,
) -> bool {
    criteria.iter().any(|criterion| match criterion {
        CompletionCriterion::Marker { marker } => final_text.contains(marker),
        CompletionCriterion::ArtifactExists { path } => workdir.join(path).exists(),
        CompletionCriterion::NonEmptyOutput => !final_text.trim().is_empty(),
    })
}

/// Assemble the gate's input per its input config.
fn gate_context(
    input: &orc_core::plan::GateInputConfig,
    task: &Task,
    phase_outputs: &HashMap<String, String>,
) -> String {
    let mut context = String::new();
    for field in &input.include_task_fields {
        match field.as_str() {
            "title" => context.push_str(&format!("Title: {}\n", task.title)),
            "description" => {
                if let Some(d) = &task.description {
                    context.push_str(&format!("Description: {d}\n"));
                }
            }
            "testing_requirements" => {
                if let Some(t) = &task.testing_requirements {
                    context.push_str(&format!("Testing requirements: {t}\n"));
                }
            }
            _ => {}
        }
    }
    for phase in &input.include_phases {
        if let Some(output) = phase_outputs.get(phase) {
            context.push_str(&format!("\n## Output of {phase}\n{output}\n"));
        }
    }
    context
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_markers_win() {
        let workdir = PathBuf::from("/nonexistent");
        let criteria = vec![CompletionCriterion::Marker {
            marker: "PHASE_COMPLETE".into(),
        }];
        assert!(completion_satisfied(&criteria, "done\nPHASE_COMPLETE", &workdir));
        assert!(!completion_satisfied(&criteria, "done", &workdir));
    }

    #[test]
    fn non_empty_criterion_is_weak_fallback() {
        let workdir = PathBuf::from("/nonexistent");
        let criteria = vec![CompletionCriterion::NonEmptyOutput];
        assert!(completion_satisfied(&criteria, "anything", &workdir));
        assert!(!completion_satisfied(&criteria, "  \n ", &workdir));
    }

    #[test]
    fn gate_context_selects_fields_and_phases() {
        let mut task = Task::new(
            TaskId::new(1),
            "proj",
            "title here",
            orc_core::types::TaskWeight::Small,
        );
        task.description = Some("desc here".into());
        let mut outputs = HashMap::new();
        outputs.insert("implement".to_string(), "impl output".to_string());
        outputs.insert("test".to_string(), "test output".to_string());

        let input = orc_core::plan::GateInputConfig {
            include_phases: vec!["implement".into()],
            include_task_fields: vec!["title".into(), "description".into()],
        };
        let context = gate_context(&input, &task, &outputs);
        assert!(context.contains("title here"));
        assert!(context.contains("desc here"));
        assert!(context.contains("impl output"));
        assert!(!context.contains("test output"));
    }
}
