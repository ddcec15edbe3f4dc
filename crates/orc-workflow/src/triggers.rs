use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use orc_core::plan::{LifecycleEvent, TriggerMode, TriggerSpec};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("blocking trigger '{name}' failed: {detail}")]
    GateFailed { name: String, detail: String },
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn run_command(command: &str, workdir: &Path) -> Result<(), String> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "exit {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Run a phase's before-triggers. Gate-mode triggers block and fail the
/// caller on a non-zero exit; reaction-mode triggers are fire-and-forget
/// (failures logged, never fatal).
pub async fn run_before_triggers(
    triggers: &[TriggerSpec],
    workdir: &Path,
) -> Result<(), TriggerError> {
    for trigger in triggers {
        match trigger.mode {
            TriggerMode::Gate => {
                info!(trigger = %trigger.name, "running blocking trigger");
                run_command(&trigger.command, workdir)
                    .await
                    .map_err(|detail| TriggerError::GateFailed {
                        name: trigger.name.clone(),
                        detail,
                    })?;
            }
            TriggerMode::Reaction => {
                let name = trigger.name.clone();
                let command = trigger.command.clone();
                let workdir = workdir.to_path_buf();
                tokio::spawn(async move {
                    if let Err(detail) = run_command(&command, &workdir).await {
                        warn!(trigger = %name, detail = %detail, "reaction trigger failed");
                    }
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle triggers
// ---------------------------------------------------------------------------

/// Workflow lifecycle triggers, reusing the same machinery as before-phase
/// triggers.
#[derive(Default)]
pub struct LifecycleTriggers {
    triggers: HashMap<LifecycleEvent, Vec<TriggerSpec>>,
    workdir: PathBuf,
}

impl LifecycleTriggers {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            triggers: HashMap::new(),
            workdir: workdir.into(),
        }
    }

    pub fn register(&mut self, event: LifecycleEvent, spec: TriggerSpec) {
        self.triggers.entry(event).or_default().push(spec);
    }

    /// Fire all triggers for a lifecycle event.
    pub async fn fire(&self, event: LifecycleEvent) -> Result<(), TriggerError> {
        if let Some(specs) = self.triggers.get(&event) {
            run_before_triggers(specs, &self.workdir).await?;
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

    fn gate(name: &str, command: &str) -> TriggerSpec {
        TriggerSpec {
            name: name.into(),
            mode: TriggerMode::Gate,
            command: command.into(),
        }
    }

    fn reaction(name: &str, command: &str) -> TriggerSpec {
        TriggerSpec {
            name: name.into(),
            mode: TriggerMode::Reaction,
            command: command.into(),
        }
    }

    #[tokio::test]
    async fn gate_trigger_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_before_triggers(&[gate("guard", "exit 2")], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::GateFailed { name, .. } if name == "guard"));
    }

    #[tokio::test]
    async fn gate_trigger_success_continues() {
        let dir = tempfile::tempdir().unwrap();
        run_before_triggers(&[gate("guard", "true"), gate("guard2", "true")], dir.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reaction_failure_is_never_fatal() {
        let dir = tempfile::tempdir().unwrap();
        run_before_triggers(&[reaction("notify", "exit 1")], dir.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reactions_actually_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("fired");
        let command = format!("touch {}", marker.display());
        run_before_triggers(&[reaction("notify", &command)], dir.path())
            .await
            .unwrap();

        // Fire-and-forget: give the spawned task a moment.
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn lifecycle_triggers_fire_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("created");
        let mut lifecycle = LifecycleTriggers::new(dir.path());
        lifecycle.register(
            LifecycleEvent::OnTaskCreated,
            gate("mark", &format!("touch {}", marker.display())),
        );

        lifecycle.fire(LifecycleEvent::OnTaskCompleted).await.unwrap();
        assert!(!marker.exists());

        lifecycle.fire(LifecycleEvent::OnTaskCreated).await.unwrap();
        assert!(marker.exists());
    }
}
