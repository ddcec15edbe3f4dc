//! On-disk project layout.
//!
//! `.orc/` in the project root holds the embedded database, the ephemeral
//! worktrees directory, shared prompts, and the project config. Each task
//! additionally mirrors its state into a human-readable directory of YAML
//! files for review in git; the database is the source of truth and wins on
//! conflict.

use std::path::{Path, PathBuf};

use orc_core::id::TaskId;
use orc_core::plan::Plan;
use orc_core::types::{ExecutionState, Task};

pub const ORC_DIR: &str = ".orc";
pub const DB_FILE: &str = ".orc/orc.db";
pub const TASKS_DIR: &str = ".orc/tasks";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root
            .join(TASKS_DIR)
            .join(task_id.to_string().to_lowercase())
    }

    /// Create `.orc/` and seed its `.gitignore` so the database, worktrees,
    /// PID files, and locks never reach the repository.
    pub fn ensure(&self) -> Result<(), LayoutError> {
        let orc = self.root.join(ORC_DIR);
        std::fs::create_dir_all(orc.join("worktrees"))?;
        std::fs::create_dir_all(self.root.join(TASKS_DIR))?;

        let gitignore = orc.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(
                &gitignore,
                "orc.db*\nworktrees/\npid\nlocks/\nconfig.local.yaml\n",
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // YAML mirror
    // -----------------------------------------------------------------------

    /// Write the task's reviewable mirror: `task.yaml`, `plan.yaml`,
    /// `state.yaml` under the task directory.
    pub fn mirror_task(
        &self,
        task: &Task,
        plan: Option<&Plan>,
        state: Option<&ExecutionState>,
    ) -> Result<(), LayoutError> {
        let dir = self.task_dir(&task.id);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join("transcripts"))?;

        std::fs::write(dir.join("task.yaml"), serde_yaml::to_string(task)?)?;
        if let Some(plan) = plan {
            std::fs::write(dir.join("plan.yaml"), serde_yaml::to_string(plan)?)?;
        }
        if let Some(state) = state {
            std::fs::write(dir.join("state.yaml"), serde_yaml::to_string(state)?)?;
        }
        Ok(())
    }

    /// Append a transcript line to the per-task mirror file.
    pub fn mirror_transcript(
        &self,
        task_id: &TaskId,
        phase: &str,
        iteration: u32,
        line: &str,
    ) -> Result<(), LayoutError> {
        use std::io::Write;
        let dir = self.task_dir(task_id).join("transcripts");
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(format!("{phase}-{iteration:02}.md"));
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
