//! Phase prompt assembly.
//!
//! Each phase is built from a template (a project prompt file when one
//! exists, a built-in otherwise), the task description, and whatever
//! context the current iteration carries: retry context from a failed later
//! phase, quality-check failures from the previous iteration, or a human
//! clarification.

use std::path::PathBuf;

use orc_core::config::ConfigResolver;
use orc_core::plan::PhaseSpec;
use orc_core::types::{RetryContext, Task};

pub struct PromptBuilder {
    project_root: PathBuf,
}

impl PromptBuilder {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn build(
        &self,
        task: &Task,
        spec: &PhaseSpec,
        markers: &[String],
        retry: Option<&RetryContext>,
        failure_context: Option<&str>,
        clarification: Option<&str>,
    ) -> String {
        let template = self.template_for(&spec.template_id);

        let mut prompt = format!("# Task {}: {}\n\n", task.id, task.title);
        if let Some(description) = &task.description {
            prompt.push_str(description);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&template);
        prompt.push('\n');

        if let Some(retry) = retry {
            prompt.push_str(&format!(
                "\nA previous run of '{}' failed and routed back here \
                 (attempt {}). Failure:\n{}\n",
                retry.from_phase, retry.attempt, retry.reason
            ));
        }
        if let Some(context) = failure_context {
            prompt.push_str("\n");
            prompt.push_str(context);
            prompt.push_str("\nFix these failures before declaring completion.\n");
        }
        if let Some(clarification) = clarification {
            prompt.push_str(&format!("\nClarification from reviewer:\n{clarification}\n"));
        }

        if let Some(marker) = markers.first() {
            prompt.push_str(&format!(
                "\nWhen this phase is fully complete, end your final message \
                 with the exact line: {marker}\n"
            ));
        }
        prompt
    }

    /// Project prompt file wins over the built-in template; a personal file
    /// of the same name shadows the shared one whole-file.
    fn template_for(&self, template_id: &str) -> String {
        if let Some(path) = ConfigResolver::resolve_prompt_path(&self.project_root, template_id) {
            if let Ok(content) = std::fs::read_to_string(&path) {
                return content;
            }
        }
        builtin_template(template_id).to_string()
    }
}

fn builtin_template(template_id: &str) -> &'static str {
    match template_id {
        "research" => {
            "Research the codebase as it relates to this task. Identify the \
             modules involved, existing patterns to follow, and risks. Write \
             your findings to the task's research.md."
        }
        "spec" => {
            "Write a concise implementation spec for this task: behaviour, \
             edge cases, and the tests that will prove it. Save it as the \
             task's spec.md."
        }
        "implement" => {
            "Implement this task. Follow the project's existing conventions, \
             keep changes minimal, and update or add tests alongside the \
             code."
        }
        "test" => {
            "Run the project's test suite and fix any failures caused by \
             this task. Add missing coverage for the new behaviour."
        }
        "validate" => {
            "Validate the task end to end: run the full check suite, verify \
             the acceptance criteria, and summarise what was verified."
        }
        _ => "Continue working on this task until the phase's goal is met.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::id::TaskId;
    use orc_core::types::TaskWeight;

    fn task() -> Task {
        let mut t = Task::new(TaskId::new(9), "proj", "add retries", TaskWeight::Small);
        t.description = Some("Retry transient failures with backoff.".into());
        t
    }

    #[test]
    fn prompt_includes_task_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let builder = PromptBuilder::new(dir.path());
        let prompt = builder.build(
            &task(),
            &PhaseSpec::new("implement"),
            &["PHASE_COMPLETE".to_string()],
            None,
            None,
            None,
        );
        assert!(prompt.contains("TASK-009"));
        assert!(prompt.contains("Retry transient failures"));
        assert!(prompt.contains("PHASE_COMPLETE"));
    }

    #[test]
    fn retry_and_failure_context_are_injected() {
        let dir = tempfile::tempdir().unwrap();
        let builder = PromptBuilder::new(dir.path());
        let retry = RetryContext {
            from_phase: "test".into(),
            reason: "2 assertions failed".into(),
            attempt: 1,
            failed_at: chrono::Utc::now(),
        };
        let prompt = builder.build(
            &task(),
            &PhaseSpec::new("implement"),
            &[],
            Some(&retry),
            Some("Quality checks failed:\n- `cargo test` exited"),
            None,
        );
        assert!(prompt.contains("routed back here"));
        assert!(prompt.contains("2 assertions failed"));
        assert!(prompt.contains("Quality checks failed"));
    }

    #[test]
    fn project_prompt_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join(".orc/prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("implement.md"), "House style: use hexagons.").unwrap();

        let builder = PromptBuilder::new(dir.path());
        let prompt = builder.build(&task(), &PhaseSpec::new("implement"), &[], None, None, None);
        assert!(prompt.contains("hexagons"));
        assert!(!prompt.contains("project's existing conventions"));
    }
}
