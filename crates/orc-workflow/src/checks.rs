use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orc_core::plan::{CheckKind, OnCheckFailure, QualityCheckSpec};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a finished check means for the phase, after applying its
/// `on_failure` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckDisposition {
    Passed,
    /// Failed with `block`: the phase completion is rejected.
    Blocked,
    /// Failed with `warn`: recorded, completion stands.
    Warned,
    /// Failed with `skip`, or the check could not run and was skipped.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub label: String,
    pub command: String,
    pub disposition: CheckDisposition,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr tail, kept short enough to feed back into the
    /// next iteration's prompt.
    pub output: String,
}

impl CheckResult {
    pub fn blocks(&self) -> bool {
        self.disposition == CheckDisposition::Blocked
    }
}

/// Failure context string injected into the next iteration when a blocking
/// check rejects the completion.
pub fn failure_context(results: &[CheckResult]) -> String {
    let mut context = String::from("Quality checks failed:\n");
    for result in results.iter().filter(|r| r.blocks()) {
        context.push_str(&format!(
            "- `{}` exited with {:?}:\n{}\n",
            result.command, result.exit_code, result.output
        ));
    }
    context
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

const OUTPUT_TAIL: usize = 4_000;

/// Run the phase's checks in order. Checks always all run; dispositions are
/// reported per check and the caller decides whether the phase completion
/// stands.
pub async fn run_checks(
    specs: &[QualityCheckSpec],
    commands: &HashMap<String, String>,
    workdir: &Path,
) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(specs.len());

    for spec in specs {
        let (label, command) = match &spec.kind {
            CheckKind::Code { name } => match commands.get(name) {
                Some(cmd) => (name.clone(), cmd.clone()),
                None => {
                    warn!(check = %name, "no such command in project registry; skipping");
                    results.push(CheckResult {
                        label: name.clone(),
                        command: String::new(),
                        disposition: CheckDisposition::Skipped,
                        exit_code: None,
                        output: format!("command '{name}' is not registered"),
                    });
                    continue;
                }
            },
            CheckKind::Custom { command } => ("custom".to_string(), command.clone()),
        };

        let result = run_one(&label, &command, spec.on_failure, workdir).await;
        results.push(result);
    }

    results
}

async fn run_one(
    label: &str,
    command: &str,
    on_failure: OnCheckFailure,
    workdir: &Path,
) -> CheckResult {
    info!(check = %label, command = %command, "running quality check");

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => CheckResult {
            label: label.to_string(),
            command: command.to_string(),
            disposition: CheckDisposition::Passed,
            exit_code: output.status.code(),
            output: String::new(),
        },
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let tail = tail_of(&combined, OUTPUT_TAIL);
            let disposition = match on_failure {
                OnCheckFailure::Block => CheckDisposition::Blocked,
                OnCheckFailure::Warn => CheckDisposition::Warned,
                OnCheckFailure::Skip => CheckDisposition::Skipped,
            };
            warn!(check = %label, code = ?output.status.code(), ?disposition, "quality check failed");
            CheckResult {
                label: label.to_string(),
                command: command.to_string(),
                disposition,
                exit_code: output.status.code(),
                output: tail,
            }
        }
        Err(e) => {
            warn!(check = %label, error = %e, "quality check could not run");
            CheckResult {
                label: label.to_string(),
                command: command.to_string(),
                disposition: match on_failure {
                    OnCheckFailure::Block => CheckDisposition::Blocked,
                    OnCheckFailure::Warn => CheckDisposition::Warned,
                    OnCheckFailure::Skip => CheckDisposition::Skipped,
                },
                exit_code: None,
                output: e.to_string(),
            }
        }
    }
}

fn tail_of(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = s.len() - max;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    format!("…{}", &s[cut..])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
