use std::path::Path;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(1),
        }
    }
}

/// Abstraction over git CLI operations so they can be mocked in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String>;
}

// ---------------------------------------------------------------------------
// RealGitRunner
// ---------------------------------------------------------------------------

/// Shells out to the `git` binary via tokio so git never blocks the
/// executor's runtime thread.
pub struct RealGitRunner;

#[async_trait]
impl GitRunner for RealGitRunner {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}

// ---------------------------------------------------------------------------
// Porcelain parsing
// ---------------------------------------------------------------------------

/// Parse `git status --porcelain` output into a list of changed paths.
pub fn parse_porcelain_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() >= 4)
        .map(|line| line[3..].to_string())
        .collect()
}

/// Parse `git diff --numstat` output into (path, additions, deletions).
pub fn parse_numstat(output: &str) -> Vec<(String, u32, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 3 {
                let additions = parts[0].parse::<u32>().unwrap_or(0);
                let deletions = parts[1].parse::<u32>().unwrap_or(0);
                Some((parts[2].to_string(), additions, deletions))
            } else {
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_paths() {
        let out = " M src/main.rs\nA  src/new.rs\n?? notes.txt\n";
        let paths = parse_porcelain_paths(out);
        assert_eq!(paths, vec!["src/main.rs", "src/new.rs", "notes.txt"]);
    }

    #[test]
    fn porcelain_empty() {
        assert!(parse_porcelain_paths("").is_empty());
    }

    #[test]
    fn numstat_parsing() {
        let out = "10\t2\tsrc/main.rs\n5\t0\tsrc/lib.rs\n";
        let entries = parse_numstat(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("src/main.rs".to_string(), 10, 2));
    }

    #[tokio::test]
    async fn real_runner_reports_version() {
        let out = RealGitRunner
            .run_git(Path::new("."), &["--version"])
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.stdout.contains("git version"));
    }
}
