use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use orc_core::types::TokenUsage;

use crate::protocol::{parse_line, AgentMessage, UsageSample};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("turn timed out after {0}s")]
    TurnTimeout(u64),

    #[error("agent idle for {0}s; cancelled")]
    IdleTimeout(u64),

    #[error("agent stream error: {0}")]
    Stream(String),

    #[error("agent exited with status {0}")]
    Exited(i32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Config / spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The agent CLI binary (e.g. `claude`).
    pub command: String,
    pub model: String,
    pub turn_timeout: Duration,
    /// Silence longer than this logs a warning and emits a heartbeat;
    /// silence longer than twice this cancels the turn.
    pub idle_timeout: Duration,
    /// How long to wait after a cooperative signal before terminating.
    pub cancel_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            model: "sonnet".into(),
            turn_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct TurnSpec {
    pub workdir: PathBuf,
    pub prompt: String,
    /// Opaque session id to resume, if any.
    pub resume_session: Option<String>,
}

/// Aggregate of a completed (or cancelled) turn.
#[derive(Debug, Clone, Default)]
pub struct TurnSummary {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub final_text: String,
    /// One sample per result/usage message, in stream order.
    pub samples: Vec<UsageSample>,
    pub usage_total: TokenUsage,
    pub cost_usd: f64,
    pub tool_events: u32,
    pub cancelled: bool,
    pub had_error: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// TurnHandle
// ---------------------------------------------------------------------------

/// A running turn: a lazy message sequence plus the final summary.
pub struct TurnHandle {
    pub messages: flume::Receiver<AgentMessage>,
    cancel_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<Result<TurnSummary>>,
}

impl TurnHandle {
    /// Request cooperative cancellation: the child is signalled, in-flight
    /// work gets a grace window, then the process is terminated.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the turn to finish and return its summary.
    pub async fn finish(self) -> Result<TurnSummary> {
        self.join
            .await
            .map_err(|e| AgentError::Stream(format!("turn task panicked: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

pub struct AgentRunner {
    config: AgentConfig,
}

impl AgentRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn argv(&self, spec: &TurnSpec) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            spec.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            self.config.model.clone(),
        ];
        if let Some(session) = &spec.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        args
    }

    /// Spawn one turn. Messages arrive on the returned channel in stream
    /// order; the summary is available once the stream ends.
    pub fn spawn_turn(&self, spec: TurnSpec) -> Result<TurnHandle> {
        let args = self.argv(&spec);
        let mut child = Command::new(&self.config.command)
            .args(&args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", self.config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("no stdout handle".into()))?;

        let (tx, rx) = flume::bounded(256);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let config = self.config.clone();

        let join = tokio::spawn(drive_turn(child, stdout, tx, cancel_rx, config));

        Ok(TurnHandle {
            messages: rx,
            cancel_tx,
            join,
        })
    }
}

// ---------------------------------------------------------------------------
// The stream loop
// ---------------------------------------------------------------------------

async fn drive_turn(
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    tx: flume::Sender<AgentMessage>,
    mut cancel_rx: watch::Receiver<bool>,
    config: AgentConfig,
) -> Result<TurnSummary> {
    let started = Instant::now();
    let deadline = started + config.turn_timeout;
    let mut summary = TurnSummary::default();
    let mut lines = BufReader::new(stdout).lines();
    let mut idle_strikes: u32 = 0;

    loop {
        let line = tokio::select! {
            biased;

            _ = cancel_rx.changed() => {
                info!("cancellation requested; signalling agent");
                summary.cancelled = true;
                cooperative_stop(&mut child, config.cancel_grace).await;
                break;
            }

            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                warn!(timeout_secs = config.turn_timeout.as_secs(), "turn timeout exceeded");
                cooperative_stop(&mut child, config.cancel_grace).await;
                summary.duration = started.elapsed();
                return Err(AgentError::TurnTimeout(config.turn_timeout.as_secs()));
            }

            read = tokio::time::timeout(config.idle_timeout, lines.next_line()) => {
                match read {
                    Err(_) => {
                        idle_strikes += 1;
                        if idle_strikes == 1 {
                            warn!(idle_secs = config.idle_timeout.as_secs(), "agent silent; heartbeat");
                            let _ = tx.try_send(AgentMessage::Heartbeat);
                            continue;
                        }
                        warn!("agent still silent; cancelling turn");
                        cooperative_stop(&mut child, config.cancel_grace).await;
                        summary.duration = started.elapsed();
                        return Err(AgentError::IdleTimeout(
                            config.idle_timeout.as_secs() * 2,
                        ));
                    }
                    Ok(Err(e)) => {
                        summary.duration = started.elapsed();
                        return Err(AgentError::Stream(e.to_string()));
                    }
                    Ok(Ok(None)) => break, // end of stream
                    Ok(Ok(Some(line))) => line,
                }
            }
        };

        idle_strikes = 0;
        if line.trim().is_empty() {
            continue;
        }

        let message = match parse_line(&line) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "skipping undecodable stream line");
                continue;
            }
        };

        absorb(&mut summary, &message);

        // A full channel or dropped receiver must not stall the child; the
        // summary still accumulates.
        let _ = tx.try_send(message);
    }

    summary.duration = started.elapsed();

    match child.wait().await {
        Ok(status) if status.success() || summary.cancelled => Ok(summary),
        Ok(status) => {
            if summary.had_error || summary.samples.is_empty() {
                Err(AgentError::Exited(status.code().unwrap_or(-1)))
            } else {
                // The tool streamed a result and then exited non-zero;
                // the stream content wins.
                Ok(summary)
            }
        }
        Err(e) => Err(AgentError::Io(e)),
    }
}

fn absorb(summary: &mut TurnSummary, message: &AgentMessage) {
    match message {
        AgentMessage::Init { session_id, model } => {
            summary.session_id = Some(session_id.clone());
            summary.model = model.clone();
        }
        AgentMessage::Assistant { text, tool_uses } => {
            if !text.is_empty() {
                summary.final_text = text.clone();
            }
            summary.tool_events += tool_uses.len() as u32;
        }
        AgentMessage::ToolResult { .. } => summary.tool_events += 1,
        AgentMessage::Result {
            sample,
            is_error,
            text,
        } => {
            summary.samples.push(*sample);
            summary.usage_total.input_tokens += sample.usage.input_tokens;
            summary.usage_total.output_tokens += sample.usage.output_tokens;
            summary.usage_total.cache_creation_tokens += sample.usage.cache_creation_tokens;
            summary.usage_total.cache_read_tokens += sample.usage.cache_read_tokens;
            summary.cost_usd += sample.cost_usd;
            summary.had_error |= is_error;
            if let Some(text) = text {
                summary.final_text = text.clone();
            }
        }
        AgentMessage::Error { .. } => summary.had_error = true,
        AgentMessage::Heartbeat | AgentMessage::Other { .. } => {}
    }
}

/// Signal the child, give in-flight work a grace window, then terminate.
async fn cooperative_stop(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending SIGINT to our own child.
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("agent ignored signal; terminating");
        let _ = child.kill().await;
    }
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

/// Continuation prompt used when resuming a session after a crash or pause:
/// a summary of the last response plus where to pick up.
pub fn build_continuation_prompt(
    last_response: &str,
    phase: &str,
    iteration: u32,
) -> String {
    let mut tail = last_response.trim().to_string();
    const MAX: usize = 2_000;
    if tail.len() > MAX {
        let mut cut = tail.len() - MAX;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail = format!("…{}", &tail[cut..]);
    }
    format!(
        "Resuming phase '{phase}' at iteration {iteration}. \
         Your previous response ended with:\n\n{tail}\n\n\
         Continue from where you left off."
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("agent.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn config(command: &PathBuf) -> AgentConfig {
        AgentConfig {
            command: command.display().to_string(),
            model: "sonnet".into(),
            turn_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_and_summarises_a_turn() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(
            dir.path(),
            concat!(
                r#"echo '{"type":"system","subtype":"init","session_id":"sess-1","model":"sonnet"}'"#,
                "\n",
                r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"done implementing"}]}}'"#,
                "\n",
                r#"echo '{"type":"result","subtype":"success","cost_usd":0.2,"usage":{"input_tokens":10,"output_tokens":20,"cache_creation_input_tokens":30,"cache_read_input_tokens":40},"result":"done"}'"#,
            ),
        );
        let runner = AgentRunner::new(config(&cmd));
        let handle = runner
            .spawn_turn(TurnSpec {
                workdir: dir.path().to_path_buf(),
                prompt: "implement the thing".into(),
                resume_session: None,
            })
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(msg) = handle.messages.recv_async().await {
            kinds.push(msg);
        }
        let summary = handle.finish().await.unwrap();

        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
        assert_eq!(summary.final_text, "done");
        assert_eq!(summary.samples.len(), 1);
        assert_eq!(summary.usage_total.total(), 100);
        assert!((summary.cost_usd - 0.2).abs() < 1e-9);
        assert!(!summary.had_error);
        assert!(kinds.iter().any(|m| matches!(m, AgentMessage::Init { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_stops_a_hanging_agent() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(
            dir.path(),
            concat!(
                r#"echo '{"type":"system","subtype":"init","session_id":"sess-2"}'"#,
                "\n",
                "sleep 600",
            ),
        );
        let runner = AgentRunner::new(config(&cmd));
        let handle = runner
            .spawn_turn(TurnSpec {
                workdir: dir.path().to_path_buf(),
                prompt: "spin".into(),
                resume_session: None,
            })
            .unwrap();

        // Wait for init to ensure the child started.
        let first = handle.messages.recv_async().await.unwrap();
        assert!(matches!(first, AgentMessage::Init { .. }));

        let started = Instant::now();
        handle.cancel();
        let summary = handle.finish().await.unwrap();
        assert!(summary.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resume_passes_session_flag() {
        let runner = AgentRunner::new(AgentConfig::default());
        let args = runner.argv(&TurnSpec {
            workdir: PathBuf::from("."),
            prompt: "continue".into(),
            resume_session: Some("sess-9".into()),
        });
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "sess-9");
    }

    #[test]
    fn continuation_prompt_mentions_phase_and_tail() {
        let prompt = build_continuation_prompt("wrote the parser", "implement", 3);
        assert!(prompt.contains("phase 'implement'"));
        assert!(prompt.contains("iteration 3"));
        assert!(prompt.contains("wrote the parser"));
    }

    #[test]
    fn continuation_prompt_truncates_long_tails() {
        let long = "x".repeat(10_000);
        let prompt = build_continuation_prompt(&long, "test", 1);
        assert!(prompt.len() < 3_000);
        assert!(prompt.contains('…'));
    }
}
