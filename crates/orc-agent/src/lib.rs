//! Agent runner: spawns the external agent CLI as a child process and
//! consumes its line-delimited JSON message stream.
//!
//! The runner captures the opaque session id from the first init message,
//! surfaces token usage per result message (effective tokens include cache
//! creation and cache reads), and enforces turn and idle timeouts with a
//! progress heartbeat. Cancellation is cooperative first: signal, grace
//! window, then terminate.

pub mod protocol;
pub mod runner;

pub use protocol::{parse_line, AgentMessage, ToolEvent, UsageSample};
pub use runner::{
    build_continuation_prompt, AgentConfig, AgentError, AgentRunner, TurnHandle, TurnSpec,
    TurnSummary,
};
