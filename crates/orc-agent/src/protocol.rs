use serde::{Deserialize, Serialize};

use orc_core::types::TokenUsage;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A tool invocation or result surfaced by the agent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub name: Option<String>,
    pub payload: serde_json::Value,
}

/// One usage block with its cost, as carried by a result message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Decoded messages from the agent's NDJSON stream.
///
/// Unknown message types are preserved as `Other` rather than dropped, so
/// transcripts stay faithful to what the tool emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentMessage {
    /// First message of a session. The session id is opaque: carried by
    /// value, never parsed.
    Init {
        session_id: String,
        model: Option<String>,
    },
    Assistant {
        text: String,
        #[serde(default)]
        tool_uses: Vec<ToolEvent>,
    },
    ToolResult {
        tool: Option<String>,
        content: String,
    },
    Result {
        sample: UsageSample,
        is_error: bool,
        text: Option<String>,
    },
    Error {
        message: String,
    },
    /// Synthetic progress marker emitted by the runner while the child is
    /// alive but silent.
    Heartbeat,
    Other {
        raw: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Extract the four token counters from any value holding a `usage` block.
fn usage_from(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    })
}

/// Decode one line of the stream.
pub fn parse_line(line: &str) -> Result<AgentMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let message = match msg_type {
        "system" => {
            let subtype = value.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
            match (subtype, value.get("session_id").and_then(|s| s.as_str())) {
                ("init", Some(session_id)) => AgentMessage::Init {
                    session_id: session_id.to_string(),
                    model: value
                        .get("model")
                        .and_then(|m| m.as_str())
                        .map(String::from),
                },
                _ => AgentMessage::Other { raw: value },
            }
        }
        "assistant" => {
            let mut text = String::new();
            let mut tool_uses = Vec::new();
            if let Some(content) = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
            {
                for block in content {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                                if !text.is_empty() {
                                    text.push('\n');
                                }
                                text.push_str(t);
                            }
                        }
                        Some("tool_use") => tool_uses.push(ToolEvent {
                            name: block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .map(String::from),
                            payload: block.get("input").cloned().unwrap_or_default(),
                        }),
                        _ => {}
                    }
                }
            }
            AgentMessage::Assistant { text, tool_uses }
        }
        "tool_use" => AgentMessage::Assistant {
            text: String::new(),
            tool_uses: vec![ToolEvent {
                name: value.get("name").and_then(|n| n.as_str()).map(String::from),
                payload: value.get("input").cloned().unwrap_or_default(),
            }],
        },
        "tool_result" => AgentMessage::ToolResult {
            tool: value
                .get("tool_name")
                .and_then(|n| n.as_str())
                .map(String::from),
            content: value
                .get("content")
                .map(|c| match c.as_str() {
                    Some(s) => s.to_string(),
                    None => c.to_string(),
                })
                .unwrap_or_default(),
        },
        "result" | "usage" => {
            let usage = usage_from(&value).unwrap_or_default();
            AgentMessage::Result {
                sample: UsageSample {
                    usage,
                    cost_usd: value
                        .get("cost_usd")
                        .or_else(|| value.get("total_cost_usd"))
                        .and_then(|c| c.as_f64())
                        .unwrap_or(0.0),
                },
                is_error: value
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false)
                    || value.get("subtype").and_then(|s| s.as_str()) == Some("error"),
                text: value
                    .get("result")
                    .and_then(|r| r.as_str())
                    .map(String::from),
            }
        }
        "error" => AgentMessage::Error {
            message: value
                .get("message")
                .or_else(|| value.get("error"))
                .map(|m| match m.as_str() {
                    Some(s) => s.to_string(),
                    None => m.to_string(),
                })
                .unwrap_or_else(|| "unknown error".into()),
        },
        _ => AgentMessage::Other { raw: value },
    };

    Ok(message)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_carries_opaque_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"d3adb33f-x","model":"sonnet"}"#;
        match parse_line(line).unwrap() {
            AgentMessage::Init { session_id, model } => {
                assert_eq!(session_id, "d3adb33f-x");
                assert_eq!(model.as_deref(), Some("sonnet"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn assistant_text_and_tools() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"working on it"},
            {"type":"tool_use","name":"Bash","input":{"command":"cargo test"}}
        ]}}"#
            .replace('\n', "");
        match parse_line(&line).unwrap() {
            AgentMessage::Assistant { text, tool_uses } => {
                assert_eq!(text, "working on it");
                assert_eq!(tool_uses.len(), 1);
                assert_eq!(tool_uses[0].name.as_deref(), Some("Bash"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn result_surfaces_all_four_counters() {
        let line = r#"{"type":"result","subtype":"success","cost_usd":0.37,
            "usage":{"input_tokens":120,"output_tokens":800,
                     "cache_creation_input_tokens":4000,"cache_read_input_tokens":52000},
            "result":"done"}"#
            .replace('\n', "");
        match parse_line(&line).unwrap() {
            AgentMessage::Result { sample, is_error, text } => {
                assert!(!is_error);
                assert_eq!(text.as_deref(), Some("done"));
                assert_eq!(sample.usage.input_tokens, 120);
                assert_eq!(sample.usage.cache_creation_tokens, 4000);
                assert_eq!(sample.usage.cache_read_tokens, 52000);
                assert_eq!(sample.usage.effective_input(), 56_120);
                assert!((sample.cost_usd - 0.37).abs() < 1e-9);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_message_extracted() {
        let line = r#"{"type":"error","message":"rate limited"}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            AgentMessage::Error {
                message: "rate limited".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_preserved() {
        let line = r#"{"type":"telemetry","stuff":1}"#;
        assert!(matches!(
            parse_line(line).unwrap(),
            AgentMessage::Other { .. }
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_line("not json").is_err());
    }
}
