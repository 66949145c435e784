//! Wire-format JSON-RPC types for the WebSocket surface (SPEC_FULL.md §4.E, §6).
//!
//! Tagged Rust enums cover every recognized `method`/shape; a raw
//! `serde_json::Value` carrier is reserved for the `unhandled` case
//! (§9) — this module is the only place that needs the untyped escape
//! hatch, per the router's mandate.

use acp_relay_common::MessageKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame's classification, decided purely from which fields are
/// present (§4.E):
/// - `method` and `id` present → Request
/// - `id` present, `method` absent → Response
/// - `method` present, `id` absent → Notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Notification,
    Malformed,
}

pub fn classify(frame: &Value) -> FrameKind {
    let Some(obj) = frame.as_object() else {
        return FrameKind::Malformed;
    };
    let has_method = obj.contains_key("method");
    let has_id = obj.contains_key("id");
    match (has_method, has_id) {
        (true, true) => FrameKind::Request,
        (false, true) => FrameKind::Response,
        (true, false) => FrameKind::Notification,
        (false, false) => FrameKind::Malformed,
    }
}

/// `session/new` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionParams {
    #[serde(rename = "workingDirectory")]
    pub working_directory: String,
}

/// `session/prompt` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub content: Vec<PromptContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptContent {
    Text { text: String },
}

/// `session/cancel` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `session/resume` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Methods a relay client may send as a request (§6).
#[derive(Debug, Clone)]
pub enum ClientRequestMethod {
    SessionNew(NewSessionParams),
    SessionPrompt(PromptParams),
    SessionCancel(CancelParams),
    SessionResume(ResumeParams),
    /// Any method the router doesn't special-case; forwarded verbatim to
    /// the session's adapter when `sessionId` is present in params.
    Unhandled { method: String, params: Value },
}

/// Parses a request frame's `method`/`params` into a typed variant,
/// falling back to [`ClientRequestMethod::Unhandled`] for anything not
/// explicitly recognized (§9 "Dynamic JSON navigation" redesign note).
pub fn parse_client_request(method: &str, params: Value) -> ClientRequestMethod {
    match method {
        "session/new" => serde_json::from_value(params.clone())
            .map(ClientRequestMethod::SessionNew)
            .unwrap_or(ClientRequestMethod::Unhandled {
                method: method.to_string(),
                params,
            }),
        "session/prompt" => serde_json::from_value(params.clone())
            .map(ClientRequestMethod::SessionPrompt)
            .unwrap_or(ClientRequestMethod::Unhandled {
                method: method.to_string(),
                params,
            }),
        "session/cancel" => serde_json::from_value(params.clone())
            .map(ClientRequestMethod::SessionCancel)
            .unwrap_or(ClientRequestMethod::Unhandled {
                method: method.to_string(),
                params,
            }),
        "session/resume" => serde_json::from_value(params.clone())
            .map(ClientRequestMethod::SessionResume)
            .unwrap_or(ClientRequestMethod::Unhandled {
                method: method.to_string(),
                params,
            }),
        other => ClientRequestMethod::Unhandled {
            method: other.to_string(),
            params,
        },
    }
}

/// The `sessionUpdate` tag carried by `session/update` notifications (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AvailableCommandsUpdate {
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    ToolUse {
        tool: ToolDescriptor,
    },
    AgentThinking,
    AgentThoughtChunk {
        content: TextContent,
    },
    AgentMessageChunk {
        content: TextContent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableCommand {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// `session/request_permission`: a request *from* the agent to the
/// client. The router must preserve its `id` end-to-end so the client's
/// response is deliverable back to the agent (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPermissionParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "toolCall")]
    pub tool_call: ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "rawInput")]
    pub raw_input: Value,
}

/// Reduces a frame the agent emitted (or a client sent) into the
/// client-visible `(kind, content, aux)` triple the Message store records
/// (§3 "Message"). Returns `None` for frames with no sensible display
/// form (bare acknowledgements, frames missing the fields this needs).
pub fn classify_message(frame: &Value) -> Option<(MessageKind, String, Option<Value>)> {
    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        return match method {
            "session/chunk" => {
                let content = params.get("content").and_then(Value::as_str)?.to_string();
                Some((MessageKind::Agent, content, None))
            }
            "session/complete" => {
                let content = match params.get("reason").and_then(Value::as_str) {
                    Some(reason) => format!("session complete ({reason})"),
                    None => "session complete".to_string(),
                };
                Some((MessageKind::System, content, None))
            }
            "session/update" => {
                let update: SessionUpdate = serde_json::from_value(params.get("update")?.clone()).ok()?;
                Some(classify_session_update(&update))
            }
            "session/request_permission" => {
                let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
                let name = tool_call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown tool");
                Some((
                    MessageKind::PermissionRequest,
                    format!("permission requested for {name}"),
                    Some(tool_call),
                ))
            }
            "session/prompt" => {
                let text: String = params
                    .get("content")?
                    .as_array()?
                    .iter()
                    .filter_map(|c| c.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("");
                Some((MessageKind::User, text, None))
            }
            // Control-plane requests (`session/new`, `session/cancel`,
            // `session/resume`) have no chat-visible content of their own.
            "session/new" | "session/cancel" | "session/resume" => None,
            other => Some((MessageKind::Unhandled, other.to_string(), Some(params))),
        };
    }

    if frame.get("result").and_then(|r| r.get("outcome")).is_some() {
        return Some((
            MessageKind::PermissionResponse,
            "permission response".to_string(),
            frame.get("result").cloned(),
        ));
    }

    None
}

fn classify_session_update(update: &SessionUpdate) -> (MessageKind, String, Option<Value>) {
    match update {
        SessionUpdate::AvailableCommandsUpdate { available_commands } => (
            MessageKind::AvailableCommands,
            format!("{} commands available", available_commands.len()),
            serde_json::to_value(available_commands).ok(),
        ),
        SessionUpdate::ToolUse { tool } => (
            MessageKind::ToolUse,
            format!("using tool {}", tool.name),
            None,
        ),
        SessionUpdate::AgentThinking => (MessageKind::Thinking, String::new(), None),
        SessionUpdate::AgentThoughtChunk { content } => {
            (MessageKind::ThoughtChunk, content.text.clone(), None)
        }
        SessionUpdate::AgentMessageChunk { content } => {
            (MessageKind::Agent, content.text.clone(), None)
        }
    }
}

/// Builds the JSON-RPC error object `{code, message}` for a wire reply
/// (§6, §7).
pub fn error_object(code: i32, message: impl Into<String>) -> Value {
    serde_json::json!({ "code": code, "message": message.into() })
}

pub const ERROR_UNKNOWN_METHOD: i32 = -32601;
pub const ERROR_BAD_PARAMS: i32 = -32602;
pub const ERROR_INTERNAL: i32 = -32603;
pub const ERROR_SESSION: i32 = -32000;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request_response_and_notification() {
        assert_eq!(
            classify(&json!({"method": "session/new", "id": 1})),
            FrameKind::Request
        );
        assert_eq!(classify(&json!({"id": 1, "result": {}})), FrameKind::Response);
        assert_eq!(
            classify(&json!({"method": "session/chunk", "params": {}})),
            FrameKind::Notification
        );
        assert_eq!(classify(&json!({"foo": "bar"})), FrameKind::Malformed);
    }

    #[test]
    fn parses_known_methods_into_typed_variants() {
        let parsed = parse_client_request(
            "session/new",
            json!({"workingDirectory": "/w"}),
        );
        assert!(matches!(parsed, ClientRequestMethod::SessionNew(p) if p.working_directory == "/w"));
    }

    #[test]
    fn unknown_methods_fall_back_to_unhandled() {
        let parsed = parse_client_request("session/frobnicate", json!({"x": 1}));
        assert!(matches!(parsed, ClientRequestMethod::Unhandled { method, .. } if method == "session/frobnicate"));
    }

    #[test]
    fn malformed_params_for_known_method_fall_back_to_unhandled() {
        let parsed = parse_client_request("session/new", json!({"nope": true}));
        assert!(matches!(parsed, ClientRequestMethod::Unhandled { .. }));
    }

    #[test]
    fn session_update_tags_round_trip() {
        let update = SessionUpdate::AgentMessageChunk {
            content: TextContent { text: "hi".into() },
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["sessionUpdate"], "agent_message_chunk");
        let back: SessionUpdate = serde_json::from_value(value).unwrap();
        assert!(matches!(back, SessionUpdate::AgentMessageChunk { content } if content.text == "hi"));
    }

    #[test]
    fn classify_message_maps_chunk_to_agent_kind() {
        let (kind, content, _) = classify_message(&json!({
            "method": "session/chunk",
            "params": {"sessionId": "s1", "content": "hello"}
        }))
        .unwrap();
        assert_eq!(kind, MessageKind::Agent);
        assert_eq!(content, "hello");
    }

    #[test]
    fn classify_message_maps_permission_request() {
        let (kind, _, aux) = classify_message(&json!({
            "method": "session/request_permission",
            "id": 42,
            "params": {"sessionId": "s1", "toolCall": {"toolCallId": "t1", "name": "write_file", "rawInput": {}}}
        }))
        .unwrap();
        assert_eq!(kind, MessageKind::PermissionRequest);
        assert_eq!(aux.unwrap()["toolCallId"], "t1");
    }

    #[test]
    fn classify_message_unhandled_method_is_preserved() {
        let (kind, content, _) = classify_message(&json!({
            "method": "session/something_new",
            "params": {"sessionId": "s1"}
        }))
        .unwrap();
        assert_eq!(kind, MessageKind::Unhandled);
        assert_eq!(content, "session/something_new");
    }

    #[test]
    fn classify_message_ignores_plain_acknowledgements() {
        assert!(classify_message(&json!({"id": 1, "result": {"sessionId": "abc"}})).is_none());
    }
}
