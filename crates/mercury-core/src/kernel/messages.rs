//! Jupyter messaging types.
//!
//! Only the subset the execution engine consumes: execute requests and
//! replies, and the IOPub message kinds produced while a request runs.
//! IOPub messages are a closed enum; anything else decodes to
//! [`IoPubMessage::Unknown`] so it can be logged instead of silently lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::now_millis;

/// Protocol version spoken on kernel channels.
pub const PROTOCOL_VERSION: &str = "5.3";

/// MIME-type keyed payload (`text/plain`, `image/png`, ...).
pub type MimeBundle = Map<String, Value>;

/// Content of an `execute_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// Request as issued for cell execution: never stops on error, never
    /// asks for stdin, and only stores history for visible executions.
    pub fn new(code: impl Into<String>, silent: bool) -> Self {
        Self {
            code: code.into(),
            silent,
            store_history: !silent,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: false,
        }
    }
}

/// Outcome of an `execute_request` on the shell channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Kernel execution state as reported by `status` messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    #[default]
    Idle,
    #[serde(other)]
    Other,
}

/// Messages a kernel publishes on IOPub while a request runs.
#[derive(Debug, Clone, PartialEq)]
pub enum IoPubMessage {
    ExecuteResult {
        execution_count: Option<u32>,
        data: MimeBundle,
        metadata: Map<String, Value>,
    },
    ExecuteInput {
        code: String,
        execution_count: Option<u32>,
    },
    Status {
        execution_state: ExecutionState,
    },
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        metadata: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Anything else (`clear_output`, comm traffic, ...).
    Unknown { msg_type: String, content: Value },
}

#[derive(Deserialize)]
struct ResultContent {
    #[serde(default)]
    execution_count: Option<u32>,
    #[serde(default)]
    data: MimeBundle,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct InputContent {
    #[serde(default)]
    code: String,
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: ExecutionState,
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    text: String,
}

#[derive(Deserialize)]
struct ErrorContent {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

impl IoPubMessage {
    /// Decode an IOPub message from its `msg_type` and `content`.
    pub fn from_wire(msg_type: &str, content: Value) -> Self {
        let decoded = match msg_type {
            "execute_result" => serde_json::from_value::<ResultContent>(content.clone())
                .map(|c| IoPubMessage::ExecuteResult {
                    execution_count: c.execution_count,
                    data: c.data,
                    metadata: c.metadata,
                }),
            "execute_input" => serde_json::from_value::<InputContent>(content.clone()).map(|c| {
                IoPubMessage::ExecuteInput {
                    code: c.code,
                    execution_count: c.execution_count,
                }
            }),
            "status" => serde_json::from_value::<StatusContent>(content.clone()).map(|c| {
                IoPubMessage::Status {
                    execution_state: c.execution_state,
                }
            }),
            "stream" => serde_json::from_value::<StreamContent>(content.clone())
                .map(|c| IoPubMessage::Stream { name: c.name, text: c.text }),
            "display_data" | "update_display_data" => {
                serde_json::from_value::<ResultContent>(content.clone()).map(|c| {
                    IoPubMessage::DisplayData {
                        data: c.data,
                        metadata: c.metadata,
                    }
                })
            }
            "error" => serde_json::from_value::<ErrorContent>(content.clone()).map(|c| {
                IoPubMessage::Error {
                    ename: c.ename,
                    evalue: c.evalue,
                    traceback: c.traceback,
                }
            }),
            _ => {
                return IoPubMessage::Unknown {
                    msg_type: msg_type.to_string(),
                    content,
                };
            }
        };

        decoded.unwrap_or_else(|e| {
            tracing::debug!("Malformed {} message: {}", msg_type, e);
            IoPubMessage::Unknown {
                msg_type: msg_type.to_string(),
                content,
            }
        })
    }

    /// The wire `msg_type` for this message.
    pub fn msg_type(&self) -> &str {
        match self {
            IoPubMessage::ExecuteResult { .. } => "execute_result",
            IoPubMessage::ExecuteInput { .. } => "execute_input",
            IoPubMessage::Status { .. } => "status",
            IoPubMessage::Stream { .. } => "stream",
            IoPubMessage::DisplayData { .. } => "display_data",
            IoPubMessage::Error { .. } => "error",
            IoPubMessage::Unknown { msg_type, .. } => msg_type,
        }
    }

    /// Convenience constructor for a `text/plain` execute result.
    pub fn text_result(execution_count: u32, text: impl Into<String>) -> Self {
        let mut data = MimeBundle::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        IoPubMessage::ExecuteResult {
            execution_count: Some(execution_count),
            data,
            metadata: Map::new(),
        }
    }
}

/// Jupyter message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub date: String,
}

/// A Jupyter message as carried over the server's channels WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,
    /// `{}` for messages without a parent.
    #[serde(default)]
    pub parent_header: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub buffers: Vec<Value>,
}

impl WireMessage {
    /// Build a shell-channel request.
    pub fn shell_request(session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                username: "mercury".to_string(),
                session: session.to_string(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
                date: now_millis().to_string(),
            },
            parent_header: Value::Object(Map::new()),
            metadata: Value::Object(Map::new()),
            content,
            channel: Some("shell".to_string()),
            buffers: Vec::new(),
        }
    }

    /// `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_flags() {
        let req = ExecuteRequest::new("x = 1", false);
        assert!(!req.allow_stdin);
        assert!(!req.stop_on_error);
        assert!(req.store_history);

        let silent = ExecuteRequest::new("x = 1", true);
        assert!(!silent.store_history);
    }

    #[test]
    fn test_decode_known_kinds() {
        let msg = IoPubMessage::from_wire(
            "stream",
            json!({"name": "stdout", "text": "hello\n"}),
        );
        assert_eq!(
            msg,
            IoPubMessage::Stream {
                name: "stdout".to_string(),
                text: "hello\n".to_string()
            }
        );

        let msg = IoPubMessage::from_wire("status", json!({"execution_state": "busy"}));
        assert_eq!(
            msg,
            IoPubMessage::Status {
                execution_state: ExecutionState::Busy
            }
        );

        let msg = IoPubMessage::from_wire(
            "error",
            json!({"ename": "NameError", "evalue": "name 'x' is not defined", "traceback": []}),
        );
        assert_eq!(msg.msg_type(), "error");
    }

    #[test]
    fn test_decode_unknown_and_malformed() {
        let msg = IoPubMessage::from_wire("clear_output", json!({"wait": false}));
        assert!(matches!(msg, IoPubMessage::Unknown { ref msg_type, .. } if msg_type == "clear_output"));

        let msg = IoPubMessage::from_wire("stream", json!({"name": 3}));
        assert!(matches!(msg, IoPubMessage::Unknown { ref msg_type, .. } if msg_type == "stream"));
    }

    #[test]
    fn test_unrecognized_execution_state() {
        let msg = IoPubMessage::from_wire("status", json!({"execution_state": "dead"}));
        assert_eq!(
            msg,
            IoPubMessage::Status {
                execution_state: ExecutionState::Other
            }
        );
    }

    #[test]
    fn test_wire_message_parent_id() {
        let raw = json!({
            "header": {"msg_id": "m2", "msg_type": "status"},
            "parent_header": {"msg_id": "m1", "msg_type": "execute_request"},
            "content": {"execution_state": "idle"},
            "channel": "iopub"
        });
        let msg: WireMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.parent_msg_id(), Some("m1"));

        let orphan: WireMessage = serde_json::from_value(json!({
            "header": {"msg_id": "m3", "msg_type": "status"},
            "parent_header": {},
        }))
        .unwrap();
        assert_eq!(orphan.parent_msg_id(), None);
    }
}
