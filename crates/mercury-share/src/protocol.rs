//! Messages exchanged between a sharing host and its guests.
//!
//! Every frame on the wire is a [`PeerMessage`]. Requests and notifications
//! carry a method name and JSON params; the typed forms are [`HostRequest`]
//! and [`Notification`].

use mercury_core::{Cell, ExecutionRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One replicated piece of an execution's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerResponse {
    /// A snapshot of an execution's cells.
    ///
    /// `cells == None` marks the execution as complete.
    ExecuteObservable {
        code: String,
        /// Strictly increasing per execution id, starting at 1.
        pos: u64,
        cells: Option<Vec<Cell>>,
        id: String,
        time: u64,
    },

    /// The host's execution failed.
    Exception {
        message: String,
        time: u64,
        id: Option<String>,
    },
}

impl ServerResponse {
    /// When the host produced this response (ms since the epoch).
    pub fn time(&self) -> u64 {
        match self {
            Self::ExecuteObservable { time, .. } | Self::Exception { time, .. } => *time,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::ExecuteObservable { id, .. } => Some(id),
            Self::Exception { id, .. } => id.as_deref(),
        }
    }

    /// Rewrite the file of every carried cell.
    pub fn map_files(mut self, map: impl Fn(&str) -> String) -> Self {
        if let Self::ExecuteObservable {
            cells: Some(cells), ..
        } = &mut self
        {
            for cell in cells {
                cell.file = map(&cell.file);
            }
        }
        self
    }
}

/// Requests a guest sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum HostRequest {
    /// Fetch the host's connection info.
    Sync,

    GetSysInfo,

    #[serde(rename_all = "camelCase")]
    Restart { timeout_ms: u64 },

    #[serde(rename_all = "camelCase")]
    Interrupt { timeout_ms: u64 },

    /// The guest is detaching.
    DisposeServer,
}

/// Fire-and-forget messages in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Notification {
    /// Guest → host: replay buffered responses newer than `since`.
    CatchupRequest { since: u64 },

    /// Guest → host: run code on the host's kernel.
    ExecuteObservable(ExecutionRequest),

    /// Host → guests: one replicated response.
    ServerResponse(ServerResponse),
}

/// A single frame on a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PeerMessage {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },

    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// Split a typed call into its method name and params.
pub fn split_call<T: Serialize>(call: &T) -> serde_json::Result<(String, Value)> {
    let mut value = serde_json::to_value(call)?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = value.get_mut("params").map(Value::take).unwrap_or_default();
    Ok((method, params))
}

/// Rebuild a typed call from a method name and params.
pub fn join_call<T: DeserializeOwned>(method: &str, params: Value) -> serde_json::Result<T> {
    let mut call = Map::new();
    call.insert("method".to_string(), Value::String(method.to_string()));
    if !params.is_null() {
        call.insert("params".to_string(), params);
    }
    serde_json::from_value(Value::Object(call))
}
