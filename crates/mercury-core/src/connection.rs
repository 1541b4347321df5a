//! How to reach a running Jupyter server.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::kernel::KernelSpec;

/// Connection details for a Jupyter server.
///
/// Immutable once a session starts; callers only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Base URL of the server, always ending in `/`.
    pub base_url: String,
    /// Auth token (empty when the server runs without one).
    pub token: String,
    /// Whether the server process was launched by this session.
    pub local_launch: bool,
    /// Exit code of the locally launched server, once it has exited.
    pub local_proc_exit_code: Option<i32>,
}

impl ConnectionInfo {
    /// Connection info for a remote server.
    pub fn remote(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url.into()),
            token: token.into(),
            local_launch: false,
            local_proc_exit_code: None,
        }
    }

    /// Connection info for a server launched by this process.
    pub fn local(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            local_launch: true,
            ..Self::remote(base_url, token)
        }
    }

    /// Join a relative API path onto the base URL.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// WebSocket form of an API path (`http` → `ws`, `https` → `wss`).
    pub fn ws_url(&self, path: &str) -> String {
        let http = self.api_url(path);
        if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            http
        }
    }

    /// Parse a server URL as printed by `jupyter notebook`
    /// (e.g. `http://localhost:8888/?token=abc`).
    pub fn from_server_url(url: &str, local_launch: bool) -> Option<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }
        let (base, query) = match url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (url, None),
        };
        let token = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .find_map(|pair| pair.strip_prefix("token="))
            .unwrap_or_default();

        // Strip a trailing UI page such as `tree` so API paths resolve.
        let base = base.trim_end_matches("tree").trim_end_matches("lab");

        Some(Self {
            base_url: normalize_base_url(base.to_string()),
            token: token.to_string(),
            local_launch,
            local_proc_exit_code: None,
        })
    }
}

fn normalize_base_url(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Everything `connect` needs to bind a session.
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    /// Server to connect to.
    pub connection_info: ConnectionInfo,
    /// Kernel spec to start; the server default when `None`.
    pub kernel_spec: Option<KernelSpec>,
    /// Notebook path to associate the kernel session with.
    pub notebook_path: Option<PathBuf>,
}

impl LaunchInfo {
    pub fn new(connection_info: ConnectionInfo) -> Self {
        Self {
            connection_info,
            kernel_spec: None,
            notebook_path: None,
        }
    }

    pub fn with_kernel_spec(mut self, spec: KernelSpec) -> Self {
        self.kernel_spec = Some(spec);
        self
    }
}
