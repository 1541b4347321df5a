//! The execution surface shown to UI callers.
//!
//! A [`Server`] hides whether the kernel is owned by this process
//! ([`LocalServer`]) or reached through a collaboration session.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::connection::{ConnectionInfo, LaunchInfo};
use crate::error::Result;
use crate::execute::{Cell, CellStream, ExecutionEngine};
use crate::session::{InterruptResult, SessionManager};

/// Which side of a collaboration session this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Local,
    Host,
    Guest,
}

/// One logical "run this code" operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub code: String,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub silent: bool,
}

impl ExecutionRequest {
    /// A visible request with a fresh id.
    pub fn new(code: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            file: file.into(),
            line,
            silent: false,
        }
    }
}

/// Kernel execution capability.
pub trait Server: Send + Sync {
    fn role(&self) -> Role;

    /// Bind to a running Jupyter server.
    fn connect(&self, launch: LaunchInfo, cancel: CancelToken) -> BoxFuture<'_, Result<()>>;

    fn execute_observable(&self, request: ExecutionRequest) -> CellStream;

    fn restart_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    fn interrupt_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<InterruptResult>>;

    fn get_sys_info(&self) -> BoxFuture<'_, Option<Cell>>;

    fn connection_info(&self) -> Option<ConnectionInfo>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}

/// A server whose kernel is owned by this process.
pub struct LocalServer {
    engine: ExecutionEngine,
}

impl LocalServer {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            engine: ExecutionEngine::new(session),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        self.engine.session()
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Launch a local Jupyter server and connect to it.
    pub async fn start(&self, use_default_config: bool, cancel: &CancelToken) -> Result<ConnectionInfo> {
        self.session().start(use_default_config, cancel).await
    }
}

impl Server for LocalServer {
    fn role(&self) -> Role {
        Role::Local
    }

    fn connect(&self, launch: LaunchInfo, cancel: CancelToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.session().connect(launch, &cancel).await })
    }

    fn execute_observable(&self, request: ExecutionRequest) -> CellStream {
        self.engine.execute_observable(
            &request.code,
            &request.file,
            request.line,
            &request.id,
            request.silent,
        )
    }

    fn restart_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.session().restart_kernel(timeout))
    }

    fn interrupt_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<InterruptResult>> {
        Box::pin(self.session().interrupt_kernel(timeout))
    }

    fn get_sys_info(&self) -> BoxFuture<'_, Option<Cell>> {
        Box::pin(self.engine.get_sys_info())
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.session().connection_info()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.session().shutdown())
    }
}
