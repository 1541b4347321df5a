//! Kernel session lifecycle.
//!
//! A [`SessionManager`] owns one kernel connection at a time and moves
//! through `Unconnected → Starting → Connected → {Interrupting, Restarting}
//! → Connected | Disconnected`. Executions are never serialized against
//! restarts. Instead every request is stamped with an issue time from the
//! session clock and anything issued before the current start time is stale.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cancel::CancelToken;
use crate::clock::SessionClock;
use crate::config::MercuryConfig;
use crate::connection::{ConnectionInfo, LaunchInfo};
use crate::error::{Error, Result};
use crate::kernel::{ExecutionState, KernelConnection, KernelConnector, KernelSpec};

use super::launcher::{JupyterLauncher, LaunchedServer};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Starting,
    Connected,
    Interrupting,
    Restarting,
    /// Terminal.
    Disconnected,
}

/// Kernel busy signal published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Idle,
    Busy,
    Disconnected,
}

/// Outcome of [`SessionManager::interrupt_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptResult {
    Success,
    TimedOut,
    Restarted,
}

struct Inner {
    state: SessionState,
    kernel: Option<Arc<dyn KernelConnection>>,
    launch: Option<LaunchInfo>,
    server: Option<LaunchedServer>,
    use_default_config: bool,
}

/// Owns the lifecycle of one kernel session.
pub struct SessionManager {
    id: String,
    config: MercuryConfig,
    connector: Arc<dyn KernelConnector>,
    launcher: Option<JupyterLauncher>,
    kernel_spec: Option<KernelSpec>,
    clock: SessionClock,
    fence: watch::Sender<u64>,
    status: watch::Sender<KernelStatus>,
    inner: Mutex<Inner>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(config: MercuryConfig, connector: Arc<dyn KernelConnector>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            connector,
            launcher: None,
            kernel_spec: None,
            clock: SessionClock::new(),
            fence: watch::Sender::new(0),
            status: watch::Sender::new(KernelStatus::Idle),
            inner: Mutex::new(Inner {
                state: SessionState::Unconnected,
                kernel: None,
                launch: None,
                server: None,
                use_default_config: false,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Enable [`start`](Self::start) with a Jupyter launcher.
    pub fn with_launcher(mut self, launcher: JupyterLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Kernel spec used for sessions created by [`start`](Self::start).
    pub fn with_kernel_spec(mut self, spec: KernelSpec) -> Self {
        self.kernel_spec = Some(spec);
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.inner().state = state;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &MercuryConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// Stamp a new request with an issue time.
    pub fn issue_time(&self) -> u64 {
        self.clock.tick()
    }

    /// Current fence; work issued before it is stale.
    pub fn start_time(&self) -> u64 {
        *self.fence.borrow()
    }

    pub fn is_stale(&self, issue_time: u64) -> bool {
        issue_time < self.start_time()
    }

    fn advance_start_time(&self) -> u64 {
        let time = self.clock.tick();
        self.fence.send_replace(time);
        time
    }

    /// The live kernel connection.
    pub fn kernel(&self) -> Result<Arc<dyn KernelConnection>> {
        let inner = self.inner();
        match (&inner.kernel, inner.state) {
            (_, SessionState::Disconnected) => Err(Error::SessionDisposed),
            (Some(kernel), _) => Ok(kernel.clone()),
            (None, _) => Err(Error::SessionDisposed),
        }
    }

    /// Copy of the current connection info, with the local server's exit
    /// code filled in if it has exited.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let inner = self.inner();
        let mut info = inner.launch.as_ref()?.connection_info.clone();
        if let Some(server) = &inner.server {
            info.local_proc_exit_code = server.exit_code();
        }
        Some(info)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    /// Publish a kernel `status` message on the busy channel.
    pub fn report_status(&self, state: ExecutionState) {
        let status = match state {
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Starting | ExecutionState::Other => return,
        };
        if self.state() != SessionState::Disconnected {
            self.status.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
        }
    }

    /// Launch a local Jupyter server and connect to it.
    pub async fn start(
        &self,
        use_default_config: bool,
        cancel: &CancelToken,
    ) -> Result<ConnectionInfo> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            SessionState::Disconnected => return Err(Error::SessionDisposed),
            SessionState::Unconnected => {}
            _ => {
                if let Some(info) = self.connection_info() {
                    return Ok(info);
                }
            }
        }

        let launcher = self.launcher.as_ref().ok_or_else(|| Error::KernelStartFailure {
            message: "no Jupyter launcher configured".to_string(),
            exit_code: None,
        })?;

        self.set_state(SessionState::Starting);
        let server = match launcher.launch(use_default_config, cancel).await {
            Ok(server) => server,
            Err(e) => {
                self.set_state(SessionState::Unconnected);
                return Err(e);
            }
        };

        let info = server.connection_info().clone();
        let mut launch = LaunchInfo::new(info.clone());
        launch.kernel_spec = self.kernel_spec.clone();
        launch.notebook_path = server.notebook_dir().map(|d| d.join("mercury.ipynb"));
        {
            let mut inner = self.inner();
            inner.server = Some(server);
            inner.use_default_config = use_default_config;
        }

        if let Err(e) = self.connect_locked(launch, cancel).await {
            let server = self.inner().server.take();
            if let Some(mut server) = server {
                server.shutdown().await;
            }
            return Err(e);
        }
        Ok(info)
    }

    /// Bind to an already running server.
    pub async fn connect(&self, launch: LaunchInfo, cancel: &CancelToken) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            SessionState::Disconnected => Err(Error::SessionDisposed),
            SessionState::Unconnected => self.connect_locked(launch, cancel).await,
            _ => Ok(()),
        }
    }

    async fn connect_locked(&self, launch: LaunchInfo, cancel: &CancelToken) -> Result<()> {
        self.set_state(SessionState::Starting);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.connector.connect(&launch) => result,
        };

        match connected {
            Ok(kernel) => {
                tracing::info!(
                    "Session {} connected to kernel {} at {}",
                    self.id,
                    kernel.kernel_id(),
                    launch.connection_info.base_url
                );
                {
                    let mut inner = self.inner();
                    inner.kernel = Some(kernel);
                    inner.launch = Some(launch);
                    inner.state = SessionState::Connected;
                }
                self.advance_start_time();
                self.status.send_replace(KernelStatus::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Unconnected);
                Err(e)
            }
        }
    }

    /// Restart the kernel in place, falling back to a full teardown and
    /// reconnect if that fails or takes longer than `timeout`.
    pub async fn restart_kernel(&self, timeout: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let kernel = self.kernel()?;

        self.set_state(SessionState::Restarting);
        self.advance_start_time();
        tracing::info!("Restarting kernel {}", kernel.kernel_id());

        let restarted = match tokio::time::timeout(timeout, kernel.restart()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("In-place restart failed, reconnecting: {}", e);
                self.rebuild().await
            }
            Err(_) => {
                tracing::warn!("In-place restart timed out after {:?}, reconnecting", timeout);
                self.rebuild().await
            }
        };

        match restarted {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.advance_start_time();
                self.status.send_replace(KernelStatus::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Unconnected);
                self.status.send_replace(KernelStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear the session down and bring up a new kernel the same way.
    async fn rebuild(&self) -> Result<()> {
        let (launch, relaunch, use_default_config) = {
            let inner = self.inner();
            (
                inner.launch.clone(),
                inner.server.is_some(),
                inner.use_default_config,
            )
        };
        self.teardown().await;

        let cancel = CancelToken::new();
        if relaunch {
            let launcher = self.launcher.as_ref().ok_or(Error::SessionDisposed)?;
            let server = launcher.launch(use_default_config, &cancel).await?;
            let mut next = LaunchInfo::new(server.connection_info().clone());
            next.kernel_spec = launch.as_ref().and_then(|l| l.kernel_spec.clone());
            next.notebook_path = server.notebook_dir().map(|d| d.join("mercury.ipynb"));
            self.inner().server = Some(server);
            self.connect_locked(next, &cancel).await
        } else {
            let launch = launch.ok_or(Error::SessionDisposed)?;
            self.connect_locked(launch, &cancel).await
        }
    }

    /// Release the kernel connection and any launched server.
    async fn teardown(&self) {
        let (kernel, server) = {
            let mut inner = self.inner();
            (inner.kernel.take(), inner.server.take())
        };
        if let Some(kernel) = kernel {
            if let Err(e) = kernel.shutdown().await {
                tracing::warn!("Kernel shutdown failed: {}", e);
            }
        }
        if let Some(mut server) = server {
            server.shutdown().await;
        }
    }

    /// Interrupt the running request and wait for the kernel to go idle.
    pub async fn interrupt_kernel(&self, timeout: Duration) -> Result<InterruptResult> {
        let kernel = self.kernel()?;
        let before = self.start_time();
        let mut fence = self.fence.subscribe();
        let mut status = self.status.subscribe();

        {
            let mut inner = self.inner();
            if inner.state == SessionState::Connected {
                inner.state = SessionState::Interrupting;
            }
        }
        tracing::info!("Interrupting kernel {}", kernel.kernel_id());

        let settled = tokio::time::timeout(timeout, async {
            kernel.interrupt().await?;
            let result: Result<InterruptResult> = tokio::select! {
                biased;
                _ = fence.wait_for(|t| *t != before) => Ok(InterruptResult::Restarted),
                settled = status.wait_for(|s| *s != KernelStatus::Busy) => match settled.map(|s| *s) {
                    Ok(KernelStatus::Disconnected) | Err(_) => Err(Error::SessionDisposed),
                    Ok(_) => Ok(InterruptResult::Success),
                },
            };
            result
        })
        .await;
        let outcome = match settled {
            Ok(Ok(InterruptResult::Success)) if self.start_time() != before => {
                Ok(InterruptResult::Restarted)
            }
            Ok(result) => result,
            Err(_) => Ok(InterruptResult::TimedOut),
        };

        {
            let mut inner = self.inner();
            if inner.state == SessionState::Interrupting {
                inner.state = SessionState::Connected;
            }
        }
        outcome
    }

    /// Resolve once the kernel reports idle.
    pub async fn wait_for_idle(&self, timeout: Duration) -> Result<()> {
        let mut status = self.subscribe_status();
        let settled = tokio::time::timeout(
            timeout,
            status.wait_for(|s| *s != KernelStatus::Busy),
        )
        .await
        .map_err(|_| Error::Timeout(format!("kernel not idle after {:?}", timeout)))?;
        match settled.map(|s| *s) {
            Ok(KernelStatus::Idle) => Ok(()),
            _ => Err(Error::SessionDisposed),
        }
    }

    /// Dispose the kernel, the local server, and its temp directory.
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == SessionState::Disconnected {
            return Ok(());
        }
        tracing::info!("Shutting down session {}", self.id);
        self.set_state(SessionState::Disconnected);
        self.teardown().await;
        self.status.send_replace(KernelStatus::Disconnected);
        Ok(())
    }
}
