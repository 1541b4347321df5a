//! Kernel sessions: launching Jupyter and managing one kernel's lifecycle.

mod launcher;
mod manager;

pub use launcher::{JupyterLauncher, LaunchedServer, ProcessState, find_server_url};
pub use manager::{InterruptResult, KernelStatus, SessionManager, SessionState};
