//! Kernel connection seam.
//!
//! The session manager owns exactly one [`KernelConnection`]; the execution
//! engine borrows it per request. Connections are produced by a
//! [`KernelConnector`] from [`LaunchInfo`], which lets the Jupyter server
//! gateway be swapped for an in-process kernel in tests.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::connection::LaunchInfo;
use crate::error::Result;

use super::messages::{ExecuteReply, ExecuteRequest, IoPubMessage};

/// A submitted execute request.
///
/// IOPub messages for the request arrive on `messages` in kernel order;
/// `done` resolves once the kernel has replied and gone idle. Every message
/// is sent before `done` resolves.
pub struct ExecuteHandle {
    /// `msg_id` of the request.
    pub msg_id: String,
    /// IOPub messages parented to the request.
    pub messages: mpsc::UnboundedReceiver<IoPubMessage>,
    /// Completion: the reply, or an error if the kernel died first.
    pub done: oneshot::Receiver<Result<ExecuteReply>>,
}

/// A live connection to one kernel.
pub trait KernelConnection: Send + Sync {
    /// Identifier of the kernel (server-side kernel id).
    fn kernel_id(&self) -> &str;

    /// Submit an execute request.
    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<ExecuteHandle>>;

    /// Ask the kernel to interrupt the running request.
    fn interrupt(&self) -> BoxFuture<'_, Result<()>>;

    /// Restart the kernel in place.
    fn restart(&self) -> BoxFuture<'_, Result<()>>;

    /// Shut the kernel down and release the connection.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}

/// Creates kernel connections for a session.
pub trait KernelConnector: Send + Sync {
    fn connect(&self, launch: &LaunchInfo) -> BoxFuture<'_, Result<Arc<dyn KernelConnection>>>;
}
