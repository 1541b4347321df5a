//! The sharing guest: forwards everything to the host's kernel.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use mercury_core::{
    CancelToken, Cell, CellStream, ConnectionInfo, Error, ExecutionRequest, InterruptResult,
    LaunchInfo, MercuryConfig, Result, Role, Server, now_millis,
};
use serde_json::Value;

use crate::protocol::{HostRequest, Notification, ServerResponse, join_call};
use crate::queue::GuestResponseQueue;
use crate::rpc::{PeerHandler, PeerLink, RpcPeer};
use crate::translator::PathTranslator;

struct GuestHandler {
    queue: Arc<GuestResponseQueue>,
}

impl PeerHandler for GuestHandler {
    fn on_request(
        &self,
        _peer: RpcPeer,
        method: String,
        _params: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, String>> {
        Box::pin(async move { Err(format!("guests do not serve {}", method)) })
    }

    fn on_notification(&self, _peer: &RpcPeer, method: &str, params: Value) {
        match join_call::<Notification>(method, params) {
            Ok(Notification::ServerResponse(response)) => self.queue.push(response),
            Ok(other) => tracing::debug!("Ignoring notification from host: {:?}", other),
            Err(e) => tracing::warn!("Malformed notification {}: {}", method, e),
        }
    }

    fn on_closed(&self, _peer: &RpcPeer) {
        tracing::info!("Host disconnected");
        self.queue.push(ServerResponse::Exception {
            message: "host disconnected".to_string(),
            time: now_millis(),
            id: None,
        });
    }
}

/// A [`Server`] attached to a sharing host.
///
/// Guests never own kernel state; every operation is a call to the host.
pub struct GuestServer {
    peer: RpcPeer,
    queue: Arc<GuestResponseQueue>,
    translator: Arc<dyn PathTranslator>,
    start_time: u64,
    connection_info: Option<ConnectionInfo>,
    /// Bound on waiting for the host during attach and detach.
    answer_timeout: Duration,
}

impl GuestServer {
    /// Attach to a host over `link`.
    ///
    /// Syncs connection info, then asks the host to replay responses
    /// produced since this guest started.
    pub async fn attach(
        link: PeerLink,
        translator: Arc<dyn PathTranslator>,
        config: &MercuryConfig,
    ) -> Result<Self> {
        let start_time = now_millis();
        let queue = Arc::new(GuestResponseQueue::new(config.response_buffer_lifetime()));
        let peer = RpcPeer::start(
            link,
            Arc::new(GuestHandler {
                queue: queue.clone(),
            }),
        );

        let sync = tokio::time::timeout(config.launch_timeout(), peer.request(&HostRequest::Sync));
        let connection_info = match sync.await {
            Ok(Ok(value)) => serde_json::from_value::<Option<ConnectionInfo>>(value)
                .map_err(|e| Error::LiveShareSyncFailure(e.to_string())),
            Ok(Err(e)) => Err(Error::LiveShareSyncFailure(e.to_string())),
            Err(_) => Err(Error::LiveShareSyncFailure(
                "host did not answer".to_string(),
            )),
        };
        let connection_info = match connection_info {
            Ok(info) => info,
            Err(e) => {
                peer.close();
                return Err(e);
            }
        };

        if let Err(e) = peer.notify(&Notification::CatchupRequest { since: start_time }) {
            peer.close();
            return Err(Error::LiveShareSyncFailure(e.to_string()));
        }
        tracing::info!("Attached to host");

        Ok(Self {
            peer,
            queue,
            translator,
            start_time,
            connection_info,
            answer_timeout: config.launch_timeout(),
        })
    }

    /// When this guest attached (ms since the epoch).
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn is_attached(&self) -> bool {
        !self.peer.is_closed()
    }

    /// Follow an execution started by someone else.
    pub fn observe(&self, id: &str) -> CellStream {
        localize(self.queue.observe(id), self.translator.clone())
    }

    async fn call(&self, request: HostRequest) -> Result<Value> {
        if self.peer.is_closed() {
            return Err(Error::SessionDisposed);
        }
        self.peer.request(&request).await
    }
}

/// Map the files of streamed cells back to local paths.
fn localize(stream: CellStream, translator: Arc<dyn PathTranslator>) -> CellStream {
    stream
        .map(move |snapshot| {
            snapshot.map(|cells| {
                cells
                    .into_iter()
                    .map(|mut cell| {
                        cell.file = translator.to_local(&cell.file);
                        cell
                    })
                    .collect()
            })
        })
        .boxed()
}

impl Server for GuestServer {
    fn role(&self) -> Role {
        Role::Guest
    }

    fn connect(&self, _launch: LaunchInfo, cancel: CancelToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            cancel.check()?;
            if self.peer.is_closed() {
                return Err(Error::SessionDisposed);
            }
            tracing::debug!("Guest sessions use the host's kernel");
            Ok(())
        })
    }

    fn execute_observable(&self, request: ExecutionRequest) -> CellStream {
        // Register the id before the host can answer.
        let responses = self.observe(&request.id);
        let mut shared = request;
        shared.file = self.translator.to_shared(&shared.file);
        match self.peer.notify(&Notification::ExecuteObservable(shared)) {
            Ok(()) => responses,
            Err(_) => stream::once(async { Err(Error::SessionDisposed) }).boxed(),
        }
    }

    fn restart_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.call(HostRequest::Restart {
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?;
            Ok(())
        })
    }

    fn interrupt_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<InterruptResult>> {
        Box::pin(async move {
            let value = self
                .call(HostRequest::Interrupt {
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await?;
            Ok(serde_json::from_value(value)?)
        })
    }

    fn get_sys_info(&self) -> BoxFuture<'_, Option<Cell>> {
        Box::pin(async move {
            let value = match self.call(HostRequest::GetSysInfo).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Failed to get sys info from host: {}", e);
                    return None;
                }
            };
            serde_json::from_value::<Option<Cell>>(value).ok().flatten()
        })
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info.clone()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.peer.is_closed() {
                let detach = self.peer.request(&HostRequest::DisposeServer);
                match tokio::time::timeout(self.answer_timeout, detach).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::debug!("Host did not acknowledge detach: {}", e),
                    Err(_) => tracing::debug!("Host did not answer detach request"),
                }
                self.peer.close();
            }
            Ok(())
        })
    }
}
