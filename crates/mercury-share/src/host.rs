//! The sharing host: owns the kernel and replicates executions to guests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use mercury_core::{
    CancelToken, Cell, CellStream, ConnectionInfo, ExecutionRequest, InterruptResult, LaunchInfo,
    LocalServer, Result, Role, Server, SessionManager, now_millis,
};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::{HostRequest, Notification, ServerResponse, join_call};
use crate::queue::ResponseQueue;
use crate::rpc::{PeerHandler, PeerLink, RpcPeer};
use crate::translator::PathTranslator;

struct HostInner {
    local: LocalServer,
    queue: ResponseQueue,
    translator: Arc<dyn PathTranslator>,
    request_log_lifetime: Duration,
    /// Execution ids seen recently, with the time they were first seen.
    request_log: Mutex<FxHashMap<String, u64>>,
}

/// A [`Server`] that runs executions locally and mirrors every snapshot to
/// attached guests.
#[derive(Clone)]
pub struct HostServer {
    inner: Arc<HostInner>,
}

impl HostServer {
    pub fn new(session: Arc<SessionManager>, translator: Arc<dyn PathTranslator>) -> Self {
        let config = session.config();
        let queue = ResponseQueue::new(config.response_buffer_lifetime());
        let request_log_lifetime = config.request_log_lifetime();
        Self {
            inner: Arc::new(HostInner {
                local: LocalServer::new(session),
                queue,
                translator,
                request_log_lifetime,
                request_log: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn local(&self) -> &LocalServer {
        &self.inner.local
    }

    /// Serve a guest over `link`.
    ///
    /// The guest starts receiving responses once it has synced and asked
    /// for its catch-up.
    pub fn attach_guest(&self, link: PeerLink) -> RpcPeer {
        let peer = RpcPeer::start(link, Arc::new(HostHandler(self.inner.clone())));
        tracing::info!("Guest {} connected", peer.id());
        peer
    }

    /// Guests currently receiving live responses.
    pub fn guest_count(&self) -> usize {
        self.inner.queue.guest_count()
    }

    /// Disconnect every guest. The session keeps running.
    pub fn close_guests(&self) {
        self.inner.queue.close_all();
    }
}

impl HostInner {
    fn request_log(&self) -> MutexGuard<'_, FxHashMap<String, u64>> {
        self.request_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an execution id. Returns `false` if it was already seen
    /// within the log's lifetime.
    fn log_request(&self, id: &str) -> bool {
        let now = now_millis();
        let cutoff = now.saturating_sub(self.request_log_lifetime.as_millis() as u64);
        let mut log = self.request_log();
        log.retain(|_, seen| *seen >= cutoff);
        if log.contains_key(id) {
            return false;
        }
        log.insert(id.to_string(), now);
        true
    }

    fn publish(&self, response: ServerResponse) {
        let guests = self.queue.broadcast(response, self.translator.as_ref());
        tracing::trace!("Replicated response to {} guests", guests);
    }

    /// Run `request` locally, publishing each snapshot, the completion
    /// marker, or the failure.
    fn replicate(self: &Arc<Self>, request: ExecutionRequest) -> CellStream {
        struct Replication {
            host: Arc<HostInner>,
            request: ExecutionRequest,
            source: CellStream,
            pos: u64,
            done: bool,
        }

        let source = self.local.execute_observable(request.clone());
        let state = Replication {
            host: self.clone(),
            request,
            source,
            pos: 0,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            state.pos += 1;
            match state.source.next().await {
                Some(Ok(cells)) => {
                    state.host.publish(ServerResponse::ExecuteObservable {
                        code: state.request.code.clone(),
                        pos: state.pos,
                        cells: Some(cells.clone()),
                        id: state.request.id.clone(),
                        time: now_millis(),
                    });
                    Some((Ok(cells), state))
                }
                Some(Err(e)) => {
                    state.host.publish(ServerResponse::Exception {
                        message: e.to_string(),
                        time: now_millis(),
                        id: Some(state.request.id.clone()),
                    });
                    state.done = true;
                    Some((Err(e), state))
                }
                None => {
                    state.host.publish(ServerResponse::ExecuteObservable {
                        code: state.request.code.clone(),
                        pos: state.pos,
                        cells: None,
                        id: state.request.id.clone(),
                        time: now_millis(),
                    });
                    None
                }
            }
        })
        .boxed()
    }

    fn execute_for_guest(self: &Arc<Self>, mut request: ExecutionRequest) {
        if !self.log_request(&request.id) {
            tracing::debug!("Ignoring repeated execution {}", request.id);
            return;
        }
        request.file = self.translator.to_local(&request.file);
        let replication = self.replicate(request);
        tokio::spawn(replication.for_each(|_| async {}));
    }

    async fn handle_request(&self, peer: &RpcPeer, request: HostRequest) -> Result<Value> {
        let value = match request {
            HostRequest::Sync => {
                self.queue.guest_joined(peer.id());
                serde_json::to_value(self.local.connection_info())?
            }
            HostRequest::GetSysInfo => serde_json::to_value(self.local.get_sys_info().await)?,
            HostRequest::Restart { timeout_ms } => {
                self.local
                    .restart_kernel(Duration::from_millis(timeout_ms))
                    .await?;
                Value::Null
            }
            HostRequest::Interrupt { timeout_ms } => {
                let result = self
                    .local
                    .interrupt_kernel(Duration::from_millis(timeout_ms))
                    .await?;
                serde_json::to_value(result)?
            }
            HostRequest::DisposeServer => {
                tracing::info!("Guest {} detached", peer.id());
                self.queue.guest_left(peer.id());
                Value::Null
            }
        };
        Ok(value)
    }
}

struct HostHandler(Arc<HostInner>);

impl PeerHandler for HostHandler {
    fn on_request(
        &self,
        peer: RpcPeer,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, String>> {
        let host = self.0.clone();
        Box::pin(async move {
            let request: HostRequest = join_call(&method, params).map_err(|e| e.to_string())?;
            host.handle_request(&peer, request)
                .await
                .map_err(|e| e.to_string())
        })
    }

    fn on_notification(&self, peer: &RpcPeer, method: &str, params: Value) {
        match join_call::<Notification>(method, params) {
            Ok(Notification::CatchupRequest { since }) => {
                match self.0.queue.send(peer, self.0.translator.as_ref(), since) {
                    Ok(sent) => tracing::debug!("Guest {} caught up on {} responses", peer.id(), sent),
                    Err(e) => tracing::warn!("Catch-up for guest {} failed: {}", peer.id(), e),
                }
            }
            Ok(Notification::ExecuteObservable(request)) => self.0.execute_for_guest(request),
            Ok(Notification::ServerResponse(_)) => {
                tracing::debug!("Ignoring server response sent by guest {}", peer.id());
            }
            Err(e) => tracing::warn!("Malformed notification {}: {}", method, e),
        }
    }

    fn on_closed(&self, peer: &RpcPeer) {
        tracing::info!("Guest {} disconnected", peer.id());
        self.0.queue.guest_left(peer.id());
    }
}

impl Server for HostServer {
    fn role(&self) -> Role {
        Role::Host
    }

    fn connect(&self, launch: LaunchInfo, cancel: CancelToken) -> BoxFuture<'_, Result<()>> {
        self.inner.local.connect(launch, cancel)
    }

    fn execute_observable(&self, request: ExecutionRequest) -> CellStream {
        self.inner.log_request(&request.id);
        self.inner.replicate(request)
    }

    fn restart_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        self.inner.local.restart_kernel(timeout)
    }

    fn interrupt_kernel(&self, timeout: Duration) -> BoxFuture<'_, Result<InterruptResult>> {
        self.inner.local.interrupt_kernel(timeout)
    }

    fn get_sys_info(&self) -> BoxFuture<'_, Option<Cell>> {
        self.inner.local.get_sys_info()
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.local.connection_info()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        self.close_guests();
        self.inner.local.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::IdentityTranslator;
    use mercury_core::MercuryConfig;
    use mercury_core::testing::{FakeBehavior, FakeConnector};

    fn host() -> HostServer {
        let connector = Arc::new(FakeConnector::new(FakeBehavior::default()));
        let session = Arc::new(SessionManager::new(MercuryConfig::default(), connector));
        HostServer::new(session, Arc::new(IdentityTranslator))
    }

    #[test]
    fn test_request_log_deduplicates() {
        let host = host();
        assert!(host.inner.log_request("a"));
        assert!(!host.inner.log_request("a"));
        assert!(host.inner.log_request("b"));
    }

    #[test]
    fn test_request_log_forgets_old_ids() {
        let host = host();
        host.inner
            .request_log()
            .insert("old".to_string(), now_millis() - 10 * 60_000);
        assert!(host.inner.log_request("old"));
    }

    #[tokio::test]
    async fn test_unconnected_host_publishes_exception() {
        let host = host();
        host.inner.queue.push(ServerResponse::Exception {
            message: "marker".to_string(),
            time: now_millis(),
            id: None,
        });
        let results: Vec<_> = host
            .execute_observable(ExecutionRequest::new("1", "a.py", 0))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
        // The marker plus the exception.
        assert_eq!(host.inner.queue.len(), 2);
    }
}
