//! Request/reply and notifications over a bidirectional message link.
//!
//! A [`PeerLink`] is one end of an ordered duplex channel of
//! [`PeerMessage`]s. It may be backed by an in-process pair or by a
//! WebSocket bridge (see [`crate::transport`]). [`RpcPeer`] drives a link:
//! it matches replies to outstanding requests and hands incoming requests
//! and notifications to a [`PeerHandler`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use mercury_core::{Error, Result};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Notification, PeerMessage, split_call};

/// One end of a duplex message channel.
pub struct PeerLink {
    tx: mpsc::UnboundedSender<PeerMessage>,
    rx: mpsc::UnboundedReceiver<PeerMessage>,
}

impl PeerLink {
    pub fn new(
        tx: mpsc::UnboundedSender<PeerMessage>,
        rx: mpsc::UnboundedReceiver<PeerMessage>,
    ) -> Self {
        Self { tx, rx }
    }

    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<PeerMessage>,
        mpsc::UnboundedReceiver<PeerMessage>,
    ) {
        (self.tx, self.rx)
    }
}

/// Receives what the remote side sends.
pub trait PeerHandler: Send + Sync + 'static {
    /// Answer a request. `Err` is sent back as the reply's error text.
    fn on_request(
        &self,
        peer: RpcPeer,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, String>>;

    /// Handle a notification. Called in arrival order on the link's task.
    fn on_notification(&self, peer: &RpcPeer, method: &str, params: Value);

    /// The link closed.
    fn on_closed(&self, _peer: &RpcPeer) {}
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<PeerMessage>>>,
    pending: Mutex<FxHashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_request: AtomicU64,
}

/// A running RPC endpoint. Cheap to clone.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<Shared>,
}

impl RpcPeer {
    /// Start serving `link`, dispatching incoming traffic to `handler`.
    pub fn start(link: PeerLink, handler: Arc<dyn PeerHandler>) -> Self {
        let (tx, rx) = link.into_parts();
        let peer = Self {
            shared: Arc::new(Shared {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                outgoing: Mutex::new(Some(tx)),
                pending: Mutex::new(FxHashMap::default()),
                next_request: AtomicU64::new(1),
            }),
        };
        tokio::spawn(peer.clone().run(rx, handler));
        peer
    }

    /// Process-unique id of this endpoint.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing().is_none()
    }

    fn outgoing(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PeerMessage>>> {
        self.shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, FxHashMap<u64, oneshot::Sender<Result<Value>>>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: PeerMessage) -> Result<()> {
        match self.outgoing().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| disconnected()),
            None => Err(disconnected()),
        }
    }

    /// Send a typed request and wait for its reply.
    pub async fn request<T: Serialize>(&self, call: &T) -> Result<Value> {
        let (method, params) = split_call(call)?;
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if let Err(e) = self.send(PeerMessage::Request { id, method, params }) {
            self.pending().remove(&id);
            return Err(e);
        }
        rx.await.unwrap_or_else(|_| Err(disconnected()))
    }

    pub fn notify(&self, notification: &Notification) -> Result<()> {
        let (method, params) = split_call(notification)?;
        self.send(PeerMessage::Notification { method, params })
    }

    /// Close the link. Outstanding requests fail once the remote side
    /// notices.
    pub fn close(&self) {
        self.outgoing().take();
    }

    async fn run(
        self,
        mut incoming: mpsc::UnboundedReceiver<PeerMessage>,
        handler: Arc<dyn PeerHandler>,
    ) {
        while let Some(message) = incoming.recv().await {
            match message {
                PeerMessage::Request { id, method, params } => {
                    let reply = handler.on_request(self.clone(), method, params);
                    let peer = self.clone();
                    tokio::spawn(async move {
                        let message = match reply.await {
                            Ok(result) => PeerMessage::Reply {
                                id,
                                result,
                                error: None,
                            },
                            Err(error) => PeerMessage::Reply {
                                id,
                                result: Value::Null,
                                error: Some(error),
                            },
                        };
                        if peer.send(message).is_err() {
                            tracing::debug!("Dropping reply {}: link closed", id);
                        }
                    });
                }
                PeerMessage::Reply { id, result, error } => {
                    let waiter = self.pending().remove(&id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(match error {
                                Some(error) => Err(Error::Rpc(error)),
                                None => Ok(result),
                            });
                        }
                        None => tracing::debug!("Reply for unknown request {}", id),
                    }
                }
                PeerMessage::Notification { method, params } => {
                    handler.on_notification(&self, &method, params);
                }
            }
        }

        // Close before draining so a racing `request` either lands in the
        // drain or sees the closed link.
        self.close();
        let waiters: Vec<_> = self.pending().drain().map(|(_, tx)| tx).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(disconnected()));
        }
        tracing::debug!("Peer {} disconnected", self.id());
        handler.on_closed(&self);
    }
}

fn disconnected() -> Error {
    Error::Rpc("peer disconnected".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HostRequest, ServerResponse};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<(String, Value)>>,
        closed: Mutex<bool>,
    }

    impl PeerHandler for Recorder {
        fn on_request(
            &self,
            _peer: RpcPeer,
            method: String,
            params: Value,
        ) -> BoxFuture<'static, std::result::Result<Value, String>> {
            Box::pin(async move {
                match method.as_str() {
                    "restart" => Ok(params),
                    _ => Err(format!("unknown method {}", method)),
                }
            })
        }

        fn on_notification(&self, _peer: &RpcPeer, method: &str, params: Value) {
            self.notifications
                .lock()
                .unwrap()
                .push((method.to_string(), params));
        }

        fn on_closed(&self, _peer: &RpcPeer) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (a, b) = PeerLink::pair();
        let client = RpcPeer::start(a, Arc::new(Recorder::default()));
        let _server = RpcPeer::start(b, Arc::new(Recorder::default()));

        let reply = client
            .request(&HostRequest::Restart { timeout_ms: 5 })
            .await
            .unwrap();
        assert_eq!(reply["timeoutMs"], 5);

        let err = client.request(&HostRequest::Sync).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(msg) if msg == "unknown method sync"));
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (a, b) = PeerLink::pair();
        let recorder = Arc::new(Recorder::default());
        let client = RpcPeer::start(a, Arc::new(Recorder::default()));
        let _server = RpcPeer::start(b, recorder.clone());

        for since in 0..5 {
            client.notify(&Notification::CatchupRequest { since }).unwrap();
        }
        client
            .notify(&Notification::ServerResponse(ServerResponse::Exception {
                message: "x".to_string(),
                time: 1,
                id: None,
            }))
            .unwrap();
        // Requests are answered after earlier notifications were handled.
        client
            .request(&HostRequest::Restart { timeout_ms: 0 })
            .await
            .unwrap();

        let notifications = recorder.notifications.lock().unwrap().clone();
        assert_eq!(notifications.len(), 6);
        for (i, (method, params)) in notifications[..5].iter().enumerate() {
            assert_eq!(method, "catchupRequest");
            assert_eq!(params["since"], i as u64);
        }
        assert_eq!(notifications[5].0, "serverResponse");
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (a, b) = PeerLink::pair();
        let recorder = Arc::new(Recorder::default());
        let client = RpcPeer::start(a, recorder.clone());

        // The remote end never answers.
        let (_tx, mut rx) = b.into_parts();
        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&HostRequest::Sync).await })
        };
        assert!(matches!(rx.recv().await, Some(PeerMessage::Request { .. })));

        drop(_tx);
        let result = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Rpc(_))));
        assert!(client.is_closed());
        assert!(*recorder.closed.lock().unwrap());
        assert!(client.notify(&Notification::CatchupRequest { since: 0 }).is_err());
    }

    #[tokio::test]
    async fn test_close_propagates_to_remote() {
        let (a, b) = PeerLink::pair();
        let remote = Arc::new(Recorder::default());
        let client = RpcPeer::start(a, Arc::new(Recorder::default()));
        let server = RpcPeer::start(b, remote.clone());

        client.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(*remote.closed.lock().unwrap());
    }
}
