//! Kernel connections through a Jupyter server.
//!
//! A session is created with the server's REST API, then the kernel's
//! channels WebSocket carries execute requests out and IOPub/shell
//! messages back. Incoming messages are routed to the pending request
//! they are parented to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::connection::{ConnectionInfo, LaunchInfo};
use crate::error::{Error, Result};

use super::connection::{ExecuteHandle, KernelConnection, KernelConnector};
use super::messages::{ExecuteReply, ExecuteRequest, ExecutionState, IoPubMessage, WireMessage};

/// Connector that opens kernels on a Jupyter server.
#[derive(Clone, Default)]
pub struct GatewayConnector {
    client: reqwest::Client,
}

impl GatewayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl KernelConnector for GatewayConnector {
    fn connect(&self, launch: &LaunchInfo) -> BoxFuture<'_, Result<Arc<dyn KernelConnection>>> {
        let launch = launch.clone();
        Box::pin(async move {
            let kernel = GatewayKernel::open(self.client.clone(), &launch).await?;
            Ok(Arc::new(kernel) as Arc<dyn KernelConnection>)
        })
    }
}

/// Attach the server's auth token to a request.
pub(crate) fn authorize(
    builder: reqwest::RequestBuilder,
    info: &ConnectionInfo,
) -> reqwest::RequestBuilder {
    if info.token.is_empty() {
        builder
    } else {
        builder.header("Authorization", format!("token {}", info.token))
    }
}

#[derive(Debug, Deserialize)]
struct SessionModel {
    id: String,
    kernel: KernelModel,
}

#[derive(Debug, Deserialize)]
struct KernelModel {
    id: String,
}

/// Bookkeeping for one in-flight execute request.
struct PendingRequest {
    messages: mpsc::UnboundedSender<IoPubMessage>,
    done: Option<oneshot::Sender<Result<ExecuteReply>>>,
    reply: Option<ExecuteReply>,
    idle: bool,
}

type PendingMap = Arc<Mutex<FxHashMap<String, PendingRequest>>>;

/// A kernel reached through a Jupyter server session.
pub struct GatewayKernel {
    client: reqwest::Client,
    info: ConnectionInfo,
    session_id: String,
    kernel_id: String,
    /// Client-side Jupyter session id stamped on outgoing headers.
    client_session: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl GatewayKernel {
    /// Create a server session and connect to its kernel's channels.
    pub async fn open(client: reqwest::Client, launch: &LaunchInfo) -> Result<Self> {
        let info = launch.connection_info.clone();
        let path = launch
            .notebook_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("mercury-{}.ipynb", uuid::Uuid::new_v4()));
        let kernel = match &launch.kernel_spec {
            Some(spec) => json!({ "name": spec.name }),
            None => json!({}),
        };

        let session: SessionModel = authorize(client.post(info.api_url("api/sessions")), &info)
            .json(&json!({
                "path": path,
                "name": "",
                "type": "notebook",
                "kernel": kernel,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::info!(
            "Created Jupyter session {} (kernel {})",
            session.id,
            session.kernel.id
        );

        let client_session = uuid::Uuid::new_v4().to_string();
        let url = info.ws_url(&format!(
            "api/kernels/{}/channels?session_id={}",
            session.kernel.id, client_session
        ));
        let mut request = url.into_client_request()?;
        if !info.token.is_empty() {
            let value = HeaderValue::from_str(&format!("token {}", info.token))
                .map_err(|e| Error::Kernel(format!("Invalid token header: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!("Kernel channel write failed: {}", e);
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(FxHashMap::default()));
        let reader_pending = pending.clone();
        let kernel_id = session.kernel.id.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_message(&reader_pending, text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Kernel channel read failed: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("Kernel channel for {} closed", kernel_id);
            fail_pending(&reader_pending, "kernel connection closed");
        });

        Ok(Self {
            client,
            info,
            session_id: session.id,
            kernel_id: session.kernel.id,
            client_session,
            outgoing,
            pending,
            tasks: vec![writer, reader],
            closed: AtomicBool::new(false),
        })
    }

    async fn post_kernel_action(&self, action: &str) -> Result<()> {
        let url = self
            .info
            .api_url(&format!("api/kernels/{}/{}", self.kernel_id, action));
        authorize(self.client.post(url), &self.info)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Route one incoming channel message to its pending request.
fn route_message(pending: &PendingMap, text: &str) {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Unparseable kernel message: {}", e);
            return;
        }
    };

    let Some(parent) = message.parent_msg_id().map(str::to_string) else {
        tracing::debug!("Ignoring unparented {} message", message.msg_type());
        return;
    };

    let Ok(mut map) = pending.lock() else {
        return;
    };
    let Some(request) = map.get_mut(&parent) else {
        return;
    };

    if message.msg_type() == "execute_reply" {
        match serde_json::from_value::<ExecuteReply>(message.content) {
            Ok(reply) => request.reply = Some(reply),
            Err(e) => tracing::warn!("Malformed execute_reply: {}", e),
        }
    } else if message.channel.as_deref().is_none_or(|c| c == "iopub") {
        let decoded = IoPubMessage::from_wire(&message.header.msg_type, message.content);
        if let IoPubMessage::Status {
            execution_state: ExecutionState::Idle,
        } = decoded
        {
            request.idle = true;
        }
        let _ = request.messages.send(decoded);
    }

    if request.idle && request.reply.is_some() {
        if let Some(mut finished) = map.remove(&parent) {
            if let (Some(done), Some(reply)) = (finished.done.take(), finished.reply.take()) {
                let _ = done.send(Ok(reply));
            }
        }
    }
}

/// Resolve every pending request with a kernel error.
fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<PendingRequest> = match pending.lock() {
        Ok(mut map) => map.drain().map(|(_, request)| request).collect(),
        Err(_) => return,
    };
    for mut request in drained {
        if let Some(done) = request.done.take() {
            let _ = done.send(Err(Error::Kernel(reason.to_string())));
        }
    }
}

impl KernelConnection for GatewayKernel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<ExecuteHandle>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::SessionDisposed);
            }

            let wire = WireMessage::shell_request(
                &self.client_session,
                "execute_request",
                serde_json::to_value(&request)?,
            );
            let msg_id = wire.header.msg_id.clone();
            let (messages_tx, messages) = mpsc::unbounded_channel();
            let (done_tx, done) = oneshot::channel();

            if let Ok(mut map) = self.pending.lock() {
                map.insert(
                    msg_id.clone(),
                    PendingRequest {
                        messages: messages_tx,
                        done: Some(done_tx),
                        reply: None,
                        idle: false,
                    },
                );
            }

            let text = serde_json::to_string(&wire)?;
            if self.outgoing.send(Message::Text(text.into())).is_err() {
                if let Ok(mut map) = self.pending.lock() {
                    map.remove(&msg_id);
                }
                return Err(Error::Kernel("kernel channel is closed".to_string()));
            }

            tracing::debug!("Sent execute_request {}", msg_id);
            Ok(ExecuteHandle {
                msg_id,
                messages,
                done,
            })
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.post_kernel_action("interrupt").await })
    }

    fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.post_kernel_action("restart").await?;
            // Requests sent to the old kernel will never finish.
            fail_pending(&self.pending, "kernel restarted");
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            let url = self.info.api_url(&format!("api/sessions/{}", self.session_id));
            let result = authorize(self.client.delete(url), &self.info).send().await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {}
                Ok(response) => {
                    tracing::warn!("Session delete returned {}", response.status());
                }
                Err(e) => tracing::warn!("Session delete failed: {}", e),
            }

            let _ = self.outgoing.send(Message::Close(None));
            fail_pending(&self.pending, "kernel shut down");
            Ok(())
        })
    }
}

impl Drop for GatewayKernel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_with(id: &str) -> (
        PendingMap,
        mpsc::UnboundedReceiver<IoPubMessage>,
        oneshot::Receiver<Result<ExecuteReply>>,
    ) {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (done_tx, done) = oneshot::channel();
        let map: PendingMap = Arc::new(Mutex::new(FxHashMap::default()));
        map.lock().unwrap().insert(
            id.to_string(),
            PendingRequest {
                messages: messages_tx,
                done: Some(done_tx),
                reply: None,
                idle: false,
            },
        );
        (map, messages, done)
    }

    fn wire(msg_type: &str, parent: &str, channel: &str, content: serde_json::Value) -> String {
        json!({
            "header": {"msg_id": uuid::Uuid::new_v4().to_string(), "msg_type": msg_type},
            "parent_header": {"msg_id": parent},
            "content": content,
            "channel": channel,
        })
        .to_string()
    }

    #[test]
    fn test_routes_iopub_and_completes_after_reply_and_idle() {
        let (map, mut messages, mut done) = pending_with("req");

        route_message(&map, &wire("status", "req", "iopub", json!({"execution_state": "busy"})));
        route_message(&map, &wire("stream", "req", "iopub", json!({"name": "stdout", "text": "1\n"})));
        route_message(&map, &wire("execute_reply", "req", "shell", json!({"status": "ok", "execution_count": 1})));
        assert!(done.try_recv().is_err(), "not idle yet");

        route_message(&map, &wire("status", "req", "iopub", json!({"execution_state": "idle"})));

        let reply = done.try_recv().unwrap().unwrap();
        assert_eq!(reply.execution_count, Some(1));
        assert!(map.lock().unwrap().is_empty());

        let mut kinds = Vec::new();
        while let Ok(msg) = messages.try_recv() {
            kinds.push(msg.msg_type().to_string());
        }
        assert_eq!(kinds, vec!["status", "stream", "status"]);
    }

    #[test]
    fn test_ignores_other_parents() {
        let (map, mut messages, _done) = pending_with("req");
        route_message(&map, &wire("stream", "other", "iopub", json!({"name": "stdout", "text": "x"})));
        route_message(&map, "not json");
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn test_fail_pending_resolves_with_error() {
        let (map, _messages, mut done) = pending_with("req");
        fail_pending(&map, "kernel died");
        assert!(matches!(done.try_recv(), Ok(Err(Error::Kernel(_)))));
    }
}
