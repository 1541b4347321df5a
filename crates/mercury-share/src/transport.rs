//! WebSocket transports for peer links.
//!
//! Each frame is one JSON-encoded [`PeerMessage`] sent as a text message.

use std::fmt::Display;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{ShareError, ShareResult};
use crate::protocol::PeerMessage;
use crate::rpc::PeerLink;

enum Frame {
    Text(String),
    Close,
    Other,
}

/// Bridge an accepted server-side WebSocket to a peer link.
///
/// The returned task ends when either side closes.
pub fn accept(socket: WebSocket) -> (PeerLink, JoinHandle<()>) {
    bridge(
        socket,
        |message| match message {
            AxumMessage::Text(text) => Frame::Text(text.as_str().to_string()),
            AxumMessage::Close(_) => Frame::Close,
            _ => Frame::Other,
        },
        |text| AxumMessage::Text(text.into()),
    )
}

/// Connect to a host's `/share` endpoint.
pub async fn connect(url: &str) -> ShareResult<PeerLink> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ShareError::WebSocket(format!("{}: {}", url, e)))?;
    tracing::debug!("Connected to {}", url);
    let (link, _task) = bridge(
        socket,
        |message| match message {
            WsMessage::Text(text) => Frame::Text(text.as_str().to_string()),
            WsMessage::Close(_) => Frame::Close,
            _ => Frame::Other,
        },
        |text| WsMessage::Text(text.into()),
    );
    Ok(link)
}

fn bridge<S, M, E>(
    socket: S,
    decode: fn(M) -> Frame,
    encode: fn(String) -> M,
) -> (PeerLink, JoinHandle<()>)
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: Display + Send,
    M: Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (local, remote) = PeerLink::pair();
    let (tx, mut rx) = remote.into_parts();
    let (mut sink, mut stream) = socket.split::<M>();

    let task = tokio::spawn(async move {
        let forward = async {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode peer message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(encode(text)).await {
                    tracing::debug!("WebSocket send failed: {}", e);
                    return;
                }
            }
            let _ = sink.close().await;
        };

        let receive = async {
            while let Some(result) = stream.next().await {
                match result.map(decode) {
                    Ok(Frame::Text(text)) => match serde_json::from_str::<PeerMessage>(&text) {
                        Ok(message) => {
                            if tx.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Failed to parse peer message: {}", e),
                    },
                    Ok(Frame::Close) => return,
                    Ok(Frame::Other) => {}
                    Err(e) => {
                        tracing::debug!("WebSocket receive failed: {}", e);
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = forward => {}
            _ = receive => {}
        }
    });

    (local, task)
}
