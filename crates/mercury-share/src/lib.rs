//! Collaborative session sharing for Mercury.
//!
//! One participant, the host, owns the kernel. Guests attach over a peer
//! link and have every operation executed on the host.
//!
//! # Architecture
//!
//! - **Protocol**: Wire messages between host and guests
//! - **Rpc**: Request/reply and notifications over a peer link
//! - **Queue**: Host-side response buffer and guest-side ordered replay
//! - **Host / Guest**: The two [`Server`] implementations
//! - **Routes / Transport**: The `/share` WebSocket endpoint and client

pub mod error;
pub mod guest;
pub mod host;
pub mod protocol;
pub mod queue;
pub mod routes;
pub mod rpc;
pub mod translator;
pub mod transport;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use mercury_core::{LocalServer, MercuryConfig, Role, Server, SessionManager};
use tokio::net::TcpListener;

pub use error::{ShareError, ShareResult};
pub use guest::GuestServer;
pub use host::HostServer;
pub use protocol::{HostRequest, Notification, PeerMessage, ServerResponse};
pub use queue::{GuestResponseQueue, ResponseQueue};
pub use routes::{AppState, create_router};
pub use rpc::{PeerHandler, PeerLink, RpcPeer};
pub use translator::{IdentityTranslator, PathTranslator, PrefixTranslator, SHARED_ROOT};

/// Share server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// What a [`Server`] is built on.
pub enum Endpoint {
    /// A session owned by this process (local and host roles).
    Session(Arc<SessionManager>),
    /// A link to a host (guest role).
    Link(PeerLink),
}

/// Build the [`Server`] for `role`.
pub async fn create_server(
    role: Role,
    endpoint: Endpoint,
    translator: Arc<dyn PathTranslator>,
    config: &MercuryConfig,
) -> ShareResult<Arc<dyn Server>> {
    match (role, endpoint) {
        (Role::Local, Endpoint::Session(session)) => Ok(Arc::new(LocalServer::new(session))),
        (Role::Host, Endpoint::Session(session)) => {
            Ok(Arc::new(HostServer::new(session, translator)))
        }
        (Role::Guest, Endpoint::Link(link)) => {
            Ok(Arc::new(GuestServer::attach(link, translator, config).await?))
        }
        (role, _) => Err(ShareError::InvalidOperation(format!(
            "{:?} server cannot be built on this endpoint",
            role
        ))),
    }
}

/// Serve `host` to guests until Ctrl+C.
pub async fn serve(host: HostServer, config: ServerConfig) -> ShareResult<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ShareError::Io {
            path: std::path::PathBuf::new(),
            message: format!("Invalid address: {}:{}", config.host, config.port),
        })?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Sharing session at ws://{}/share", addr);

    serve_with_shutdown(listener, host, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
        }
    })
    .await
}

/// Serve `host` on an existing listener until `shutdown` resolves.
///
/// Guest links are closed on shutdown; the host's session is left running.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    host: HostServer,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ShareResult<()> {
    let app = create_router(Arc::new(AppState { host: host.clone() }));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            host.close_guests();
        })
        .await?;

    tracing::info!("Share server shutdown complete");
    Ok(())
}
