//! Host/guest replication over in-process and WebSocket links.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use mercury_core::testing::{FakeBehavior, FakeConnector};
use mercury_core::{
    CancelToken, Cell, CellState, ConnectionInfo, Error, ExecutionRequest, InterruptResult,
    LaunchInfo, MercuryConfig, Role, Server, SessionManager,
};
use mercury_share::{
    Endpoint, GuestServer, HostServer, IdentityTranslator, PathTranslator, PeerHandler, PeerLink,
    PrefixTranslator, RpcPeer, ShareError, create_server, serve_with_shutdown, transport,
};
use serde_json::Value;

async fn session() -> (Arc<SessionManager>, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::new(FakeBehavior::default()));
    let session = Arc::new(SessionManager::new(MercuryConfig::default(), connector.clone()));
    session
        .connect(
            LaunchInfo::new(ConnectionInfo::remote("http://localhost:8888", "tok")),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    (session, connector)
}

async fn host() -> (HostServer, Arc<FakeConnector>) {
    let (session, connector) = session().await;
    (HostServer::new(session, Arc::new(IdentityTranslator)), connector)
}

async fn attach_with(host: &HostServer, translator: Arc<dyn PathTranslator>) -> GuestServer {
    let (host_end, guest_end) = PeerLink::pair();
    host.attach_guest(host_end);
    GuestServer::attach(guest_end, translator, &MercuryConfig::default())
        .await
        .unwrap()
}

async fn attach(host: &HostServer) -> GuestServer {
    attach_with(host, Arc::new(IdentityTranslator)).await
}

async fn last_snapshot(server: &dyn Server, request: ExecutionRequest) -> Vec<Cell> {
    let stream = server.execute_observable(request);
    let snapshots: Vec<_> = tokio::time::timeout(Duration::from_secs(10), stream.collect())
        .await
        .unwrap();
    snapshots.into_iter().last().unwrap().unwrap()
}

#[tokio::test]
async fn test_guest_execution_runs_on_host_kernel() {
    let (host, connector) = host().await;
    let guest = attach(&host).await;

    let cells = last_snapshot(&guest, ExecutionRequest::new("a=1\na", "foo.py", 4)).await;
    assert_eq!(cells[0].state, CellState::Finished);
    assert_eq!(cells[0].line, 4);
    assert_eq!(cells[0].data.outputs[0].text_plain(), Some("1"));

    let executed = connector.last_kernel().unwrap().executed();
    assert!(executed.iter().any(|code| code == "a=1\na"));
}

#[tokio::test]
async fn test_guest_sees_host_executions() {
    let (host, _) = host().await;
    let guest = attach(&host).await;

    let request = ExecutionRequest::new("print(1)\nprint(2)", "foo.py", 0);
    let mirrored = guest.observe(&request.id);
    let local = last_snapshot(&host, request).await;

    let snapshots: Vec<_> = tokio::time::timeout(Duration::from_secs(10), mirrored.collect())
        .await
        .unwrap();
    let remote = snapshots.into_iter().last().unwrap().unwrap();
    assert_eq!(remote, local);
    assert_eq!(remote[0].data.outputs[0].text_plain(), Some("1\n2\n"));
}

#[tokio::test]
async fn test_same_request_from_two_guests_runs_once() {
    let (host, connector) = host().await;
    let first = attach(&host).await;
    let second = attach(&host).await;

    let request = ExecutionRequest::new("x = 41\nx + 1", "foo.py", 0);
    let a = first.execute_observable(request.clone());
    let b = second.execute_observable(request);
    let (a, b): (Vec<_>, Vec<_>) = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join(a.collect(), b.collect()),
    )
    .await
    .unwrap();

    let a = a.into_iter().last().unwrap().unwrap();
    let b = b.into_iter().last().unwrap().unwrap();
    assert_eq!(a[0].state, CellState::Finished);
    assert_eq!(a, b);

    let executed = connector.last_kernel().unwrap().executed();
    assert_eq!(executed.iter().filter(|c| c.contains("x + 1")).count(), 1);
}

#[tokio::test]
async fn test_guest_operations_are_forwarded() {
    let (host, connector) = host().await;
    let guest = attach(&host).await;

    assert_eq!(guest.role(), Role::Guest);
    assert_eq!(guest.connection_info(), host.connection_info());

    let info = guest.get_sys_info().await.unwrap();
    assert!(info.data.source[0].starts_with("Python 3.11.4"));

    let result = guest
        .interrupt_kernel(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, InterruptResult::Success);

    guest.restart_kernel(Duration::from_secs(5)).await.unwrap();
    assert_eq!(connector.last_kernel().unwrap().restart_count(), 1);
}

#[tokio::test]
async fn test_host_failure_reaches_guest() {
    let connector = Arc::new(FakeConnector::new(FakeBehavior::default()));
    let session = Arc::new(SessionManager::new(MercuryConfig::default(), connector));
    let host = HostServer::new(session, Arc::new(IdentityTranslator));
    let guest = attach(&host).await;

    let results: Vec<_> = tokio::time::timeout(
        Duration::from_secs(10),
        guest
            .execute_observable(ExecutionRequest::new("1", "foo.py", 0))
            .collect(),
    )
    .await
    .unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(&results[0], Err(Error::Kernel(msg)) if msg.contains("session disposed")));

    assert!(guest.restart_kernel(Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_sync_failure() {
    let (guest_end, host_end) = PeerLink::pair();
    drop(host_end);
    let result = GuestServer::attach(
        guest_end,
        Arc::new(IdentityTranslator),
        &MercuryConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(Error::LiveShareSyncFailure(_))));
}

/// Answers `sync` and never answers anything else.
struct StuckHost;

impl PeerHandler for StuckHost {
    fn on_request(
        &self,
        _peer: RpcPeer,
        method: String,
        _params: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, String>> {
        Box::pin(async move {
            if method == "sync" {
                return Ok(Value::Null);
            }
            std::future::pending().await
        })
    }

    fn on_notification(&self, _peer: &RpcPeer, _method: &str, _params: Value) {}
}

#[tokio::test]
async fn test_detach_from_unresponsive_host() {
    let (host_end, guest_end) = PeerLink::pair();
    let _host = RpcPeer::start(host_end, Arc::new(StuckHost));
    let config = MercuryConfig {
        launch_timeout_ms: 100,
        ..MercuryConfig::default()
    };
    let guest = GuestServer::attach(guest_end, Arc::new(IdentityTranslator), &config)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), guest.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert!(!guest.is_attached());
}

#[tokio::test]
async fn test_guest_detach() {
    let (host, _) = host().await;
    let guest = attach(&host).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while host.guest_count() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    guest.shutdown().await.unwrap();
    guest.shutdown().await.unwrap();
    assert!(!guest.is_attached());

    tokio::time::timeout(Duration::from_secs(5), async {
        while host.guest_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut stream = guest.execute_observable(ExecutionRequest::new("1", "foo.py", 0));
    assert!(matches!(stream.next().await, Some(Err(Error::SessionDisposed))));
    assert!(matches!(
        guest.restart_kernel(Duration::from_secs(1)).await,
        Err(Error::SessionDisposed)
    ));

    // The host keeps its session.
    let cells = last_snapshot(&host, ExecutionRequest::new("2", "foo.py", 0)).await;
    assert_eq!(cells[0].state, CellState::Finished);
}

#[cfg(unix)]
#[tokio::test]
async fn test_paths_are_translated_both_ways() {
    /// Maps shared paths onto the host's disk, to observe what the host ran.
    struct HostPaths;

    impl PathTranslator for HostPaths {
        fn to_shared(&self, local: &str) -> String {
            local.to_string()
        }

        fn to_local(&self, shared: &str) -> String {
            shared.replace("vsls:", "/srv/host/proj")
        }
    }

    let (session, _) = session().await;
    let host = HostServer::new(
        session,
        Arc::new(PrefixTranslator::new("/srv/host/proj", "vsls:")),
    );
    let guest = attach_with(
        &host,
        Arc::new(PrefixTranslator::new("/home/guest/proj", "vsls:")),
    )
    .await;
    let observer = attach_with(&host, Arc::new(HostPaths)).await;

    let request = ExecutionRequest::new("1", "/home/guest/proj/src/a.py", 0);
    let mirrored = observer.observe(&request.id);
    let cells = last_snapshot(&guest, request).await;
    assert_eq!(cells[0].file, "/home/guest/proj/src/a.py");

    let snapshots: Vec<_> = tokio::time::timeout(Duration::from_secs(10), mirrored.collect())
        .await
        .unwrap();
    let on_host = snapshots.into_iter().last().unwrap().unwrap();
    assert_eq!(on_host[0].file, "/srv/host/proj/src/a.py");
}

#[tokio::test]
async fn test_create_server_by_role() {
    let (session, _) = session().await;
    let config = MercuryConfig::default();

    let local = create_server(
        Role::Local,
        Endpoint::Session(session.clone()),
        Arc::new(IdentityTranslator),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(local.role(), Role::Local);

    let host = create_server(
        Role::Host,
        Endpoint::Session(session.clone()),
        Arc::new(IdentityTranslator),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(host.role(), Role::Host);

    let mismatched = create_server(
        Role::Guest,
        Endpoint::Session(session),
        Arc::new(IdentityTranslator),
        &config,
    )
    .await;
    assert!(matches!(mismatched, Err(ShareError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let (host, _) = host().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_with_shutdown(listener, host.clone(), async move {
        let _ = stop_rx.await;
    }));

    let link = transport::connect(&format!("ws://{}/share", addr))
        .await
        .unwrap();
    let guest = GuestServer::attach(link, Arc::new(IdentityTranslator), &MercuryConfig::default())
        .await
        .unwrap();
    assert_eq!(guest.connection_info(), host.connection_info());

    let cells = last_snapshot(&guest, ExecutionRequest::new("y = 3\ny", "foo.py", 0)).await;
    assert_eq!(cells[0].state, CellState::Finished);
    assert_eq!(cells[0].data.outputs[0].text_plain(), Some("3"));

    guest.shutdown().await.unwrap();
    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
