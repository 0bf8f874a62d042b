#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use llm_tunnel::auth::TokenValidator;
use llm_tunnel::tunnel::client::TunnelClientHandle;
use llm_tunnel::tunnel::codec::{decode, encode_text};
use llm_tunnel::tunnel::health::{HealthSupervisor, HeartbeatSettings};
use llm_tunnel::tunnel::protocol::{Envelope, Registration, PROTOCOL_VERSION};
use llm_tunnel::tunnel::reconnect::ClientState;
use llm_tunnel::tunnel::registry::SessionRegistry;
use llm_tunnel::tunnel::relay::{broker_router, BrokerState};
use llm_tunnel::tunnel::router::{RouterSettings, TunnelBroker};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;
pub type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SECRET: &[u8] = b"integration-secret";
pub const API_KEY: &str = "facade-key";
pub const ADMIN_KEY: &str = "admin-key";

pub fn validator() -> TokenValidator {
    TokenValidator::new(SECRET, "llm-tunnel", "tunnel-broker", Duration::ZERO)
}

pub fn token_for(tenant: &str) -> String {
    validator().issue(tenant, Duration::from_secs(300)).unwrap()
}

/// Broker state plus its router, without a listener.
pub fn broker_app(router: RouterSettings) -> (Router, BrokerState) {
    let registry = Arc::new(SessionRegistry::new());
    let broker = TunnelBroker::new(registry, router);
    let state = BrokerState::new(broker, validator(), ADMIN_KEY.into(), Duration::from_secs(2));
    let app = broker_router(state.clone(), API_KEY.into(), 1 << 20);
    (app, state)
}

/// A broker serving on an ephemeral loopback port with its health sweep running.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub state: BrokerState,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start(router: RouterSettings, heartbeat: HeartbeatSettings) -> Self {
        let (app, state) = broker_app(router);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let sweeper = HealthSupervisor::new(
            state.broker.registry().clone(),
            &heartbeat,
            Duration::from_millis(50),
        )
        .spawn();
        Self {
            addr,
            state,
            server,
            sweeper,
        }
    }

    pub fn broker(&self) -> &TunnelBroker {
        &self.state.broker
    }

    pub fn register_url(&self) -> String {
        format!("ws://{}/api/tunnel/register", self.addr)
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.server.abort();
        self.sweeper.abort();
    }
}

/// Serve `app` on an ephemeral loopback port, standing in for the LLM runtime.
pub async fn spawn_runtime(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn wait_for_state(handle: &TunnelClientHandle, state: ClientState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("client never reached {}", state.as_str()))
        .unwrap();
}

pub async fn send_envelope<S>(ws: &mut WebSocketStream<S>, envelope: &Envelope)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Text(encode_text(envelope).into())).await.unwrap();
}

/// Next decoded envelope, or `None` once the peer closed.
pub async fn next_envelope<S>(ws: &mut WebSocketStream<S>) -> Option<Envelope>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(decode(text.as_bytes()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => {}
        }
    }
}

/// Register by hand and return the socket with the assigned session ID.
pub async fn raw_register(url: &str, tenant: &str, token: &str) -> (RawWs, String) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send_envelope(
        &mut ws,
        &Envelope::Register(Registration {
            tenant_id: tenant.into(),
            auth_token: token.into(),
            protocol_version: PROTOCOL_VERSION,
        }),
    )
    .await;
    match next_envelope(&mut ws).await {
        Some(Envelope::RegisterAck(ack)) => (ws, ack.session_id),
        other => panic!("expected register_ack, got {other:?}"),
    }
}
