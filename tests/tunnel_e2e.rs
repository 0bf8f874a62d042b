//! Broker and agent wired together over real sockets.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{body::Bytes, routing::post, Router};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::connect_async;

use common::{
    next_envelope, raw_register, send_envelope, spawn_runtime, token_for, unused_port, wait_for_state, TestBroker,
    TestResult, API_KEY,
};
use llm_tunnel::tunnel::circuit::CircuitSettings;
use llm_tunnel::tunnel::client::{self, ClientEvent, ClientSettings};
use llm_tunnel::tunnel::forwarder::LocalForwarder;
use llm_tunnel::tunnel::health::HeartbeatSettings;
use llm_tunnel::tunnel::protocol::{codes, Envelope, Registration};
use llm_tunnel::tunnel::reconnect::ClientState;
use llm_tunnel::tunnel::router::{HttpRequest, RouterError, RouterSettings};

fn router_settings(request_timeout: Duration) -> RouterSettings {
    RouterSettings {
        request_timeout,
        circuit: CircuitSettings::default(),
    }
}

#[tokio::test]
async fn unreachable_runtime_yields_terminal_502() -> TestResult {
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let port = unused_port().await;
    let forwarder = LocalForwarder::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2))?;
    let agent = client::spawn(
        ClientSettings::new(broker.register_url(), "acme", token_for("acme")),
        Arc::new(forwarder),
    );
    wait_for_state(&agent.handle(), ClientState::Connected).await;

    let started = Instant::now();
    let response = broker
        .broker()
        .route("acme", HttpRequest::new("POST", "/api/generate"))
        .await?;
    assert_eq!(response.status, 502);
    assert!(response.tunnel_error.is_some());
    assert!(started.elapsed() < Duration::from_secs(5));

    let counters = broker.broker().metrics().snapshot("acme").await;
    assert_eq!(counters.failures, 1);

    agent.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn facade_relays_runtime_response() -> TestResult {
    let runtime = spawn_runtime(Router::new().route(
        "/api/generate",
        post(|body: Bytes| async move { format!("echo:{}", String::from_utf8_lossy(&body)) }),
    ))
    .await;
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let forwarder = LocalForwarder::new(&format!("http://{runtime}"), Duration::from_secs(5))?;
    let agent = client::spawn(
        ClientSettings::new(broker.register_url(), "acme", token_for("acme")),
        Arc::new(forwarder),
    );
    wait_for_state(&agent.handle(), ClientState::Connected).await;

    let http: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let request = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{}/t/acme/api/generate", broker.addr))
        .header("authorization", format!("Bearer {API_KEY}"))
        .header("x-tunnel-priority", "high")
        .body(Full::new(Bytes::from_static(b"why is the sky blue")))?;
    let response = http.request(request).await?;
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-tunnel-correlation-id"));
    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"echo:why is the sky blue");

    assert_eq!(agent.handle().stats().forwards_started.load(std::sync::atomic::Ordering::Relaxed), 1);
    agent.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn silent_agent_is_evicted_and_calls_fail_session_lost() -> TestResult {
    let heartbeat = HeartbeatSettings::new(Duration::from_millis(200), Duration::from_millis(100));
    let broker = TestBroker::start(router_settings(Duration::from_secs(10)), heartbeat).await;
    // Registers, then never answers anything.
    let (_silent, _session_id) = raw_register(&broker.register_url(), "acme", &token_for("acme")).await;

    let calls: Vec<_> = (0..3)
        .map(|n| {
            let router = broker.broker().clone();
            tokio::spawn(async move { router.route("acme", HttpRequest::new("GET", format!("/api/{n}"))).await })
        })
        .collect();

    for call in calls {
        let outcome = tokio::time::timeout(Duration::from_secs(3), call).await??;
        match outcome {
            Err(RouterError::SessionLost { tenant_id, reason, .. }) => {
                assert_eq!(tenant_id, "acme");
                assert_eq!(reason, "heartbeat timeout");
            }
            other => panic!("expected SessionLost, got {other:?}"),
        }
    }
    assert!(broker.broker().registry().get("acme").await.is_none());
    Ok(())
}

#[tokio::test]
async fn reregistration_supersedes_previous_session() -> TestResult {
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let token = token_for("acme");
    let (mut first, first_id) = raw_register(&broker.register_url(), "acme", &token).await;
    let (_second, second_id) = raw_register(&broker.register_url(), "acme", &token).await;
    assert_ne!(first_id, second_id);

    // The superseded connection is closed by the broker.
    assert!(next_envelope(&mut first).await.is_none());

    let live = broker.broker().registry().get("acme").await.expect("live session");
    assert_eq!(live.session_id, second_id);
    assert!(live.is_connected());
    assert_eq!(broker.broker().registry().len().await, 1);
    Ok(())
}

#[tokio::test]
async fn unsupported_version_is_refused() -> TestResult {
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let (mut ws, _) = connect_async(broker.register_url()).await?;
    send_envelope(
        &mut ws,
        &Envelope::Register(Registration {
            tenant_id: "acme".into(),
            auth_token: token_for("acme"),
            protocol_version: 2,
        }),
    )
    .await;
    match next_envelope(&mut ws).await {
        Some(Envelope::Error(err)) => assert_eq!(err.code, codes::UNSUPPORTED_VERSION),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(next_envelope(&mut ws).await.is_none());
    assert!(broker.broker().registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn rejected_token_parks_client_until_updated() -> TestResult {
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let port = unused_port().await;
    let forwarder = LocalForwarder::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(1))?;
    // Token issued for another tenant.
    let agent = client::spawn(
        ClientSettings::new(broker.register_url(), "acme", token_for("globex")),
        Arc::new(forwarder),
    );
    let handle = agent.handle();
    let mut events = handle.subscribe();

    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::AuthFailed { reason }) = events.recv().await {
                return reason;
            }
        }
    })
    .await?;
    assert!(reason.starts_with(codes::AUTH_REJECTED), "{reason}");
    assert_eq!(handle.state(), ClientState::Disconnected);
    assert!(broker.broker().registry().is_empty().await);

    handle.update_token(token_for("acme"));
    wait_for_state(&handle, ClientState::Connected).await;
    assert!(broker.broker().registry().get("acme").await.is_some());

    agent.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn client_shutdown_unregisters_session() -> TestResult {
    let broker = TestBroker::start(router_settings(Duration::from_secs(5)), HeartbeatSettings::default()).await;
    let port = unused_port().await;
    let forwarder = LocalForwarder::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(1))?;
    let agent = client::spawn(
        ClientSettings::new(broker.register_url(), "acme", token_for("acme")),
        Arc::new(forwarder),
    );
    let handle = agent.handle();
    wait_for_state(&handle, ClientState::Connected).await;

    agent.shutdown().await;
    assert_eq!(handle.state(), ClientState::Shutdown);

    let registry = broker.broker().registry().clone();
    tokio::time::timeout(Duration::from_secs(3), async {
        while registry.get("acme").await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}
