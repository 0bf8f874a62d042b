//! Broker HTTP surface: agent registration, the tenant facade, and admin views.
//!
//! 1. Agents connect at `/api/tunnel/register` and authenticate with their
//!    first frame.
//! 2. `/t/{tenant}/{*path}` relays any HTTP request to the tenant's agent.
//! 3. `/api/tunnel/sessions` lists live sessions (admin key).

use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        DefaultBodyLimit, Path as AxumPath, Query, RawQuery, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::{decode, encode_text};
use super::forwarder::is_hop_by_hop;
use super::health::HeartbeatSettings;
use super::protocol::{codes, Envelope, Headers, Priority, Registration, RegistrationAck, PROTOCOL_VERSION};
use super::registry::{TunnelSession, SESSION_CHANNEL_CAPACITY};
use super::router::{HttpRequest, RouterError, RouterSettings, TunnelBroker};
use crate::auth::{constant_time_eq, require_api_key, ApiKey, TokenValidator};

/// Header selecting the priority tier of a relayed request.
pub const PRIORITY_HEADER: &str = "x-tunnel-priority";
/// Header carrying the correlation ID of a relayed response.
pub const CORRELATION_HEADER: &str = "x-tunnel-correlation-id";

/// How long a closing session's writer may take to flush queued frames.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Runtime settings for the broker process.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub listen: String,
    /// Bearer key for the `/t/` facade.
    pub api_key: String,
    /// `?token=` for `/api/tunnel/sessions`.
    pub admin_key: String,
    pub registration_timeout: Duration,
    pub max_body_bytes: usize,
    pub sweep_interval: Duration,
    pub heartbeat: HeartbeatSettings,
    pub router: RouterSettings,
}

/// State shared across broker handlers.
#[derive(Clone)]
pub struct BrokerState {
    pub broker: TunnelBroker,
    pub tokens: TokenValidator,
    pub admin_key: String,
    pub registration_timeout: Duration,
    pub started: Instant,
}

impl BrokerState {
    pub fn new(broker: TunnelBroker, tokens: TokenValidator, admin_key: String, registration_timeout: Duration) -> Self {
        Self {
            broker,
            tokens,
            admin_key,
            registration_timeout,
            started: Instant::now(),
        }
    }

    /// Tell every agent the broker is going away, then drain the registry.
    pub async fn shutdown(&self, reason: &str) {
        let registry = self.broker.registry();
        registry
            .broadcast(&Envelope::Shutdown {
                reason: reason.to_string(),
            })
            .await;
        registry.drain_all().await;
    }
}

/// Build the broker router with all tunnel endpoints.
pub fn broker_router(state: BrokerState, api_key: String, max_body_bytes: usize) -> Router {
    // Admin and agent endpoints authenticate themselves.
    let tunnel_admin = Router::new()
        .route("/api/health", get(broker_health))
        .route("/api/tunnel/register", get(agent_register_ws))
        .route("/api/tunnel/sessions", get(list_sessions));

    // Tenant facade: /t/{tenant}/*, bearer-authenticated.
    let tenant_facade = Router::new()
        .route("/t/{tenant}/{*path}", any(tenant_request))
        .route_layer(middleware::from_fn(require_api_key))
        .layer(Extension(ApiKey(api_key)))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    tunnel_admin
        .merge(tenant_facade)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Agent Registration ──────────────────────────────────────────────────────

/// `GET /api/tunnel/register`: agent WS. The first frame must be `register`.
async fn agent_register_ws(State(state): State<BrokerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn close_with(sink: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Send an error envelope and close with policy violation.
async fn reject(sink: &mut WsSink, code: &str, message: String) {
    warn!(code, %message, "Rejecting agent registration");
    let _ = sink
        .send(Message::Text(encode_text(&Envelope::error(code, message)).into()))
        .await;
    close_with(sink, close_code::POLICY, code).await;
}

/// Wait for the first data frame.
async fn first_frame(stream: &mut WsStream) -> Option<Vec<u8>> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => return Some(text.as_str().as_bytes().to_vec()),
            Message::Binary(data) => return Some(data.to_vec()),
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

async fn handle_agent_ws(socket: WebSocket, state: BrokerState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let frame = match tokio::time::timeout(state.registration_timeout, first_frame(&mut ws_stream)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("Agent disconnected before registration");
            return;
        }
        Err(_) => {
            warn!("Agent sent no registration within {:?}", state.registration_timeout);
            close_with(&mut ws_sink, close_code::POLICY, "registration timeout").await;
            return;
        }
    };

    let registration = match decode(&frame) {
        Ok(Envelope::Register(registration)) => registration,
        Ok(other) => {
            let message = format!("expected register, got {}", other.kind());
            reject(&mut ws_sink, codes::REGISTRATION_REQUIRED, message).await;
            return;
        }
        Err(e) => {
            reject(&mut ws_sink, codes::INVALID_FRAME, e.to_string()).await;
            return;
        }
    };

    if registration.protocol_version != PROTOCOL_VERSION {
        let message = format!(
            "protocol version {} not supported, expected {PROTOCOL_VERSION}",
            registration.protocol_version
        );
        reject(&mut ws_sink, codes::UNSUPPORTED_VERSION, message).await;
        return;
    }

    if let Err(e) = state.tokens.validate(&registration.auth_token, &registration.tenant_id) {
        warn!(tenant_id = %registration.tenant_id, error = %e, "Registration token refused");
        reject(&mut ws_sink, codes::AUTH_REJECTED, e.to_string()).await;
        return;
    }

    let span = info_span!("tunnel_session", tenant_id = %registration.tenant_id);
    serve_session(ws_sink, ws_stream, state, registration).instrument(span).await;
}

/// Run a registered agent's connection until it ends, then unregister it.
async fn serve_session(mut ws_sink: WsSink, mut ws_stream: WsStream, state: BrokerState, registration: Registration) {
    let broker = state.broker.clone();
    let registry = broker.registry().clone();

    let (tx, mut rx) = mpsc::channel::<Envelope>(SESSION_CHANNEL_CAPACITY);
    let (session, mut shutdown_rx) = TunnelSession::new(registration.tenant_id, registration.protocol_version, tx);
    let session = registry.insert(session).await;
    let tenant_id = session.tenant_id.clone();
    let session_id = session.session_id.clone();
    info!(session_id = %session_id, "Agent registered");

    let ack = Envelope::RegisterAck(RegistrationAck {
        session_id: session_id.clone(),
        server_time: super::protocol::unix_ms(),
    });
    if ws_sink.send(Message::Text(encode_text(&ack).into())).await.is_err() {
        registry.remove(&tenant_id, &session_id, "ack send failed").await;
        return;
    }

    // Writer: drain the session channel into the socket. On close, flush
    // what is already queued (e.g. a shutdown notice) before the close frame.
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if ws_sink.send(Message::Text(encode_text(&envelope).into())).await.is_err() {
                        return;
                    }
                }
                _ = &mut close_rx => {
                    while let Ok(envelope) = rx.try_recv() {
                        if ws_sink.send(Message::Text(encode_text(&envelope).into())).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        close_with(&mut ws_sink, close_code::NORMAL, "session closed").await;
    });

    let reason = loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = shutdown_rx.changed() => break "closed by broker".to_string(),
        };
        let data = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                registry.touch(&session);
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break "agent disconnected".to_string(),
            Some(Err(e)) => break format!("transport error: {e}"),
        };
        registry.touch(&session);

        let envelope = match decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Undecodable frame from agent, closing session");
                let _ = session.tx.try_send(Envelope::error(codes::INVALID_FRAME, e.to_string()));
                break format!("undecodable frame: {e}");
            }
        };
        match envelope {
            Envelope::Ping { ts } => {
                if session.tx.try_send(Envelope::Pong { ts }).is_err() {
                    debug!("Outbound channel full, pong dropped");
                }
            }
            Envelope::Pong { .. } => {}
            Envelope::Response(response) => broker.on_response(&session, response),
            Envelope::Request(request) => broker.on_agent_request(&session, request),
            Envelope::Shutdown { reason } => {
                info!(%reason, "Agent shutting down");
                break format!("agent shutdown: {reason}");
            }
            Envelope::Error(err) => {
                warn!(code = %err.code, message = %err.message, correlation_id = ?err.correlation_id, "Agent reported error");
            }
            other @ (Envelope::Register(_) | Envelope::RegisterAck(_) | Envelope::Cancel { .. }) => {
                debug!(kind = other.kind(), "Unexpected frame from agent (ignored)");
            }
        }
    };

    if registry.remove(&tenant_id, &session_id, &reason).await {
        info!(session_id = %session_id, %reason, "Agent disconnected");
    } else {
        debug!(session_id = %session_id, %reason, "Superseded or evicted session ended");
    }
    drop(session);
    let _ = close_tx.send(());
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

// ─── Admin ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AdminQuery {
    token: String,
}

/// `GET /api/tunnel/sessions?token=<admin_key>`: live sessions with circuit
/// state and counters.
async fn list_sessions(State(state): State<BrokerState>, Query(query): Query<AdminQuery>) -> Response {
    if !constant_time_eq(state.admin_key.as_bytes(), query.token.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid admin token", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    let broker = &state.broker;
    let snapshots = broker.registry().snapshot().await;
    let mut list: Vec<Value> = Vec::with_capacity(snapshots.len());
    for s in snapshots {
        let circuit = broker.breakers().snapshot(&s.tenant_id);
        let counters = broker.metrics().snapshot(&s.tenant_id).await;
        list.push(json!({
            "tenant_id": s.tenant_id,
            "session_id": s.session_id,
            "protocol_version": s.protocol_version,
            "state": s.state.as_str(),
            "created_at_ms": s.created_at_ms,
            "connected_for_ms": s.connected_for.as_millis() as u64,
            "last_heartbeat_ago_ms": s.heartbeat_age.as_millis() as u64,
            "pending_requests_count": s.pending,
            "circuit": {
                "state": circuit.state.as_str(),
                "consecutive_failures": circuit.consecutive_failures,
            },
            "counters": counters,
        }));
    }

    let count = list.len();
    Json(json!({"sessions": list, "count": count})).into_response()
}

/// `GET /api/health`: liveness, no auth.
async fn broker_health(State(state): State<BrokerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "role": "broker",
        "uptime_secs": state.started.elapsed().as_secs(),
        "sessions": state.broker.registry().len().await,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── Tenant Facade ───────────────────────────────────────────────────────────

fn forwarded_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !is_hop_by_hop(name)
                && name != "host"
                && name != "authorization"
                && name != "content-length"
                && name != PRIORITY_HEADER
        })
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// `ANY /t/{tenant}/{*path}`: relay to the tenant's agent and stream the
/// response back.
async fn tenant_request(
    State(state): State<BrokerState>,
    AxumPath((tenant, path)): AxumPath<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let priority = match headers.get(PRIORITY_HEADER).map(HeaderValue::to_str) {
        None => Priority::Normal,
        Some(Ok(value)) => match Priority::parse(value) {
            Some(priority) => priority,
            None => return bad_request(&format!("invalid {PRIORITY_HEADER}: {value}")),
        },
        Some(Err(_)) => return bad_request(&format!("invalid {PRIORITY_HEADER}")),
    };

    let target = match query {
        Some(q) => format!("/{path}?{q}"),
        None => format!("/{path}"),
    };
    let mut request = HttpRequest::new(method.as_str(), target);
    request.headers = forwarded_headers(&headers);
    request.body = (!body.is_empty()).then(|| body.to_vec());
    request.priority = priority;

    match state.broker.route_streaming(&tenant, request).await {
        Ok(relayed) => {
            let status = StatusCode::from_u16(relayed.head.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from_stream(relayed.body));
            *response.status_mut() = status;
            let out = response.headers_mut();
            for (name, value) in &relayed.head.headers {
                if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    out.append(name, value);
                }
            }
            if let Ok(value) = HeaderValue::from_str(&relayed.correlation_id) {
                out.insert(CORRELATION_HEADER, value);
            }
            response
        }
        Err(e) => router_error_response(&e),
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message, "code": "BAD_REQUEST"})),
    )
        .into_response()
}

/// Map a routing failure to its HTTP response.
pub fn router_error_response(err: &RouterError) -> Response {
    let (status, code) = match err {
        RouterError::SessionNotFound { .. } | RouterError::SessionLost { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "AGENT_OFFLINE")
        }
        RouterError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "TEMPORARILY_UNAVAILABLE"),
        RouterError::RequestTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
    };
    warn!(
        tenant_id = %err.tenant_id(),
        correlation_id = ?err.correlation_id(),
        kind = err.kind(),
        "Tunnel request failed: {err}"
    );

    let mut response = (
        status,
        Json(json!({
            "error": err.to_string(),
            "code": code,
            "kind": err.kind(),
            "tenant_id": err.tenant_id(),
            "correlation_id": err.correlation_id(),
        })),
    )
        .into_response();
    if let RouterError::CircuitOpen { retry_after, .. } = err {
        let secs = retry_after.as_secs().max(1);
        response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
