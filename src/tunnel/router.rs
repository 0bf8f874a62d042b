//! Request router: HTTP-shaped request in, relayed response out.
//!
//! [`TunnelBroker::route`] looks up the tenant's live session, asks the
//! tenant's circuit breaker, registers a pending call and writes the request
//! envelope to the session. It then suspends only on that pending call. The
//! session's read loop hands response chunks back through
//! [`TunnelBroker::on_response`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreakers, CircuitPermit, CircuitSettings};
use super::metrics::{Outcome, RouterMetrics};
use super::pending::{BodyChunk, CallFailure, Delivery, HttpResponse, ResponseHead};
use super::protocol::{Envelope, Headers, Priority, RequestEnvelope, ResponseEnvelope};
use super::registry::{SessionRegistry, TunnelSession};

/// An inbound request to relay to a tenant's local runtime.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub priority: Priority,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    fn into_envelope(self) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(self.method, self.path).with_priority(self.priority);
        envelope.headers = self.headers;
        envelope.body = self.body;
        envelope
    }
}

/// A relayed response whose body is still arriving.
pub struct StreamingResponse {
    pub correlation_id: String,
    pub head: ResponseHead,
    pub body: BoxStream<'static, BodyChunk>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no live tunnel session for tenant {tenant_id}")]
    SessionNotFound { tenant_id: String },
    #[error("circuit open for tenant {tenant_id}, retry in {}s", retry_after.as_secs())]
    CircuitOpen {
        tenant_id: String,
        retry_after: Duration,
    },
    #[error("request {correlation_id} for tenant {tenant_id} timed out")]
    RequestTimeout {
        tenant_id: String,
        correlation_id: String,
    },
    #[error("tunnel session for tenant {tenant_id} lost during request {correlation_id}: {reason}")]
    SessionLost {
        tenant_id: String,
        correlation_id: String,
        reason: String,
    },
}

impl RouterError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "session_not_found",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::SessionLost { .. } => "session_lost",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            Self::SessionNotFound { tenant_id }
            | Self::CircuitOpen { tenant_id, .. }
            | Self::RequestTimeout { tenant_id, .. }
            | Self::SessionLost { tenant_id, .. } => tenant_id,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::RequestTimeout { correlation_id, .. } | Self::SessionLost { correlation_id, .. } => {
                Some(correlation_id)
            }
            _ => None,
        }
    }
}

/// Handles requests the agent originates toward the broker.
pub trait AgentRequestHandler: Send + Sync {
    fn handle(&self, tenant_id: &str, request: RequestEnvelope) -> BoxFuture<'static, ResponseEnvelope>;
}

/// Logs agent-originated requests and acknowledges them with `202 Accepted`.
pub struct LoggingAgentHandler;

impl AgentRequestHandler for LoggingAgentHandler {
    fn handle(&self, tenant_id: &str, request: RequestEnvelope) -> BoxFuture<'static, ResponseEnvelope> {
        info!(
            tenant_id,
            correlation_id = %request.correlation_id,
            method = %request.method,
            path = %request.path,
            priority = request.priority.as_str(),
            "Agent-originated request"
        );
        Box::pin(async move { ResponseEnvelope::complete(request.correlation_id, 202, Vec::new(), Vec::new()) })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    /// Deadline for a buffered call; idle limit between chunks of a streamed one.
    pub request_timeout: Duration,
    pub circuit: CircuitSettings,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            circuit: CircuitSettings::default(),
        }
    }
}

/// Fails the pending call and tells the agent to stop if the caller goes
/// away before the call resolves.
struct CallGuard {
    session: Arc<TunnelSession>,
    correlation_id: String,
    armed: bool,
}

impl CallGuard {
    fn new(session: Arc<TunnelSession>, correlation_id: String) -> Self {
        Self {
            session,
            correlation_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.armed
            && self
                .session
                .pending
                .fail(&self.correlation_id, CallFailure::SessionLost("caller went away".into()))
        {
            debug!(correlation_id = %self.correlation_id, "Caller dropped, cancelling");
            send_cancel(&self.session, &self.correlation_id);
        }
    }
}

/// Write the request to the session, bounded by the call's deadline. A
/// writer that cannot take it in time fails the call with a timeout.
async fn dispatch(session: &TunnelSession, envelope: RequestEnvelope, deadline: Instant) {
    let correlation_id = envelope.correlation_id.clone();
    match tokio::time::timeout_at(deadline, session.tx.send(Envelope::Request(envelope))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            session
                .pending
                .fail(&correlation_id, CallFailure::SessionLost("send failed".into()));
        }
        Err(_) => {
            warn!(tenant_id = %session.tenant_id, correlation_id = %correlation_id, "Session writer backed up, request not sent");
            session.pending.fail(&correlation_id, CallFailure::Timeout);
        }
    }
}

fn send_cancel(session: &TunnelSession, correlation_id: &str) {
    let _ = session.tx.try_send(Envelope::Cancel {
        correlation_id: correlation_id.to_string(),
    });
}

#[derive(Clone)]
pub struct TunnelBroker {
    registry: Arc<SessionRegistry>,
    breakers: CircuitBreakers,
    metrics: Arc<RouterMetrics>,
    request_timeout: Duration,
    agent_handler: Arc<dyn AgentRequestHandler>,
}

impl TunnelBroker {
    pub fn new(registry: Arc<SessionRegistry>, settings: RouterSettings) -> Self {
        Self {
            registry,
            breakers: CircuitBreakers::new(settings.circuit),
            metrics: Arc::new(RouterMetrics::new()),
            request_timeout: settings.request_timeout,
            agent_handler: Arc::new(LoggingAgentHandler),
        }
    }

    #[must_use]
    pub fn with_agent_handler(mut self, handler: Arc<dyn AgentRequestHandler>) -> Self {
        self.agent_handler = handler;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    async fn admit(&self, tenant_id: &str) -> Result<(Arc<TunnelSession>, CircuitPermit), RouterError> {
        let Some(session) = self.registry.get(tenant_id).await.filter(|s| s.is_connected()) else {
            debug!(tenant_id, kind = "session_not_found", "No live session");
            return Err(RouterError::SessionNotFound {
                tenant_id: tenant_id.to_string(),
            });
        };
        match self.breakers.try_acquire(tenant_id) {
            Ok(permit) => Ok((session, permit)),
            Err(retry_after) => {
                self.metrics.record(tenant_id, Outcome::CircuitRejected).await;
                warn!(tenant_id, kind = "circuit_open", "Rejected by circuit breaker");
                Err(RouterError::CircuitOpen {
                    tenant_id: tenant_id.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Map a call failure to the caller's error, reporting it to the breaker
    /// and counters.
    async fn fail(
        &self,
        session: &TunnelSession,
        permit: CircuitPermit,
        correlation_id: String,
        failure: CallFailure,
    ) -> RouterError {
        permit.fail();
        let tenant_id = session.tenant_id.clone();
        match failure {
            CallFailure::Timeout => {
                self.metrics.record(&tenant_id, Outcome::Timeout).await;
                warn!(tenant_id = %tenant_id, correlation_id = %correlation_id, kind = "request_timeout", "Request timed out");
                RouterError::RequestTimeout {
                    tenant_id,
                    correlation_id,
                }
            }
            CallFailure::SessionLost(reason) | CallFailure::Upstream(reason) => {
                self.metrics.record(&tenant_id, Outcome::Failure).await;
                warn!(tenant_id = %tenant_id, correlation_id = %correlation_id, kind = "session_lost", %reason, "Session lost mid-request");
                RouterError::SessionLost {
                    tenant_id,
                    correlation_id,
                    reason,
                }
            }
        }
    }

    async fn settle(&self, tenant_id: &str, permit: CircuitPermit, tunnel_error: Option<&str>) {
        match tunnel_error {
            Some(err) => {
                warn!(tenant_id, error = err, "Agent reported tunnel-side failure");
                permit.fail();
                self.metrics.record(tenant_id, Outcome::Failure).await;
            }
            None => {
                permit.succeed();
                self.metrics.record(tenant_id, Outcome::Success).await;
            }
        }
    }

    /// Relay `request` and wait for the complete response.
    pub async fn route(&self, tenant_id: &str, request: HttpRequest) -> Result<HttpResponse, RouterError> {
        let (session, permit) = self.admit(tenant_id).await?;
        let envelope = request.into_envelope();
        let correlation_id = envelope.correlation_id.clone();
        let deadline = Instant::now() + self.request_timeout;

        let mut rx = session.pending.register_buffered(correlation_id.clone(), deadline);
        let mut guard = CallGuard::new(session.clone(), correlation_id.clone());
        dispatch(&session, envelope, deadline).await;

        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(resolved) => resolved,
            Err(_) => {
                // Whoever removes the entry owns the outcome; if a response
                // won the race it is already waiting in `rx`.
                if session.pending.fail(&correlation_id, CallFailure::Timeout) {
                    send_cancel(&session, &correlation_id);
                }
                rx.await
            }
        };
        guard.disarm();

        match outcome.unwrap_or_else(|_| Err(CallFailure::SessionLost("pending call dropped".into()))) {
            Ok(response) => {
                self.settle(tenant_id, permit, response.tunnel_error.as_deref()).await;
                Ok(response)
            }
            Err(failure) => Err(self.fail(&session, permit, correlation_id, failure).await),
        }
    }

    /// Relay `request` and return as soon as the response head arrives. The
    /// body stream yields chunks in order; the request timeout bounds the wait
    /// for the head and each gap between chunks.
    pub async fn route_streaming(
        &self,
        tenant_id: &str,
        request: HttpRequest,
    ) -> Result<StreamingResponse, RouterError> {
        let (session, permit) = self.admit(tenant_id).await?;
        let envelope = request.into_envelope();
        let correlation_id = envelope.correlation_id.clone();

        let deadline = Instant::now() + self.request_timeout;

        let (mut head_rx, body_rx) = session
            .pending
            .register_streaming(correlation_id.clone(), self.request_timeout);
        let mut guard = CallGuard::new(session.clone(), correlation_id.clone());
        dispatch(&session, envelope, deadline).await;

        let outcome = match tokio::time::timeout_at(deadline, &mut head_rx).await {
            Ok(resolved) => resolved,
            Err(_) => {
                if session.pending.fail(&correlation_id, CallFailure::Timeout) {
                    send_cancel(&session, &correlation_id);
                }
                head_rx.await
            }
        };

        let head = match outcome.unwrap_or_else(|_| Err(CallFailure::SessionLost("pending call dropped".into()))) {
            Ok(head) => head,
            Err(failure) => {
                guard.disarm();
                return Err(self.fail(&session, permit, correlation_id, failure).await);
            }
        };

        let body = if head.tunnel_error.is_some() {
            self.settle(tenant_id, permit, head.tunnel_error.as_deref()).await;
            body_stream(body_rx, None, guard)
        } else {
            let outcome = StreamOutcome {
                permit,
                metrics: self.metrics.clone(),
                tenant_id: tenant_id.to_string(),
            };
            body_stream(body_rx, Some(outcome), guard)
        };

        Ok(StreamingResponse {
            correlation_id,
            head,
            body,
        })
    }

    /// Hand a response chunk from `session` to its pending call.
    pub fn on_response(&self, session: &TunnelSession, response: ResponseEnvelope) {
        let correlation_id = response.correlation_id.clone();
        match session.pending.deliver(response) {
            Delivery::Unknown => debug!(
                tenant_id = %session.tenant_id,
                correlation_id = %correlation_id,
                "Response for timed-out or unknown call (dropped)"
            ),
            Delivery::Duplicate => debug!(
                tenant_id = %session.tenant_id,
                correlation_id = %correlation_id,
                "Duplicate response chunk (dropped)"
            ),
            Delivery::OutOfWindow => {
                warn!(
                    tenant_id = %session.tenant_id,
                    correlation_id = %correlation_id,
                    "Response chunk too far out of order, call failed"
                );
                send_cancel(session, &correlation_id);
            }
            Delivery::Accepted | Delivery::Completed => {}
        }
    }

    /// Answer a request the agent sent us, off the session's read loop.
    pub fn on_agent_request(&self, session: &Arc<TunnelSession>, request: RequestEnvelope) {
        let handler = self.agent_handler.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let response = handler.handle(&session.tenant_id, request).await;
            if session.tx.send(Envelope::Response(response)).await.is_err() {
                debug!(tenant_id = %session.tenant_id, "Session closed before agent request was answered");
            }
        });
    }
}

/// Breaker permit and counters settled when a streamed body ends.
struct StreamOutcome {
    permit: CircuitPermit,
    metrics: Arc<RouterMetrics>,
    tenant_id: String,
}

impl StreamOutcome {
    async fn settle(self, failure: Option<&CallFailure>) {
        let outcome = match failure {
            None => {
                self.permit.succeed();
                Outcome::Success
            }
            Some(CallFailure::Timeout) => {
                self.permit.fail();
                Outcome::Timeout
            }
            Some(_) => {
                self.permit.fail();
                Outcome::Failure
            }
        };
        self.metrics.record(&self.tenant_id, outcome).await;
    }
}

struct BodyState {
    rx: mpsc::UnboundedReceiver<BodyChunk>,
    outcome: Option<StreamOutcome>,
    guard: CallGuard,
}

/// Adapt the pending call's chunk channel into a stream that reports the
/// call's final outcome to the breaker and counters.
fn body_stream(
    rx: mpsc::UnboundedReceiver<BodyChunk>,
    outcome: Option<StreamOutcome>,
    guard: CallGuard,
) -> BoxStream<'static, BodyChunk> {
    let state = BodyState { rx, outcome, guard };
    Box::pin(stream::unfold(state, |mut state| async move {
        match state.rx.recv().await {
            Some(Ok(bytes)) => Some((Ok::<Bytes, CallFailure>(bytes), state)),
            Some(Err(failure)) => {
                state.guard.disarm();
                if let Some(outcome) = state.outcome.take() {
                    outcome.settle(Some(&failure)).await;
                }
                Some((Err(failure), state))
            }
            None => {
                state.guard.disarm();
                if let Some(outcome) = state.outcome.take() {
                    outcome.settle(None).await;
                }
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::circuit::CircuitState;
    use futures::StreamExt;

    fn broker(timeout: Duration) -> TunnelBroker {
        TunnelBroker::new(
            Arc::new(SessionRegistry::new()),
            RouterSettings {
                request_timeout: timeout,
                circuit: CircuitSettings {
                    failure_threshold: 5,
                    cooldown: Duration::from_secs(60),
                },
            },
        )
    }

    async fn connect(broker: &TunnelBroker, tenant: &str) -> (Arc<TunnelSession>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        let (session, _shutdown) = TunnelSession::new(tenant, 1, tx);
        (broker.registry().insert(session).await, rx)
    }

    async fn next_request(rx: &mut mpsc::Receiver<Envelope>) -> RequestEnvelope {
        loop {
            match rx.recv().await.expect("session channel open") {
                Envelope::Request(req) => return req,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn unknown_tenant_fails_fast() {
        let b = broker(Duration::from_secs(5));
        let err = b.route("ghost", HttpRequest::new("GET", "/api/tags")).await.unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
        assert_eq!(err.tenant_id(), "ghost");
        assert!(err.correlation_id().is_none());
    }

    #[tokio::test]
    async fn relays_chunked_response_in_order() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;

        let agent = {
            let b = b.clone();
            tokio::spawn(async move {
                let req = next_request(&mut rx).await;
                assert_eq!(req.path, "/api/generate");
                let id = req.correlation_id;
                let mut second = ResponseEnvelope::complete(id.clone(), 200, vec![], b" world".to_vec());
                second.seq = 1;
                let mut first = ResponseEnvelope::complete(id, 200, vec![("x-a".into(), "1".into())], b"hello".to_vec());
                first.is_final = false;
                b.on_response(&session, second);
                b.on_response(&session, first);
            })
        };

        let resp = b
            .route("acme", HttpRequest::new("POST", "/api/generate"))
            .await
            .unwrap();
        agent.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello world");
        assert_eq!(resp.headers, vec![("x-a".to_string(), "1".to_string())]);
        assert_eq!(b.metrics().snapshot("acme").await.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_frees_pending_call() {
        let b = broker(Duration::from_secs(2));
        let (session, mut rx) = connect(&b, "acme").await;

        let err = b.route("acme", HttpRequest::new("GET", "/slow")).await.unwrap_err();
        let RouterError::RequestTimeout { correlation_id, .. } = &err else {
            panic!("expected timeout, got {err:?}");
        };
        assert!(session.pending.is_empty());

        let req = next_request(&mut rx).await;
        assert_eq!(&req.correlation_id, correlation_id);
        match rx.recv().await.unwrap() {
            Envelope::Cancel { correlation_id: cancelled } => assert_eq!(&cancelled, correlation_id),
            other => panic!("expected cancel, got {}", other.kind()),
        }

        // A late response is dropped without effect.
        b.on_response(&session, ResponseEnvelope::complete(req.correlation_id, 200, vec![], vec![]));
        assert_eq!(b.metrics().snapshot("acme").await.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_timeouts_and_recovers_through_trial_call() {
        let b = broker(Duration::from_secs(1));
        let (session, mut rx) = connect(&b, "acme").await;

        for _ in 0..5 {
            let err = b.route("acme", HttpRequest::new("GET", "/api/tags")).await.unwrap_err();
            assert_eq!(err.kind(), "request_timeout");
        }
        assert_eq!(b.breakers().state("acme"), CircuitState::Open);

        let err = b.route("acme", HttpRequest::new("GET", "/api/tags")).await.unwrap_err();
        assert!(matches!(err, RouterError::CircuitOpen { .. }));

        // Five requests and five cancels went out; the sixth was never sent.
        let mut requests = 0;
        while let Ok(env) = rx.try_recv() {
            if matches!(env, Envelope::Request(_)) {
                requests += 1;
            }
        }
        assert_eq!(requests, 5);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(b.breakers().state("acme"), CircuitState::HalfOpen);

        let call = {
            let b = b.clone();
            tokio::spawn(async move { b.route("acme", HttpRequest::new("GET", "/api/tags")).await })
        };
        let req = next_request(&mut rx).await;
        b.on_response(&session, ResponseEnvelope::complete(req.correlation_id, 200, vec![], b"{}".to_vec()));
        assert_eq!(call.await.unwrap().unwrap().status, 200);
        assert_eq!(b.breakers().state("acme"), CircuitState::Closed);

        let counters = b.metrics().snapshot("acme").await;
        assert_eq!(counters.timeouts, 5);
        assert_eq!(counters.circuit_rejections, 1);
        assert_eq!(counters.successes, 1);
    }

    #[tokio::test]
    async fn runtime_errors_are_relayed_and_count_as_success() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;
        let agent = {
            let b = b.clone();
            tokio::spawn(async move {
                for status in [500, 502] {
                    let req = next_request(&mut rx).await;
                    let resp = if status == 500 {
                        ResponseEnvelope::complete(req.correlation_id, 500, vec![], b"model crashed".to_vec())
                    } else {
                        ResponseEnvelope::failure(req.correlation_id, 502, 0, "connection refused")
                    };
                    b.on_response(&session, resp);
                }
            })
        };

        let resp = b.route("acme", HttpRequest::new("POST", "/api/chat")).await.unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.tunnel_error.is_none());
        assert_eq!(b.breakers().snapshot("acme").consecutive_failures, 0);

        let resp = b.route("acme", HttpRequest::new("POST", "/api/chat")).await.unwrap();
        assert_eq!(resp.status, 502);
        assert_eq!(resp.tunnel_error.as_deref(), Some("connection refused"));
        assert_eq!(b.breakers().snapshot("acme").consecutive_failures, 1);
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn session_loss_fails_in_flight_calls() {
        let b = broker(Duration::from_secs(30));
        let (session, mut rx) = connect(&b, "acme").await;
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                tokio::spawn(async move { b.route("acme", HttpRequest::new("GET", "/x")).await })
            })
            .collect();
        for _ in 0..3 {
            next_request(&mut rx).await;
        }
        assert_eq!(session.pending.len(), 3);
        b.registry()
            .remove("acme", &session.session_id, "transport closed")
            .await;
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "session_lost");
            assert!(err.correlation_id().is_some());
        }
    }

    #[tokio::test]
    async fn streaming_returns_head_before_body_completes() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;

        let call = {
            let b = b.clone();
            tokio::spawn(async move { b.route_streaming("acme", HttpRequest::new("POST", "/api/generate")).await })
        };
        let req = next_request(&mut rx).await;
        let id = req.correlation_id;
        let mut head = ResponseEnvelope::complete(id.clone(), 200, vec![("content-type".into(), "application/x-ndjson".into())], b"a".to_vec());
        head.is_final = false;
        b.on_response(&session, head);

        let mut resp = call.await.unwrap().unwrap();
        assert_eq!(resp.head.status, 200);
        assert_eq!(resp.body.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));

        let mut tail = ResponseEnvelope::complete(id, 200, vec![], b"b".to_vec());
        tail.seq = 1;
        b.on_response(&session, tail);
        assert_eq!(resp.body.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(resp.body.next().await.is_none());
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_call() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;
        let call = {
            let b = b.clone();
            tokio::spawn(async move { b.route_streaming("acme", HttpRequest::new("POST", "/api/generate")).await })
        };
        let req = next_request(&mut rx).await;
        let mut head = ResponseEnvelope::complete(req.correlation_id.clone(), 200, vec![], vec![]);
        head.is_final = false;
        b.on_response(&session, head);
        drop(call.await.unwrap().unwrap());

        assert!(session.pending.is_empty());
        match rx.recv().await.unwrap() {
            Envelope::Cancel { correlation_id } => assert_eq!(correlation_id, req.correlation_id),
            other => panic!("expected cancel, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backed_up_writer_times_out_instead_of_hanging() {
        let b = broker(Duration::from_secs(2));
        let (tx, _rx) = mpsc::channel(1);
        let (session, _shutdown) = TunnelSession::new("acme", 1, tx);
        let session = b.registry().insert(session).await;
        session.tx.try_send(Envelope::Ping { ts: 0 }).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(600),
            b.route("acme", HttpRequest::new("GET", "/api/tags")),
        )
        .await
        .expect("route settles by its deadline")
        .unwrap_err();
        assert_eq!(err.kind(), "request_timeout");
        assert!(session.pending.is_empty());

        let streamed = tokio::time::timeout(
            Duration::from_secs(600),
            b.route_streaming("acme", HttpRequest::new("POST", "/api/generate")),
        )
        .await
        .expect("streaming route settles by its deadline");
        let Err(err) = streamed else {
            panic!("expected timeout");
        };
        assert_eq!(err.kind(), "request_timeout");
        assert!(session.pending.is_empty());

        assert_eq!(b.breakers().snapshot("acme").consecutive_failures, 2);
        assert_eq!(b.metrics().snapshot("acme").await.timeouts, 2);
    }

    #[tokio::test]
    async fn streamed_body_failure_is_counted_when_the_stream_ends() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;
        let call = {
            let b = b.clone();
            tokio::spawn(async move { b.route_streaming("acme", HttpRequest::new("POST", "/api/generate")).await })
        };
        let req = next_request(&mut rx).await;
        let mut head = ResponseEnvelope::complete(req.correlation_id.clone(), 200, vec![], b"a".to_vec());
        head.is_final = false;
        b.on_response(&session, head);

        let mut resp = call.await.unwrap().unwrap();
        assert_eq!(resp.head.status, 200);
        assert_eq!(b.metrics().snapshot("acme").await.requests, 0);

        b.on_response(&session, ResponseEnvelope::failure(req.correlation_id, 502, 1, "runtime hung up"));
        let mut failed = false;
        while let Some(piece) = resp.body.next().await {
            if let Err(failure) = piece {
                assert!(matches!(failure, CallFailure::Upstream(_)));
                failed = true;
            }
        }
        assert!(failed);

        let counters = b.metrics().snapshot("acme").await;
        assert_eq!(counters.requests, 1);
        assert_eq!(counters.successes, 0);
        assert_eq!(counters.failures, 1);
        assert_eq!(b.breakers().snapshot("acme").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn completed_stream_is_counted_once_at_the_end() {
        let b = broker(Duration::from_secs(5));
        let (session, mut rx) = connect(&b, "acme").await;
        let call = {
            let b = b.clone();
            tokio::spawn(async move { b.route_streaming("acme", HttpRequest::new("POST", "/api/generate")).await })
        };
        let req = next_request(&mut rx).await;
        b.on_response(&session, ResponseEnvelope::complete(req.correlation_id, 200, vec![], b"done".to_vec()));

        let mut resp = call.await.unwrap().unwrap();
        while resp.body.next().await.is_some() {}
        let counters = b.metrics().snapshot("acme").await;
        assert_eq!(counters.requests, 1);
        assert_eq!(counters.successes, 1);
    }
}
