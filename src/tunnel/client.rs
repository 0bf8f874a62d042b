//! Tunnel client: the agent's outbound WebSocket to the broker.
//!
//! One task owns the connection and drives [`ClientState`] through its
//! transitions: dial, register, serve, and on loss back off and redial.
//! While connected it forwards inbound requests to the local runtime
//! (bounded by a semaphore), answers and sends heartbeats, and flushes the
//! outbound queue. Everything else talks to the task through a
//! [`TunnelClientHandle`].

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::{decode, encode_text};
use super::forwarder::Forward;
use super::health::{HeartbeatMonitor, HeartbeatSettings};
use super::protocol::{codes, Envelope, Priority, Registration, RegistrationAck, RequestEnvelope, ResponseEnvelope, PROTOCOL_VERSION};
use super::queue::{Enqueued, OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use super::reconnect::{Backoff, BackoffSettings, ClientState, Transition};
use crate::state::{TunnelEventType, TunnelStats};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Capacity of the channel carrying forwarder output back to the socket.
const FORWARD_OUTPUT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Broker registration endpoint, e.g. `wss://broker.example/api/tunnel/register`.
    pub url: String,
    pub tenant_id: String,
    pub auth_token: String,
    pub heartbeat: HeartbeatSettings,
    pub backoff: BackoffSettings,
    pub queue_capacity: usize,
    /// Bounds both the dial and the wait for `register_ack`.
    pub registration_timeout: Duration,
    pub max_concurrent_forwards: usize,
}

impl ClientSettings {
    pub fn new(url: impl Into<String>, tenant_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tenant_id: tenant_id.into(),
            auth_token: auth_token.into(),
            heartbeat: HeartbeatSettings::default(),
            backoff: BackoffSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            registration_timeout: Duration::from_secs(10),
            max_concurrent_forwards: 16,
        }
    }
}

/// Notifications published by the client task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    Registered { session_id: String },
    /// The broker refused the credential. The client waits for
    /// [`TunnelClientHandle::update_token`].
    AuthFailed { reason: String },
    /// Reconnect attempts ran out; the client task has ended.
    ReconnectFailed { attempts: u32 },
    /// An outbound request was dropped because the queue was full.
    QueueFull { correlation_id: String, priority: Priority },
    /// The broker answered an agent-originated request.
    Response(ResponseEnvelope),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("outbound queue full, dropped {priority:?} request {correlation_id}")]
    QueueFull { correlation_id: String, priority: Priority },
    #[error("tunnel client has shut down")]
    Closed,
}

struct Shared {
    queue: Mutex<OutboundQueue>,
    queue_notify: Notify,
    token: watch::Sender<String>,
    state: watch::Sender<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    stats: Arc<TunnelStats>,
    stop: watch::Sender<bool>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Apply `transition` if it is valid from the current state.
    fn transition(&self, transition: Transition) -> bool {
        let current = *self.state.borrow();
        match current.next(transition) {
            Some(next) => {
                self.state.send_replace(next);
                debug!(from = current.as_str(), to = next.as_str(), ?transition, "Tunnel state");
                self.emit(ClientEvent::StateChanged(next));
                true
            }
            None => {
                debug!(state = current.as_str(), ?transition, "Ignored transition");
                false
            }
        }
    }
}

/// Cheap, cloneable access to a running client.
#[derive(Clone)]
pub struct TunnelClientHandle {
    shared: Arc<Shared>,
}

impl TunnelClientHandle {
    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.shared.stats
    }

    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Queue an agent-originated request for the broker. It is sent as soon
    /// as the tunnel is connected, highest priority first.
    pub async fn enqueue(&self, request: RequestEnvelope) -> Result<(), ClientError> {
        if self.state() == ClientState::Shutdown {
            return Err(ClientError::Closed);
        }
        let outcome = self.shared.queue().push(request);
        let dropped = match outcome {
            Enqueued::Queued => None,
            Enqueued::Displaced(dropped) => Some((dropped, false)),
            Enqueued::Rejected(rejected) => Some((rejected, true)),
        };
        self.shared.queue_notify.notify_one();

        let Some((dropped, rejected)) = dropped else {
            return Ok(());
        };
        self.shared.stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .push_event(
                TunnelEventType::QueueOverflow,
                format!("dropped {} request {}", dropped.priority.as_str(), dropped.correlation_id),
            )
            .await;
        warn!(
            correlation_id = %dropped.correlation_id,
            priority = dropped.priority.as_str(),
            "Outbound queue full, dropping request"
        );
        self.shared.emit(ClientEvent::QueueFull {
            correlation_id: dropped.correlation_id.clone(),
            priority: dropped.priority,
        });
        if rejected {
            Err(ClientError::QueueFull {
                correlation_id: dropped.correlation_id,
                priority: dropped.priority,
            })
        } else {
            Ok(())
        }
    }

    /// Replace the registration credential. A client parked after an
    /// authentication failure starts reconnecting with the new token.
    pub fn update_token(&self, token: impl Into<String>) {
        self.shared.token.send_replace(token.into());
    }

    /// Ask the client task to stop. See [`TunnelClient::shutdown`] to also
    /// wait for it.
    pub fn request_shutdown(&self) {
        self.shared.stop.send_replace(true);
    }
}

/// A running client task.
pub struct TunnelClient {
    handle: TunnelClientHandle,
    task: JoinHandle<()>,
}

impl TunnelClient {
    pub fn handle(&self) -> TunnelClientHandle {
        self.handle.clone()
    }

    /// Stop the client: close the tunnel with a normal close frame, abort
    /// in-flight forwards and drop queued requests.
    pub async fn shutdown(self) {
        self.handle.request_shutdown();
        let _ = self.task.await;
    }

    /// Wait for the client task to end on its own (reconnect attempts
    /// exhausted) or after a shutdown request.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the client task.
pub fn spawn(settings: ClientSettings, forwarder: Arc<dyn Forward>) -> TunnelClient {
    let (events, _) = broadcast::channel(64);
    let shared = Arc::new(Shared {
        queue: Mutex::new(OutboundQueue::new(settings.queue_capacity)),
        queue_notify: Notify::new(),
        token: watch::channel(settings.auth_token.clone()).0,
        state: watch::channel(ClientState::Disconnected).0,
        events,
        stats: Arc::new(TunnelStats::new()),
        stop: watch::channel(false).0,
    });
    let span = info_span!("tunnel_client", tenant_id = %settings.tenant_id);
    let task = tokio::spawn(run(shared.clone(), settings, forwarder).instrument(span));
    TunnelClient {
        handle: TunnelClientHandle { shared },
        task,
    }
}

/// Why a connection attempt ended.
#[derive(Debug)]
enum Disconnect {
    /// Local shutdown requested.
    Stopped,
    /// The broker refused the registration.
    Rejected(String),
    /// The broker announced it is going away.
    BrokerShutdown(String),
    /// Anything else: dial failure, transport error, pong timeout, close.
    Lost(String),
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn pong_overdue(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Main loop: connect, serve, back off, repeat.
async fn run(shared: Arc<Shared>, settings: ClientSettings, forwarder: Arc<dyn Forward>) {
    let mut backoff = Backoff::new(settings.backoff);
    let mut stop = shared.stop.subscribe();
    let mut token_rx = shared.token.subscribe();
    shared.transition(Transition::Start);

    loop {
        let token = token_rx.borrow_and_update().clone();
        info!(url = %settings.url, "Tunnel: connecting to broker");
        let disconnect = connect_and_run(&shared, &settings, &forwarder, &token, &mut backoff, &mut stop).await;
        shared.stats.connected.store(false, Ordering::Relaxed);

        match disconnect {
            Disconnect::Stopped => break,
            Disconnect::Rejected(reason) => {
                warn!(%reason, "Tunnel: registration rejected, waiting for a new credential");
                shared.transition(Transition::RegistrationRejected);
                shared
                    .stats
                    .push_event(TunnelEventType::RegistrationRejected, reason.clone())
                    .await;
                shared.emit(ClientEvent::AuthFailed { reason });
                tokio::select! {
                    changed = token_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = stopped(&mut stop) => break,
                }
                info!("Tunnel: credential updated, reconnecting");
                backoff.reset();
                shared.transition(Transition::Start);
                continue;
            }
            Disconnect::BrokerShutdown(reason) => {
                info!(%reason, "Tunnel: broker shutting down, reconnecting promptly");
                shared.stats.push_event(TunnelEventType::BrokerShutdown, reason).await;
                backoff.reset();
                shared.transition(Transition::ConnectionLost);
            }
            Disconnect::Lost(reason) => {
                warn!(%reason, "Tunnel: connection lost");
                shared.stats.push_event(TunnelEventType::Disconnected, reason).await;
                shared.transition(Transition::ConnectionLost);
            }
        }

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.attempt();
            warn!(attempts, "Tunnel: giving up after {attempts} reconnect attempts");
            shared.transition(Transition::RetriesExhausted);
            shared.emit(ClientEvent::ReconnectFailed { attempts });
            return;
        };
        shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .push_event(
                TunnelEventType::ReconnectAttempt,
                format!("attempt {} in {}ms", backoff.attempt(), delay.as_millis()),
            )
            .await;
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Tunnel: backing off");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = stopped(&mut stop) => break,
        }
        shared.transition(Transition::BackoffElapsed);
    }

    let dropped = shared.queue().drain().len();
    if dropped > 0 {
        info!(dropped, "Tunnel: discarded queued requests on shutdown");
    }
    shared.transition(Transition::Stop);
    info!("Tunnel: client stopped");
}

async fn send(sink: &mut WsSink, stats: &TunnelStats, envelope: &Envelope) -> Result<(), String> {
    sink.send(Message::Text(encode_text(envelope).into()))
        .await
        .map_err(|e| format!("send failed: {e}"))?;
    stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn close(sink: &mut WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client shutdown".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

/// Read frames until the broker acknowledges or refuses our registration.
async fn await_ack(stream: &mut WsStream, stats: &TunnelStats) -> Result<RegistrationAck, Disconnect> {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(Disconnect::Lost(format!("transport error: {e}"))),
        };
        stats.messages_received.fetch_add(1, Ordering::Relaxed);
        match decode(text.as_bytes()) {
            Ok(Envelope::RegisterAck(ack)) => return Ok(ack),
            Ok(Envelope::Error(err))
                if err.code == codes::AUTH_REJECTED || err.code == codes::UNSUPPORTED_VERSION =>
            {
                return Err(Disconnect::Rejected(format!("{}: {}", err.code, err.message)));
            }
            Ok(Envelope::Error(err)) => {
                return Err(Disconnect::Lost(format!("{}: {}", err.code, err.message)));
            }
            Ok(Envelope::Shutdown { reason }) => return Err(Disconnect::BrokerShutdown(reason)),
            Ok(other) => debug!(kind = other.kind(), "Ignoring frame before registration ack"),
            Err(e) => return Err(Disconnect::Lost(format!("undecodable frame: {e}"))),
        }
    }
    Err(Disconnect::Lost("closed before registration ack".into()))
}

/// A single connection attempt: dial, register, serve until disconnect.
async fn connect_and_run(
    shared: &Shared,
    settings: &ClientSettings,
    forwarder: &Arc<dyn Forward>,
    token: &str,
    backoff: &mut Backoff,
    stop: &mut watch::Receiver<bool>,
) -> Disconnect {
    let dial = tokio::time::timeout(
        settings.registration_timeout,
        tokio_tungstenite::connect_async(settings.url.as_str()),
    );
    let ws = tokio::select! {
        dialed = dial => match dialed {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Disconnect::Lost(format!("dial failed: {e}")),
            Err(_) => return Disconnect::Lost("dial timed out".into()),
        },
        () = stopped(stop) => return Disconnect::Stopped,
    };
    shared.transition(Transition::TransportConnected);
    let (mut sink, mut stream) = ws.split();

    let registration = Envelope::Register(Registration {
        tenant_id: settings.tenant_id.clone(),
        auth_token: token.to_string(),
        protocol_version: PROTOCOL_VERSION,
    });
    if let Err(e) = send(&mut sink, &shared.stats, &registration).await {
        return Disconnect::Lost(e);
    }

    let ack = tokio::select! {
        acked = tokio::time::timeout(settings.registration_timeout, await_ack(&mut stream, &shared.stats)) => {
            match acked {
                Ok(Ok(ack)) => ack,
                Ok(Err(disconnect)) => return disconnect,
                Err(_) => return Disconnect::Lost("registration timed out".into()),
            }
        }
        () = stopped(stop) => {
            close(&mut sink).await;
            return Disconnect::Stopped;
        }
    };

    shared.transition(Transition::RegistrationAcked);
    backoff.reset();
    shared.stats.connected.store(true, Ordering::Relaxed);
    shared
        .stats
        .push_event(TunnelEventType::Connected, format!("session {}", ack.session_id))
        .await;
    info!(session_id = %ack.session_id, "Tunnel: registered");
    shared.emit(ClientEvent::Registered {
        session_id: ack.session_id,
    });

    Connection::serve(Connection::new(shared, settings, forwarder.clone()), sink, stream, stop).await
}

/// Per-connection state while registered.
struct Connection<'a> {
    shared: &'a Shared,
    forwarder: Arc<dyn Forward>,
    heartbeat: HeartbeatMonitor,
    interval: Duration,
    permits: Arc<Semaphore>,
    forwards: JoinSet<()>,
    in_flight: HashMap<String, AbortHandle>,
    out_tx: mpsc::Sender<ResponseEnvelope>,
}

impl<'a> Connection<'a> {
    fn new(shared: &'a Shared, settings: &ClientSettings, forwarder: Arc<dyn Forward>) -> (Self, mpsc::Receiver<ResponseEnvelope>) {
        let (out_tx, out_rx) = mpsc::channel(FORWARD_OUTPUT_CAPACITY);
        let conn = Self {
            shared,
            forwarder,
            heartbeat: HeartbeatMonitor::new(settings.heartbeat.pong_timeout),
            // `interval_at` panics on a zero period.
            interval: settings.heartbeat.interval.max(Duration::from_millis(1)),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_forwards.max(1))),
            forwards: JoinSet::new(),
            in_flight: HashMap::new(),
            out_tx,
        };
        (conn, out_rx)
    }

    fn start_forward(&mut self, request: RequestEnvelope) {
        let correlation_id = request.correlation_id.clone();
        debug!(
            correlation_id = %correlation_id,
            method = %request.method,
            path = %request.path,
            "Forwarding to local runtime"
        );
        self.shared.stats.forwards_started.fetch_add(1, Ordering::Relaxed);
        let forwarder = self.forwarder.clone();
        let permits = self.permits.clone();
        let out = self.out_tx.clone();
        let handle = self.forwards.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let mut responses = forwarder.forward(request);
            while let Some(envelope) = responses.next().await {
                if out.send(envelope).await.is_err() {
                    break;
                }
            }
        });
        self.in_flight.insert(correlation_id, handle);
    }

    fn cancel_forward(&mut self, correlation_id: &str) {
        if let Some(handle) = self.in_flight.remove(correlation_id) {
            handle.abort();
            self.shared.stats.forwards_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id, "Forward cancelled by broker");
        }
    }

    /// Send everything queued, highest priority first. A request that fails
    /// to send goes back to the head of its tier.
    async fn flush_queue(&self, sink: &mut WsSink) -> Result<(), String> {
        loop {
            let next = self.shared.queue().pop();
            let Some(request) = next else {
                return Ok(());
            };
            let envelope = Envelope::Request(request);
            if let Err(e) = send(sink, &self.shared.stats, &envelope).await {
                if let Envelope::Request(request) = envelope {
                    self.shared.queue().push_front(request);
                }
                return Err(e);
            }
        }
    }

    async fn handle_frame(&mut self, sink: &mut WsSink, envelope: Envelope) -> Result<(), Disconnect> {
        match envelope {
            Envelope::Request(request) => self.start_forward(request),
            Envelope::Cancel { correlation_id } => self.cancel_forward(&correlation_id),
            Envelope::Ping { ts } => send(sink, &self.shared.stats, &Envelope::Pong { ts })
                .await
                .map_err(Disconnect::Lost)?,
            Envelope::Pong { ts } => {
                if let Some(rtt) = self.heartbeat.pong(ts) {
                    let rtt_ms = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX);
                    self.shared.stats.record_rtt(rtt_ms).await;
                }
            }
            Envelope::Response(response) => self.shared.emit(ClientEvent::Response(response)),
            Envelope::Shutdown { reason } => return Err(Disconnect::BrokerShutdown(reason)),
            Envelope::Error(err) => {
                warn!(code = %err.code, message = %err.message, correlation_id = ?err.correlation_id, "Broker reported error");
            }
            other @ (Envelope::Register(_) | Envelope::RegisterAck(_)) => {
                debug!(kind = other.kind(), "Unexpected frame while connected");
            }
        }
        Ok(())
    }

    async fn serve(
        (mut conn, mut out_rx): (Self, mpsc::Receiver<ResponseEnvelope>),
        mut sink: WsSink,
        mut stream: WsStream,
        stop: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        if let Err(e) = conn.flush_queue(&mut sink).await {
            return Disconnect::Lost(e);
        }
        let mut ping_timer = tokio::time::interval_at(Instant::now() + conn.interval, conn.interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let pong_deadline = conn.heartbeat.deadline();
            tokio::select! {
                () = stopped(stop) => {
                    info!("Tunnel: closing connection");
                    conn.forwards.abort_all();
                    close(&mut sink).await;
                    return Disconnect::Stopped;
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let detail = frame.map_or_else(String::new, |f| format!(" ({}: {})", f.code, f.reason));
                            return Disconnect::Lost(format!("broker closed the connection{detail}"));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Disconnect::Lost(format!("transport error: {e}")),
                        None => return Disconnect::Lost("connection closed".into()),
                    };
                    conn.shared.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let envelope = match decode(text.as_bytes()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(error = %e, "Tunnel: undecodable frame from broker");
                            return Disconnect::Lost(format!("undecodable frame: {e}"));
                        }
                    };
                    if let Err(disconnect) = conn.handle_frame(&mut sink, envelope).await {
                        return disconnect;
                    }
                }
                Some(response) = out_rx.recv() => {
                    if response.is_final {
                        conn.in_flight.remove(&response.correlation_id);
                    }
                    if let Err(e) = send(&mut sink, &conn.shared.stats, &Envelope::Response(response)).await {
                        return Disconnect::Lost(e);
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = conn.heartbeat.ping();
                    if let Err(e) = send(&mut sink, &conn.shared.stats, &ping).await {
                        return Disconnect::Lost(e);
                    }
                }
                () = pong_overdue(pong_deadline) => {
                    conn.shared
                        .stats
                        .push_event(TunnelEventType::PongTimeout, "no pong within timeout".into())
                        .await;
                    return Disconnect::Lost("pong timeout".into());
                }
                () = conn.shared.queue_notify.notified() => {
                    if let Err(e) = conn.flush_queue(&mut sink).await {
                        return Disconnect::Lost(e);
                    }
                }
                Some(joined) = conn.forwards.join_next(), if !conn.forwards.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "Forward task panicked");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, BoxStream};

    struct Echo;

    impl Forward for Echo {
        fn forward(&self, request: RequestEnvelope) -> BoxStream<'static, ResponseEnvelope> {
            let body = request.body.unwrap_or_default();
            Box::pin(stream::once(async move {
                ResponseEnvelope::complete(request.correlation_id, 200, vec![], body)
            }))
        }
    }

    fn unreachable_settings(queue_capacity: usize) -> ClientSettings {
        let mut settings = ClientSettings::new("ws://127.0.0.1:9/api/tunnel/register", "acme", "token");
        settings.queue_capacity = queue_capacity;
        settings.backoff = BackoffSettings {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(60),
            max_attempts: u32::MAX,
        };
        settings
    }

    #[tokio::test]
    async fn queue_full_is_signalled() {
        let client = spawn(unreachable_settings(2), Arc::new(Echo));
        let handle = client.handle();
        let mut events = handle.subscribe();

        handle.enqueue(RequestEnvelope::new("POST", "/a")).await.unwrap();
        handle.enqueue(RequestEnvelope::new("POST", "/b")).await.unwrap();
        let third = RequestEnvelope::new("POST", "/c");
        let third_id = third.correlation_id.clone();
        let err = handle.enqueue(third).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::QueueFull {
                correlation_id: third_id.clone(),
                priority: Priority::Normal,
            }
        );
        assert_eq!(handle.queued(), 2);
        assert!(handle
            .stats()
            .events
            .lock()
            .await
            .iter()
            .any(|e| e.event_type == TunnelEventType::QueueOverflow && e.detail.contains(&third_id)));

        loop {
            match events.recv().await.unwrap() {
                ClientEvent::QueueFull { correlation_id, .. } => {
                    assert_eq!(correlation_id, third_id);
                    break;
                }
                _ => continue,
            }
        }
        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_while_backing_off() {
        let client = spawn(unreachable_settings(4), Arc::new(Echo));
        let handle = client.handle();
        let mut state = handle.watch_state();
        state
            .wait_for(|s| *s == ClientState::Reconnecting)
            .await
            .unwrap();
        handle.enqueue(RequestEnvelope::new("GET", "/queued")).await.unwrap();

        client.shutdown().await;
        assert_eq!(handle.state(), ClientState::Shutdown);
        assert_eq!(handle.queued(), 0);
        assert!(matches!(
            handle.enqueue(RequestEnvelope::new("GET", "/late")).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_end_the_task() {
        let mut settings = unreachable_settings(4);
        settings.backoff = BackoffSettings {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(10),
            max_attempts: 2,
        };
        let client = spawn(settings, Arc::new(Echo));
        let handle = client.handle();
        let mut events = handle.subscribe();
        client.join().await;

        assert_eq!(handle.state(), ClientState::Disconnected);
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if event == (ClientEvent::ReconnectFailed { attempts: 2 }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }
}
