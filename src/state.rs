//! Agent-side shared state: connection statistics and what the local status
//! handlers need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::tunnel::client::TunnelClientHandle;

/// State for the agent's status server.
#[derive(Clone)]
pub struct AgentState {
    /// Monotonic instant when the agent started (for uptime calculation).
    pub start_time: Instant,
    pub client: TunnelClientHandle,
    /// Local runtime origin the forwarder targets.
    pub local_url: String,
}

/// Tunnel connection event types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    Disconnected,
    PongTimeout,
    RegistrationRejected,
    BrokerShutdown,
    ReconnectAttempt,
    QueueOverflow,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::PongTimeout => "pong_timeout",
            Self::RegistrationRejected => "registration_rejected",
            Self::BrokerShutdown => "broker_shutdown",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Maximum number of pong RTT samples to keep for quality tracking.
const MAX_RTT_SAMPLES: usize = 20;

/// Tunnel connection statistics. Atomics for the hot path, a mutex only for
/// the event log and RTT samples.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub forwards_started: AtomicU64,
    pub forwards_cancelled: AtomicU64,
    pub dropped_outbound: AtomicU64,
    /// Epoch for computing relative timestamps in events.
    pub epoch: Instant,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
    /// Rolling window of pong RTT samples (ms).
    pub rtt_samples: Mutex<VecDeque<u64>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            forwards_started: AtomicU64::new(0),
            forwards_cancelled: AtomicU64::new(0),
            dropped_outbound: AtomicU64::new(0),
            epoch: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
            rtt_samples: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
        }
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// Record a pong RTT sample.
    pub async fn record_rtt(&self, rtt_ms: u64) {
        let mut samples = self.rtt_samples.lock().await;
        if samples.len() >= MAX_RTT_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(rtt_ms);
    }

    /// Compute median and p95 RTT from samples. Returns (median, p95) or None if empty.
    pub async fn rtt_stats(&self) -> Option<(u64, u64)> {
        let samples = self.rtt_samples.lock().await;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let p95_idx = (sorted.len() as f64 * 0.95).ceil() as usize;
        let p95 = sorted[p95_idx.min(sorted.len() - 1)];
        Some((median, p95))
    }

    /// JSON view for status endpoints.
    pub async fn to_json(&self) -> Value {
        let rtt = self.rtt_stats().await;
        #[allow(clippy::cast_possible_truncation)]
        let recent: Vec<Value> = self
            .events
            .lock()
            .await
            .iter()
            .rev()
            .take(10)
            .map(|e| {
                json!({
                    "at_ms": e.timestamp.duration_since(self.epoch).as_millis() as u64,
                    "type": e.event_type.as_str(),
                    "detail": e.detail,
                })
            })
            .collect();
        json!({
            "connected": self.connected.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "forwards_started": self.forwards_started.load(Ordering::Relaxed),
            "forwards_cancelled": self.forwards_cancelled.load(Ordering::Relaxed),
            "dropped_outbound": self.dropped_outbound.load(Ordering::Relaxed),
            "rtt_median_ms": rtt.map(|(m, _)| m),
            "rtt_p95_ms": rtt.map(|(_, p)| p),
            "recent_events": recent,
        })
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
