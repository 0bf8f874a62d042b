//! Tenant → live tunnel session.
//!
//! The registry is the single source of truth for whether a tenant is
//! reachable. Every insert and removal goes through its write lock, so two
//! registrations racing for one tenant are serialized and the later one wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use super::pending::{CallFailure, PendingCalls};
use super::protocol::Envelope;

/// Capacity of each session's outbound envelope channel.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connected = 0,
    Closing = 1,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

/// A registered agent connection.
pub struct TunnelSession {
    pub session_id: String,
    pub tenant_id: String,
    pub protocol_version: u32,
    /// Envelopes written to the agent by the session's writer task.
    pub tx: mpsc::Sender<Envelope>,
    /// Unix ms at registration.
    pub created_at_ms: u64,
    pub connected_since: Instant,
    /// Last inbound frame, as ms since the registry epoch.
    last_heartbeat_ms: AtomicU64,
    state: AtomicU8,
    pub pending: PendingCalls,
    /// Flipped to `true` to make the session's read loop exit.
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelSession {
    /// Build a session. The returned receiver fires when the registry
    /// supersedes or evicts it.
    pub fn new(
        tenant_id: impl Into<String>,
        protocol_version: u32,
        tx: mpsc::Sender<Envelope>,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            protocol_version,
            tx,
            created_at_ms: super::protocol::unix_ms(),
            connected_since: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Connected as u8),
            pending: PendingCalls::new(),
            shutdown_tx,
        };
        (session, shutdown_rx)
    }

    pub fn state(&self) -> SessionState {
        if self.state.load(Ordering::Acquire) == SessionState::Connected as u8 {
            SessionState::Connected
        } else {
            SessionState::Closing
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Mark closing, stop the read loop and fail every outstanding call.
    fn close(&self, reason: &str) -> usize {
        self.state.store(SessionState::Closing as u8, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        let drained = self.pending.drain(&CallFailure::SessionLost(reason.to_string()));
        if drained > 0 {
            info!(
                tenant_id = %self.tenant_id,
                session_id = %self.session_id,
                drained,
                "Failed {drained} pending calls: {reason}"
            );
        }
        drained
    }
}

/// Point-in-time view of one session, for listings.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub tenant_id: String,
    pub session_id: String,
    pub protocol_version: u32,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub connected_for: Duration,
    pub heartbeat_age: Duration,
    pub pending: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TunnelSession>>>,
    epoch: Instant,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Install `session` as its tenant's live session, closing any previous one.
    pub async fn insert(&self, session: TunnelSession) -> Arc<TunnelSession> {
        session.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
        let session = Arc::new(session);
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.insert(session.tenant_id.clone(), session.clone()) {
            warn!(
                tenant_id = %old.tenant_id,
                old_session = %old.session_id,
                new_session = %session.session_id,
                "Tenant re-registered, superseding previous session"
            );
            old.close("superseded by new registration");
        }
        session
    }

    /// Remove the tenant's session if it is still `session_id`, failing its
    /// pending calls. A superseded connection cleaning up after itself finds a
    /// different session ID and leaves its successor alone.
    pub async fn remove(&self, tenant_id: &str, session_id: &str, reason: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(tenant_id) {
                Some(s) if s.session_id == session_id => sessions.remove(tenant_id),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                session.close(reason);
                true
            }
            None => false,
        }
    }

    /// The tenant's live session, if any.
    pub async fn get(&self, tenant_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.read().await.get(tenant_id).cloned()
    }

    /// Record inbound traffic for `session`.
    pub fn touch(&self, session: &TunnelSession) {
        session.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn heartbeat_age(&self, session: &TunnelSession) -> Duration {
        let last = session.last_heartbeat_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Evict sessions silent for longer than `threshold`. Returns the evicted
    /// tenant IDs.
    ///
    /// Single write-lock pass: a heartbeat landing between a read and a later
    /// write lock cannot resurrect a session we already decided to evict.
    pub async fn sweep_stale(&self, threshold: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| self.heartbeat_age(s) > threshold)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        for tenant in &stale {
            if let Some(session) = sessions.remove(tenant) {
                warn!(
                    tenant_id = %tenant,
                    session_id = %session.session_id,
                    silent_ms = self.heartbeat_age(&session).as_millis() as u64,
                    "Evicted session (heartbeat timeout)"
                );
                session.close("heartbeat timeout");
            }
        }
        stale
    }

    /// All live sessions.
    pub async fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSnapshot> = sessions
            .values()
            .map(|s| SessionSnapshot {
                tenant_id: s.tenant_id.clone(),
                session_id: s.session_id.clone(),
                protocol_version: s.protocol_version,
                state: s.state(),
                created_at_ms: s.created_at_ms,
                connected_for: s.connected_since.elapsed(),
                heartbeat_age: self.heartbeat_age(s),
                pending: s.pending.len(),
            })
            .collect();
        list.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Send an envelope to every session without waiting on any writer.
    /// Sessions whose writer is backed up are skipped; those whose writer is
    /// gone are evicted.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let mut dead = Vec::new();
        for session in self.sessions().await {
            match session.tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(tenant_id = %session.tenant_id, "Session writer backed up, broadcast skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(tenant_id = %session.tenant_id, "Failed to send broadcast to session");
                    dead.push(session);
                }
            }
        }
        for session in dead {
            self.remove(&session.tenant_id, &session.session_id, "broadcast send failed")
                .await;
        }
    }

    /// Close and forget every session (broker shutdown).
    pub async fn drain_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (tenant, session) in sessions.drain() {
            session.close("broker shutting down");
            info!(tenant_id = %tenant, "Drained session for broker shutdown");
        }
    }
}
