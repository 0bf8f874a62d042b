//! Liveness supervision for both ends of the tunnel.
//!
//! Broker side, [`HealthSupervisor`] periodically evicts sessions that have
//! gone silent and expires pending calls past their deadline. Agent side,
//! [`HeartbeatMonitor`] tracks the outstanding ping and tells the connection
//! loop when a pong is overdue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::protocol::{unix_ms, Envelope};
use super::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// How often the agent pings while connected.
    pub interval: Duration,
    /// How long the agent waits for the matching pong.
    pub pong_timeout: Duration,
    /// Broker evicts a session after this long without any inbound frame.
    pub stale_threshold: Duration,
}

impl HeartbeatSettings {
    /// Settings with the stale threshold at 1.5 × `interval`.
    pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
            stale_threshold: interval * 3 / 2,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(5))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Tenants whose sessions were evicted.
    pub evicted: Vec<String>,
    /// Pending calls failed for passing their deadline.
    pub expired: usize,
}

/// Broker-side sweeper.
pub struct HealthSupervisor {
    registry: Arc<SessionRegistry>,
    stale_threshold: Duration,
    sweep_interval: Duration,
}

impl HealthSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, heartbeat: &HeartbeatSettings, sweep_interval: Duration) -> Self {
        Self {
            registry,
            stale_threshold: heartbeat.stale_threshold,
            sweep_interval,
        }
    }

    /// One pass: evict stale sessions, then time out overdue calls on the
    /// sessions that remain.
    pub async fn sweep_once(&self) -> SweepReport {
        let evicted = self.registry.sweep_stale(self.stale_threshold).await;
        let now = Instant::now();
        let mut expired = 0;
        for session in self.registry.sessions().await {
            for correlation_id in session.pending.expire(now) {
                debug!(
                    tenant_id = %session.tenant_id,
                    correlation_id = %correlation_id,
                    "Pending call passed its deadline"
                );
                let _ = session.tx.try_send(Envelope::Cancel { correlation_id });
                expired += 1;
            }
        }
        if !evicted.is_empty() || expired > 0 {
            warn!(evicted = evicted.len(), expired, "Health sweep");
        }
        SweepReport { evicted, expired }
    }

    /// Run [`sweep_once`](Self::sweep_once) every sweep interval until aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

/// Agent-side ping/pong bookkeeping.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    pong_timeout: Duration,
    /// Timestamp carried by the oldest unanswered ping, and when it went out.
    outstanding: Option<(u64, Instant)>,
}

impl HeartbeatMonitor {
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            outstanding: None,
        }
    }

    /// Build the next ping. An unanswered earlier ping keeps its deadline.
    pub fn ping(&mut self) -> Envelope {
        let ts = unix_ms();
        if self.outstanding.is_none() {
            self.outstanding = Some((ts, Instant::now()));
        }
        Envelope::Ping { ts }
    }

    /// Record a pong. Returns the round-trip time if it answers the
    /// outstanding ping.
    pub fn pong(&mut self, ts: u64) -> Option<Duration> {
        match self.outstanding {
            Some((sent_ts, sent_at)) if ts >= sent_ts => {
                self.outstanding = None;
                Some(sent_at.elapsed())
            }
            _ => None,
        }
    }

    /// When the outstanding ping becomes overdue.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.map(|(_, sent_at)| sent_at + self.pong_timeout)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }
}
