//! Per-tenant dispatch counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Lock-free counters for one tenant.
#[derive(Default)]
pub struct TenantCounters {
    pub requests: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub circuit_rejections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
}

impl TenantCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one dispatch, as counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    CircuitRejected,
}

#[derive(Default)]
pub struct RouterMetrics {
    tenants: RwLock<HashMap<String, Arc<TenantCounters>>>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn counters(&self, tenant_id: &str) -> Arc<TenantCounters> {
        if let Some(c) = self.tenants.read().await.get(tenant_id) {
            return c.clone();
        }
        self.tenants
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    /// Count one dispatch and its outcome.
    pub async fn record(&self, tenant_id: &str, outcome: Outcome) {
        let c = self.counters(tenant_id).await;
        c.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &c.successes,
            Outcome::Failure => &c.failures,
            Outcome::Timeout => {
                c.failures.fetch_add(1, Ordering::Relaxed);
                &c.timeouts
            }
            Outcome::CircuitRejected => &c.circuit_rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self, tenant_id: &str) -> CountersSnapshot {
        match self.tenants.read().await.get(tenant_id) {
            Some(c) => c.snapshot(),
            None => CountersSnapshot::default(),
        }
    }

    pub async fn all(&self) -> Vec<(String, CountersSnapshot)> {
        let mut list: Vec<_> = self
            .tenants
            .read()
            .await
            .iter()
            .map(|(t, c)| (t.clone(), c.snapshot()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}
