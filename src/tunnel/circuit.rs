//! Per-tenant circuit breaker guarding dispatch to a failing agent.
//!
//! ```text
//!  closed ──N consecutive failures──▶ open ──cool-down elapsed──▶ half-open
//!    ▲                                  ▲                            │
//!    └────────── trial succeeds ────────┼──────── trial fails ───────┘
//! ```
//!
//! Dispatch asks [`CircuitBreakers::try_acquire`] for a [`CircuitPermit`] and
//! reports the outcome through it. Half-open admits a single trial call; a permit
//! dropped without an outcome frees the trial slot and leaves counters alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial.
    pub cooldown: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Promote open → half-open once the cool-down has passed.
    fn refresh(&mut self, cooldown: Duration, now: Instant) {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if now.duration_since(opened) >= cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Observable state of one tenant's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

struct Inner {
    settings: CircuitSettings,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Breakers for all tenants. Cheap to clone.
#[derive(Clone)]
pub struct CircuitBreakers {
    inner: Arc<Inner>,
}

impl CircuitBreakers {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                circuits: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ask to dispatch for `tenant_id`. `Err` carries how long until the
    /// breaker will admit a trial.
    pub fn try_acquire(&self, tenant_id: &str) -> Result<CircuitPermit, Duration> {
        let now = Instant::now();
        let cooldown = self.inner.settings.cooldown;
        let mut circuits = self.inner.lock();
        let circuit = circuits.entry(tenant_id.to_string()).or_insert_with(Circuit::new);
        circuit.refresh(cooldown, now);

        let trial = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = circuit.opened_at.map_or(Duration::ZERO, |t| now.duration_since(t));
                return Err(cooldown.saturating_sub(elapsed));
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    return Err(Duration::ZERO);
                }
                circuit.trial_in_flight = true;
                info!(tenant_id, "Circuit half-open, admitting trial call");
                true
            }
        };

        Ok(CircuitPermit {
            breakers: self.clone(),
            tenant_id: tenant_id.to_string(),
            trial,
            reported: false,
        })
    }

    fn record(&self, tenant_id: &str, trial: bool, success: bool) {
        let now = Instant::now();
        let threshold = self.inner.settings.failure_threshold;
        let mut circuits = self.inner.lock();
        let circuit = circuits.entry(tenant_id.to_string()).or_insert_with(Circuit::new);
        if trial {
            circuit.trial_in_flight = false;
        }

        if success {
            if circuit.state == CircuitState::Open {
                return;
            }
            if circuit.state == CircuitState::HalfOpen {
                info!(tenant_id, "Circuit closed");
            }
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.opened_at = None;
            return;
        }

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= threshold {
                    warn!(
                        tenant_id,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                    circuit.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                circuit.consecutive_failures += 1;
                warn!(tenant_id, "Trial call failed, circuit re-opened");
                circuit.trip(now);
            }
            // Late failures from calls dispatched before the trip leave the
            // cool-down where it is.
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self, tenant_id: &str) {
        if let Some(circuit) = self.inner.lock().get_mut(tenant_id) {
            circuit.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self, tenant_id: &str) -> CircuitSnapshot {
        let now = Instant::now();
        let cooldown = self.inner.settings.cooldown;
        let mut circuits = self.inner.lock();
        match circuits.get_mut(tenant_id) {
            Some(circuit) => {
                circuit.refresh(cooldown, now);
                CircuitSnapshot {
                    state: circuit.state,
                    consecutive_failures: circuit.consecutive_failures,
                }
            }
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            },
        }
    }

    pub fn state(&self, tenant_id: &str) -> CircuitState {
        self.snapshot(tenant_id).state
    }
}

/// Permission to dispatch one request. Report the outcome with
/// [`succeed`](Self::succeed) or [`fail`](Self::fail).
pub struct CircuitPermit {
    breakers: CircuitBreakers,
    tenant_id: String,
    trial: bool,
    reported: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.reported = true;
        self.breakers.record(&self.tenant_id, self.trial, true);
    }

    pub fn fail(mut self) {
        self.reported = true;
        self.breakers.record(&self.tenant_id, self.trial, false);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            self.breakers.release_trial(&self.tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitSettings {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
        })
    }

    fn fail_n(b: &CircuitBreakers, n: usize) {
        for _ in 0..n {
            b.try_acquire("t").unwrap().fail();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold() {
        let b = breakers();
        fail_n(&b, 2);
        assert_eq!(b.state("t"), CircuitState::Closed);
        fail_n(&b, 1);
        assert_eq!(b.state("t"), CircuitState::Open);
        let retry = b.try_acquire("t").err().unwrap();
        assert_eq!(retry, Duration::from_secs(10));
        // Other tenants are unaffected.
        assert!(b.try_acquire("other").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let b = breakers();
        fail_n(&b, 2);
        b.try_acquire("t").unwrap().succeed();
        fail_n(&b, 2);
        assert_eq!(b.state("t"), CircuitState::Closed);
        assert_eq!(b.snapshot("t").consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_while_open_do_not_extend_cooldown() {
        let b = breakers();
        // Three calls in flight before the trip.
        let late: Vec<_> = (0..3).map(|_| b.try_acquire("t").unwrap()).collect();
        fail_n(&b, 3);
        tokio::time::advance(Duration::from_secs(6)).await;
        for permit in late {
            permit.fail();
        }
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(b.state("t"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_call() {
        let b = breakers();
        fail_n(&b, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = b.try_acquire("t").unwrap();
        assert!(trial.is_trial());
        assert!(b.try_acquire("t").is_err());
        trial.succeed();
        assert_eq!(b.state("t"), CircuitState::Closed);
        assert!(b.try_acquire("t").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_cooldown() {
        let b = breakers();
        fail_n(&b, 3);
        tokio::time::advance(Duration::from_secs(10)).await;
        b.try_acquire("t").unwrap().fail();
        assert_eq!(b.state("t"), CircuitState::Open);
        assert_eq!(b.try_acquire("t").err(), Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let b = breakers();
        fail_n(&b, 3);
        tokio::time::advance(Duration::from_secs(10)).await;
        drop(b.try_acquire("t").unwrap());
        assert_eq!(b.state("t"), CircuitState::HalfOpen);
        assert!(b.try_acquire("t").unwrap().is_trial());
    }
}
