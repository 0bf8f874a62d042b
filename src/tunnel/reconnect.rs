//! Agent connection state machine and reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Where the agent's tunnel connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Registering,
    Connected,
    Reconnecting,
    Shutdown,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Shutdown => "shutdown",
        }
    }

    /// Apply `transition`. `None` means the transition is not valid from
    /// this state.
    pub fn next(self, transition: Transition) -> Option<ClientState> {
        use ClientState::{Connected, Connecting, Disconnected, Reconnecting, Registering, Shutdown};
        use Transition::{
            BackoffElapsed, ConnectionLost, RegistrationAcked, RegistrationRejected, RetriesExhausted, Start,
            Stop, TransportConnected,
        };
        match (self, transition) {
            (Shutdown, _) => None,
            (_, Stop) => Some(Shutdown),
            (Disconnected, Start) => Some(Connecting),
            (Connecting, TransportConnected) => Some(Registering),
            (Connecting | Registering | Connected, ConnectionLost) => Some(Reconnecting),
            (Registering, RegistrationAcked) => Some(Connected),
            (Registering, RegistrationRejected) | (Reconnecting, RetriesExhausted) => Some(Disconnected),
            (Reconnecting, BackoffElapsed) => Some(Connecting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    TransportConnected,
    RegistrationAcked,
    RegistrationRejected,
    /// Dial failure, transport error, pong timeout, or broker close.
    ConnectionLost,
    BackoffElapsed,
    RetriesExhausted,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// Exponential backoff with equal jitter: each delay is half the capped
/// exponential value plus a uniform random share of the other half.
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the delay for `attempt` (0-based), before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.settings.initial.saturating_mul(factor).min(self.settings.max)
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.settings.max_attempts {
            return None;
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt += 1;
        let half = ceiling / 2;
        #[allow(clippy::cast_possible_truncation)]
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        Some(half + Duration::from_millis(jitter).min(ceiling - half))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientState::*;
    use Transition::*;

    #[test]
    fn happy_path() {
        let mut s = Disconnected;
        for (t, expected) in [
            (Start, Connecting),
            (TransportConnected, Registering),
            (RegistrationAcked, Connected),
            (ConnectionLost, Reconnecting),
            (BackoffElapsed, Connecting),
        ] {
            s = s.next(t).unwrap();
            assert_eq!(s, expected);
        }
    }

    #[test]
    fn rejection_parks_in_disconnected() {
        assert_eq!(Registering.next(RegistrationRejected), Some(Disconnected));
        assert_eq!(Reconnecting.next(RetriesExhausted), Some(Disconnected));
        assert_eq!(Disconnected.next(BackoffElapsed), None);
    }

    #[test]
    fn stop_wins_from_everywhere_and_is_terminal() {
        for s in [Disconnected, Connecting, Registering, Connected, Reconnecting] {
            assert_eq!(s.next(Stop), Some(Shutdown));
        }
        assert_eq!(Shutdown.next(Start), None);
        assert_eq!(Shutdown.next(Stop), None);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        assert_eq!(Connected.next(RegistrationAcked), None);
        assert_eq!(Disconnected.next(ConnectionLost), None);
        assert_eq!(Connecting.next(RegistrationAcked), None);
    }

    #[test]
    fn backoff_grows_caps_and_exhausts() {
        let mut b = Backoff::new(BackoffSettings {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_attempts: 6,
        });
        let ceilings = [100, 200, 400, 800, 1000, 1000];
        for ceiling in ceilings {
            let d = b.next_delay().unwrap();
            let ceiling = Duration::from_millis(ceiling);
            assert!(d >= ceiling / 2 && d <= ceiling, "{d:?} outside [{:?}, {ceiling:?}]", ceiling / 2);
        }
        assert_eq!(b.next_delay(), None);
        b.reset();
        assert!(b.next_delay().unwrap() <= Duration::from_millis(100));
    }

    #[test]
    fn zero_max_attempts_gives_up_immediately() {
        let mut b = Backoff::new(BackoffSettings {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            max_attempts: 0,
        });
        assert_eq!(b.next_delay(), None);
    }
}
