// Reconnect policy for the real-time channel.

use std::time::Duration;

/// Why the real-time connection dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection on purpose (normal or policy close).
    /// The client must not reconnect.
    ServerInitiated,
    /// The connection was lost for any other reason.
    TransportLost(String),
}

impl DisconnectReason {
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::ServerInitiated)
    }
}

/// Bounded backoff: attempts are capped and the delay grows linearly with
/// the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Server-initiated disconnect: stay down.
    Stop,
    /// The attempt cap is exhausted.
    GiveUp { attempts: u32 },
}

/// Process-wide connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub reconnect_attempt: u32,
}

impl ConnectionState {
    pub fn on_connected(&mut self) {
        self.connected = true;
        self.reconnect_attempt = 0;
    }

    pub fn on_disconnected(&mut self, reason: &DisconnectReason, policy: &ReconnectPolicy) -> ReconnectDecision {
        self.connected = false;
        if !reason.should_reconnect() {
            return ReconnectDecision::Stop;
        }
        self.next_attempt(policy)
    }

    pub fn on_connect_error(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        self.connected = false;
        self.next_attempt(policy)
    }

    fn next_attempt(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.reconnect_attempt >= policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.reconnect_attempt,
            };
        }
        self.reconnect_attempt += 1;
        ReconnectDecision::Retry {
            attempt: self.reconnect_attempt,
            delay: policy.delay_for(self.reconnect_attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_initiated_disconnect_does_not_reconnect() {
        let mut state = ConnectionState::default();
        state.on_connected();
        let decision = state.on_disconnected(&DisconnectReason::ServerInitiated, &ReconnectPolicy::default());
        assert_eq!(decision, ReconnectDecision::Stop);
        assert!(!state.connected);
        assert_eq!(state.reconnect_attempt, 0);
    }

    #[test]
    fn lost_transport_schedules_first_attempt() {
        let mut state = ConnectionState::default();
        state.on_connected();
        let decision = state.on_disconnected(
            &DisconnectReason::TransportLost("reset".into()),
            &ReconnectPolicy::default(),
        );
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn delays_scale_with_attempt_and_cap_at_five() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::default();
        let mut delays = Vec::new();
        loop {
            match state.on_connect_error(&policy) {
                ReconnectDecision::Retry { delay, .. } => delays.push(delay.as_secs()),
                ReconnectDecision::GiveUp { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
                ReconnectDecision::Stop => panic!("connect errors always retry"),
            }
        }
        assert_eq!(delays, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn successful_connect_resets_attempts() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::default();
        state.on_connect_error(&policy);
        state.on_connect_error(&policy);
        state.on_connected();
        assert_eq!(state.reconnect_attempt, 0);
        assert!(matches!(
            state.on_connect_error(&policy),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }
}
