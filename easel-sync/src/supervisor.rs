//! Connection lifecycle with capped exponential backoff.
//!
//! ```text
//!             start_attempt            on_connected
//! Disconnected ───────────► Connecting ───────────► Connected
//!      ▲                        │                       │
//!      │      on_lost (retry at now + delay)            │
//!      └────────────────────────┴───────────────────────┘
//!                    on_closed (no retry)
//! ```
//!
//! The supervisor only decides; the session owns the timer and the
//! channel. Time is passed in, so every transition is deterministic.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the session must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Flush the queue, then reconcile against the row store.
    Resync,
    /// Try again at the given instant.
    RetryAt(Instant),
    None,
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: LinkState,
    attempt: u32,
    base: Duration,
    max: Duration,
    next_retry: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            attempt: 0,
            base,
            max: max.max(base),
            next_retry: None,
        }
    }

    /// Delay for the given attempt number: `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn start_attempt(&mut self) {
        self.state = LinkState::Connecting;
        self.next_retry = None;
    }

    pub fn on_connected(&mut self) -> SupervisorAction {
        if self.attempt > 0 {
            log::info!("Reconnected after {} attempts", self.attempt);
        }
        self.state = LinkState::Connected;
        self.attempt = 0;
        self.next_retry = None;
        SupervisorAction::Resync
    }

    /// Error or timeout: schedule a retry and bump the attempt counter.
    pub fn on_lost(&mut self, now: Instant) -> SupervisorAction {
        let delay = self.backoff_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.state = LinkState::Disconnected;
        let at = now + delay;
        self.next_retry = Some(at);
        log::debug!("Connection lost; retry {} in {delay:?}", self.attempt);
        SupervisorAction::RetryAt(at)
    }

    /// Orderly close: stay disconnected, nothing scheduled.
    pub fn on_closed(&mut self) -> SupervisorAction {
        self.state = LinkState::Disconnected;
        self.next_retry = None;
        SupervisorAction::None
    }

    /// Whether a scheduled retry has come due.
    pub fn due(&self, now: Instant) -> bool {
        self.state == LinkState::Disconnected && self.next_retry.is_some_and(|at| at <= now)
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let mut sup = supervisor();
        let now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..7 {
            sup.start_attempt();
            match sup.on_lost(now) {
                SupervisorAction::RetryAt(at) => delays.push((at - now).as_secs()),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(sup.attempt(), 7);
    }

    #[test]
    fn test_connected_resets_and_cancels() {
        let mut sup = supervisor();
        let now = Instant::now();
        sup.on_lost(now);
        sup.on_lost(now);
        assert!(sup.next_retry().is_some());

        assert_eq!(sup.on_connected(), SupervisorAction::Resync);
        assert_eq!(sup.attempt(), 0);
        assert!(sup.next_retry().is_none());
        assert!(!sup.due(now + Duration::from_secs(60)));
        assert!(sup.is_connected());

        // Next loss starts from the base delay again.
        assert_eq!(sup.on_lost(now), SupervisorAction::RetryAt(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_closed_schedules_nothing() {
        let mut sup = supervisor();
        sup.on_connected();
        assert_eq!(sup.on_closed(), SupervisorAction::None);
        assert_eq!(sup.state(), LinkState::Disconnected);
        assert!(sup.next_retry().is_none());
    }

    #[test]
    fn test_due_only_after_deadline() {
        let mut sup = supervisor();
        let now = Instant::now();
        sup.on_lost(now);
        assert!(!sup.due(now + Duration::from_millis(999)));
        assert!(sup.due(now + Duration::from_secs(1)));

        sup.start_attempt();
        assert!(!sup.due(now + Duration::from_secs(5)));
        assert_eq!(sup.state(), LinkState::Connecting);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let sup = supervisor();
        assert_eq!(sup.backoff_delay(64), Duration::from_secs(30));
        assert_eq!(sup.backoff_delay(0), Duration::from_secs(1));
    }
}
