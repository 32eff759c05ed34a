//! Per-request deadlines and the silent-retry policy.
//!
//! Every exchange except replication is raced against a fixed deadline.
//! When the deadline wins, the exchange is dropped and the same descriptor
//! is submitted again with a fresh deadline; the caller never sees the
//! timeout. There is no retry limit and no backoff growth.
//!
//! Blind retry is only safe because every covered operation is idempotent
//! by id (GET/HEAD, PUT and DELETE with an explicit revision, PUT of a named
//! database). `start_session` is a POST but creates no server state beyond
//! a fresh cookie. Any new non-idempotent operation must opt out through
//! [`Supervisor::arms`].

use std::time::Duration;

use tokio::time::Instant;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::operation::Operation;

/// Lifecycle of one armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Deadline ticking, exchange outstanding.
    Armed,
    /// Exchange completed first; nothing further to do.
    Fired,
    /// Deadline reached first; the descriptor must be resubmitted.
    Expired,
}

impl SupervisorState {
    /// The exchange completed. Only meaningful while armed.
    pub fn on_completed(self) -> Self {
        match self {
            SupervisorState::Armed => SupervisorState::Fired,
            other => other,
        }
    }

    /// The deadline elapsed. Only meaningful while armed.
    pub fn on_deadline(self) -> Self {
        match self {
            SupervisorState::Armed => SupervisorState::Expired,
            other => other,
        }
    }

    pub fn needs_resubmission(self) -> bool {
        self == SupervisorState::Expired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervisor {
    timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Supervisor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `operation` is put under a deadline at all.
    pub fn arms(&self, operation: Operation) -> bool {
        !operation.is_replication()
    }

    /// Deadline for an exchange of `operation` started at `now`.
    pub fn arm(&self, operation: Operation, now: Instant) -> Option<Instant> {
        self.arms(operation).then(|| now + self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicate_is_never_armed() {
        let supervisor = Supervisor::default();
        assert_eq!(supervisor.arm(Operation::Replicate, Instant::now()), None);
    }

    #[test]
    fn every_other_operation_gets_the_fixed_timeout() {
        let supervisor = Supervisor::new(Duration::from_secs(20));
        let now = Instant::now();
        for op in Operation::ALL.into_iter().filter(|op| !op.is_replication()) {
            assert_eq!(supervisor.arm(op, now), Some(now + Duration::from_secs(20)), "{op}");
        }
    }

    #[test]
    fn first_event_wins() {
        let fired = SupervisorState::Armed.on_completed();
        assert_eq!(fired, SupervisorState::Fired);
        assert_eq!(fired.on_deadline(), SupervisorState::Fired);
        assert!(!fired.needs_resubmission());

        let expired = SupervisorState::Armed.on_deadline();
        assert_eq!(expired, SupervisorState::Expired);
        assert_eq!(expired.on_completed(), SupervisorState::Expired);
        assert!(expired.needs_resubmission());
    }
}
