use std::time::Duration;

use crate::classify::RetryAction;
use crate::error::ErrorKind;

/// Engine tuning knobs. Defaults are sized for real hardware; simulated
/// transports want [`Tuning::immediate`].
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Reissues allowed for [`RetryAction::Retry`] conditions
    pub retry_limit: u32,
    /// Reissues allowed for [`RetryAction::ManyRetries`] conditions
    pub many_retry_limit: u32,
    /// Pause before reissuing after a busy-class condition
    pub busy_delay: Duration,
    /// Test-unit-ready polls allowed while waiting for a unit to come ready
    pub ready_poll_limit: u32,
    /// Initial pause between ready polls, doubled up to the maximum
    pub ready_poll_initial: Duration,
    pub ready_poll_max: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            many_retry_limit: 10,
            busy_delay: Duration::from_millis(100),
            ready_poll_limit: 10,
            ready_poll_initial: Duration::from_millis(100),
            ready_poll_max: Duration::from_secs(2),
        }
    }
}

impl Tuning {
    /// Default limits with all delays zeroed
    pub fn immediate() -> Self {
        Self {
            busy_delay: Duration::ZERO,
            ready_poll_initial: Duration::ZERO,
            ready_poll_max: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Attempt bookkeeping for one request. Freshly defaulted when a new
/// request begins; never shared between requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttemptCounters {
    pub retries: u32,
    pub many_retries: u32,
    pub start_attempted: bool,
}

/// Policy decision after one classified, unsuccessful attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Reissue the command after the given delay
    Continue(Duration),
    /// Issue a start-unit sequence, then reissue the command
    Escalate,
    /// Stop; report the given terminal kind
    GiveUp(ErrorKind),
}

/// Decides what to do about one failed attempt.
///
/// [`RetryAction::Ok`] never reaches this function; the executor
/// short-circuits on success.
pub fn next_step(action: RetryAction, counters: &mut AttemptCounters, tuning: &Tuning) -> Step {
    match action {
        RetryAction::Ok => {
            debug_assert!(false, "next_step on a successful attempt");
            Step::GiveUp(ErrorKind::InvalidRequest)
        }
        RetryAction::Retry => {
            counters.retries += 1;
            if counters.retries <= tuning.retry_limit {
                Step::Continue(Duration::ZERO)
            } else {
                Step::GiveUp(ErrorKind::Transient)
            }
        }
        RetryAction::ManyRetries => {
            counters.many_retries += 1;
            if counters.many_retries <= tuning.many_retry_limit {
                Step::Continue(tuning.busy_delay)
            } else {
                Step::GiveUp(ErrorKind::Persistent)
            }
        }
        RetryAction::NeedsStart => {
            if counters.start_attempted {
                // The start attempt did not help; the unit is not coming
                // up right now
                Step::GiveUp(ErrorKind::Transient)
            } else {
                counters.start_attempted = true;
                Step::Escalate
            }
        }
        RetryAction::InvalidRequest => Step::GiveUp(ErrorKind::ProtocolViolation),
        RetryAction::Fail => Step::GiveUp(ErrorKind::Persistent),
    }
}
