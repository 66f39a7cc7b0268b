//! Retry decisions for dispatch nodes.
//!
//! # Responsibilities
//! - Decide whether a failed forward is retried under the node's strategy
//! - Bound attempts to `max_times + 1` forwards per request
//! - Report the pause before the next attempt
//!
//! # Design Decisions
//! - A failure is a transport error or a status >= 400
//! - Transport errors are matched against the strategy as status 500
//! - Client cancellation is never retried
//! - The caller reselects a server between attempts

use std::time::Duration;

use crate::model::RetryStrategy;

/// Outcome of one forward attempt, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Status(u16),
    Transport,
    Cancelled,
}

impl Attempt {
    pub fn is_failure(&self) -> bool {
        match self {
            Attempt::Status(code) => *code >= 400,
            Attempt::Transport | Attempt::Cancelled => true,
        }
    }

    /// Code reported to error filters.
    pub fn code(&self) -> u16 {
        match self {
            Attempt::Status(code) => *code,
            Attempt::Transport | Attempt::Cancelled => 500,
        }
    }
}

/// Pause before the next attempt, or `None` to stop. `sent` counts the
/// forwards already made for this node.
pub fn next_delay(strategy: Option<&RetryStrategy>, sent: u32, last: Attempt) -> Option<Duration> {
    let strategy = strategy?;
    if !last.is_failure() || last == Attempt::Cancelled {
        return None;
    }
    if sent > strategy.max_times {
        return None;
    }
    if !strategy.matches_code(last.code()) {
        return None;
    }
    Some(Duration::from_millis(strategy.interval_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(max_times: u32, codes: Vec<u16>) -> RetryStrategy {
        RetryStrategy {
            max_times,
            interval_ms: 5,
            codes,
        }
    }

    #[test]
    fn test_attempts_bounded() {
        let s = strategy(2, vec![]);
        let sent = (1..)
            .take_while(|&sent| next_delay(Some(&s), sent, Attempt::Status(503)).is_some())
            .count() as u32
            + 1;
        assert_eq!(sent, 3);
    }

    #[test]
    fn test_codes_filter() {
        let s = strategy(3, vec![502, 503]);
        assert!(next_delay(Some(&s), 1, Attempt::Status(503)).is_some());
        assert!(next_delay(Some(&s), 1, Attempt::Status(404)).is_none());
        assert!(next_delay(Some(&s), 1, Attempt::Transport).is_none());

        let all = strategy(3, vec![]);
        assert!(next_delay(Some(&all), 1, Attempt::Transport).is_some());
    }

    #[test]
    fn test_no_retry_cases() {
        let s = strategy(3, vec![]);
        assert!(next_delay(None, 1, Attempt::Status(500)).is_none());
        assert!(next_delay(Some(&s), 1, Attempt::Status(200)).is_none());
        assert!(next_delay(Some(&s), 1, Attempt::Cancelled).is_none());
        assert_eq!(
            next_delay(Some(&s), 1, Attempt::Status(500)),
            Some(Duration::from_millis(5))
        );
    }
}
