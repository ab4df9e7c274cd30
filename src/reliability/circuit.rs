//! Reachability breaker for the remote store.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store answering.
    Closed,
    /// Enough consecutive failures to call the store offline.
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns `true` when this success closed an open breaker.
    pub fn record_success(&mut self) -> bool {
        let reopened = self.state == CircuitState::Open;
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        reopened
    }

    /// Returns `true` when this failure tripped the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::Closed && self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            return true;
        }
        false
    }

    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_opens_on_threshold() {
        let mut cb = CircuitBreaker::new(3);
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(cb.is_closed());
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.record_failure());
    }

    #[test]
    fn test_circuit_closes_on_success() {
        let mut cb = CircuitBreaker::new(1);
        cb.record_failure();
        assert!(!cb.is_closed());
        assert!(cb.record_success());
        assert!(cb.is_closed());
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(!cb.record_success());
    }
}
