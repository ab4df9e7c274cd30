//! Deterministic fault injection for store simulations.

#[derive(Debug, Clone, PartialEq)]
pub struct FaultProfile {
    /// Fraction of reads that fail.
    pub read_failure_rate: f64,
    /// Fraction of writes that fail before reaching the table.
    pub write_failure_rate: f64,
    /// Fraction of writes that are applied but reported as failed
    /// (a lost acknowledgement).
    pub lost_ack_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self {
            read_failure_rate: 0.0,
            write_failure_rate: 0.0,
            lost_ack_rate: 0.0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.read_failure_rate <= 0.0 && self.write_failure_rate <= 0.0 && self.lost_ack_rate <= 0.0
    }
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Maps an operation sequence number onto `[0, 1)` and compares against
/// `rate`. The multiplier spreads consecutive sequence numbers.
pub fn should_fault(seq: u64, rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    let v = (seq.wrapping_mul(7919) % 10_000) as f64 / 10_000.0;
    v < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_never_faults() {
        assert!((0..1000).all(|s| !should_fault(s, 0.0)));
    }

    #[test]
    fn test_full_rate_always_faults() {
        assert!((0..1000).all(|s| should_fault(s, 1.0)));
    }

    #[test]
    fn test_rate_is_roughly_respected() {
        let hits = (0..10_000).filter(|s| should_fault(*s, 0.25)).count();
        assert!((2000..3000).contains(&hits), "hits={}", hits);
    }
}
