/// Billing model for CPU time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BillingMode {
    /// A fixed credit is consumed; the run stops once it is spent.
    Prepaid { credit_secs: f64 },
    /// A configured limit is the stop condition.
    Postpaid { limit_secs: f64 },
}

/// CPU budget under either billing model.
///
/// One rule decides both when the enforcer kills a running cycle and when
/// the loop controller may start another one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    mode: BillingMode,
}

impl Budget {
    pub fn new(mode: BillingMode) -> Self {
        Self { mode }
    }

    pub fn prepaid(credit_secs: f64) -> Self {
        Self::new(BillingMode::Prepaid { credit_secs })
    }

    pub fn postpaid(limit_secs: f64) -> Self {
        Self::new(BillingMode::Postpaid { limit_secs })
    }

    pub fn mode(&self) -> BillingMode {
        self.mode
    }

    /// CPU seconds at which the budget counts as spent.
    pub fn ceiling(&self) -> f64 {
        match self.mode {
            BillingMode::Prepaid { credit_secs } => credit_secs,
            BillingMode::Postpaid { limit_secs } => limit_secs,
        }
    }

    /// True once `used` reaches the ceiling (reaching it exactly counts).
    pub fn quota_exceeded(&self, used: f64) -> bool {
        used >= self.ceiling()
    }

    /// Whether another cycle may begin after `used` seconds were charged.
    pub fn should_continue(&self, used: f64) -> bool {
        !self.quota_exceeded(used)
    }

    /// Seconds left before the ceiling, never negative.
    pub fn remaining(&self, used: f64) -> f64 {
        (self.ceiling() - used).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: [f64; 5] = [0.0, 0.5, 1.0, 10.0, 3600.0];

    #[test]
    fn test_prepaid_boundary() {
        for credit in LIMITS {
            let budget = Budget::prepaid(credit);
            assert!(budget.quota_exceeded(credit), "used == credit {credit}");
            assert!(budget.quota_exceeded(credit + 0.01));
            if credit > 0.0 {
                assert!(!budget.quota_exceeded(credit - 1e-9), "credit {credit}");
            }
        }
    }

    #[test]
    fn test_postpaid_boundary() {
        for limit in LIMITS {
            let budget = Budget::postpaid(limit);
            assert!(budget.quota_exceeded(limit), "used == limit {limit}");
            if limit > 0.0 {
                assert!(!budget.quota_exceeded(limit - 1e-9), "limit {limit}");
            }
        }
    }

    #[test]
    fn test_should_continue_is_negation() {
        let budget = Budget::postpaid(2.0);
        for used in [0.0, 1.0, 1.999, 2.0, 2.5] {
            assert_eq!(budget.should_continue(used), !budget.quota_exceeded(used));
        }
    }

    #[test]
    fn test_modes_use_their_own_ceiling() {
        assert_eq!(Budget::prepaid(5.0).ceiling(), 5.0);
        assert_eq!(Budget::postpaid(10.0).ceiling(), 10.0);
        assert!(!Budget::postpaid(10.0).quota_exceeded(5.0));
        assert!(Budget::prepaid(5.0).quota_exceeded(5.0));
    }

    #[test]
    fn test_remaining_saturates() {
        let budget = Budget::prepaid(3.0);
        assert_eq!(budget.remaining(1.0), 2.0);
        assert_eq!(budget.remaining(5.0), 0.0);
    }
}
