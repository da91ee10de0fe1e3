//! Dispatch and time budgets for bounded loops.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("deadline exceeded"));
    }
    Ok(remaining)
}

/// Counts real capability dispatches against a soft and a hard ceiling.
///
/// `used` only grows and never passes `hard`. The soft ceiling fires once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchBudget {
    used: u32,
    soft: u32,
    hard: u32,
    soft_fired: bool,
}

impl DispatchBudget {
    pub fn new(soft: u32, hard: u32) -> Self {
        Self {
            used: 0,
            soft: soft.min(hard),
            hard,
            soft_fired: false,
        }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.hard
    }

    pub fn remaining(&self) -> u32 {
        self.hard - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.hard
    }

    /// Reserve one dispatch. Returns `false` once the hard ceiling is reached.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    /// `true` exactly once, the first time usage reaches the soft ceiling.
    pub fn take_soft_warning(&mut self) -> bool {
        if self.soft_fired || self.used < self.soft {
            return false;
        }
        self.soft_fired = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_stops_at_hard_ceiling() {
        let mut budget = DispatchBudget::new(2, 3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 3);
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn soft_warning_fires_once() {
        let mut budget = DispatchBudget::new(1, 5);
        assert!(!budget.take_soft_warning());
        budget.try_consume();
        assert!(budget.take_soft_warning());
        budget.try_consume();
        assert!(!budget.take_soft_warning());
    }

    #[test]
    fn soft_is_clamped_to_hard() {
        let mut budget = DispatchBudget::new(10, 1);
        budget.try_consume();
        assert!(budget.take_soft_warning());
    }

    #[test]
    fn remaining_budget_errors_after_deadline() {
        let past = Instant::now()
            .checked_sub(Duration::from_millis(5))
            .unwrap_or_else(Instant::now);
        assert!(remaining_budget(past).is_err());
        assert!(remaining_budget(Instant::now() + Duration::from_secs(60)).is_ok());
    }
}
