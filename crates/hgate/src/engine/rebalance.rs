// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker load tracking and rebalance planning.
//!
//! Each worker reports a load percentage (time not spent waiting in its
//! poll call). The main worker samples those into rolling averages and,
//! when the spread between the hottest and coldest worker exceeds the
//! configured threshold, asks the hottest worker to move sessions to the
//! coldest. The move itself always runs on the source worker's own loop.

use std::collections::VecDeque;

/// Rolling average over the last N samples.
#[derive(Debug)]
pub struct AverageN {
    samples: VecDeque<u32>,
    capacity: usize,
}

impl AverageN {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn add_value(&mut self, value: u32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn value(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().map(|&v| u64::from(v)).sum();
        (sum / self.samples.len() as u64) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A planned session move between two workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalancePlan {
    pub from: usize,
    pub to: usize,
    /// How many sessions to move.
    pub n_sessions: usize,
}

/// Pick the hottest and coldest workers; plan a move when the spread
/// exceeds `threshold` percentage points.
pub fn plan_rebalance(loads: &[(usize, u32)], threshold: u32) -> Option<RebalancePlan> {
    if threshold == 0 || loads.len() < 2 {
        return None;
    }

    let mut min = loads[0];
    let mut max = loads[0];
    for &(index, load) in &loads[1..] {
        if load < min.1 {
            min = (index, load);
        }
        if load > max.1 {
            max = (index, load);
        }
    }
    if min.0 == max.0 {
        return None;
    }

    let diff = max.1.saturating_sub(min.1);
    if diff > threshold {
        log::info!(
            "[REBALANCE] load difference ({diff}) between worker {} ({}) and worker {} ({}) \
             exceeds the threshold ({threshold}); moving work",
            max.0,
            max.1,
            min.0,
            min.1
        );
        Some(RebalancePlan {
            from: max.0,
            to: min.0,
            n_sessions: 1,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_rolls() {
        let mut avg = AverageN::new(3);
        assert_eq!(avg.value(), 0);
        avg.add_value(30);
        avg.add_value(60);
        assert_eq!(avg.value(), 45);

        avg.add_value(90);
        avg.add_value(90); // evicts 30
        assert_eq!(avg.value(), 80);
    }

    #[test]
    fn test_plan_requires_spread() {
        let loads = [(0, 50), (1, 55), (2, 52)];
        assert_eq!(plan_rebalance(&loads, 20), None);

        let loads = [(0, 90), (1, 10), (2, 52)];
        let plan = plan_rebalance(&loads, 20).unwrap();
        assert_eq!(plan.from, 0);
        assert_eq!(plan.to, 1);
    }

    #[test]
    fn test_plan_disabled_by_zero_threshold() {
        let loads = [(0, 100), (1, 0)];
        assert_eq!(plan_rebalance(&loads, 0), None);
    }

    #[test]
    fn test_plan_single_worker() {
        assert_eq!(plan_rebalance(&[(0, 80)], 10), None);
    }
}
