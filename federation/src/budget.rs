//! Keeps a run inside the execution allowance of its host.
//!
//! The host may kill the process at its deadline without any cleanup. Loops
//! consult a `TimeBudgetGuard` before starting another iteration and stop
//! while there is still room for the slowest iteration seen so far, so the
//! last checkpoint write always completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// How much execution time the host still grants this process.
pub trait ExecutionAllowance: Send + Sync {
    fn remaining(&self) -> Duration;
}

/// For hosts without a hard deadline.
pub struct Unbounded;

impl ExecutionAllowance for Unbounded {
    fn remaining(&self) -> Duration {
        Duration::MAX
    }
}

/// A fixed deadline measured from process start.
pub struct Deadline {
    deadline: Instant,
}

impl Deadline {
    /// The deadline is brought forward by `safety_margin` so that shutdown
    /// work after the last iteration fits as well.
    pub fn after(budget: Duration, safety_margin: Duration) -> Self {
        Deadline {
            deadline: Instant::now() + budget.saturating_sub(safety_margin),
        }
    }
}

impl ExecutionAllowance for Deadline {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

pub struct TimeBudgetGuard {
    allowance: Arc<dyn ExecutionAllowance>,
    max_iteration: Duration,
}

impl TimeBudgetGuard {
    pub fn new(allowance: Arc<dyn ExecutionAllowance>) -> Self {
        TimeBudgetGuard {
            allowance,
            max_iteration: Duration::ZERO,
        }
    }

    pub fn record_iteration(&mut self, elapsed: Duration) {
        self.max_iteration = self.max_iteration.max(elapsed);
    }

    /// The slowest iteration observed so far in this run.
    pub fn estimated_iteration_cost(&self) -> Duration {
        self.max_iteration
    }

    pub fn should_continue(&self) -> bool {
        self.max_iteration < self.allowance.remaining()
    }
}
