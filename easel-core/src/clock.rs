//! Lamport clock for per-object versioning.
//!
//! The clock is deliberately not thread-safe: a sync session owns exactly
//! one clock and touches it from a single task.

/// Process-local logical clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalClock {
    counter: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted counter value.
    pub fn starting_at(counter: u64) -> Self {
        Self { counter }
    }

    /// Advance and return the next version.
    pub fn tick(&mut self) -> u64 {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }

    /// Absorb a version seen elsewhere without advancing past it.
    pub fn observe(&mut self, external: u64) {
        self.counter = self.counter.max(external);
    }

    /// Advance to `max(counter + 1, timestamp_millis)`.
    ///
    /// Used to bootstrap from wall-clock time when no prior state exists,
    /// while staying strictly monotonic relative to the clock itself.
    pub fn tick_from_timestamp(&mut self, timestamp_millis: u64) -> u64 {
        self.counter = self.counter.saturating_add(1).max(timestamp_millis);
        self.counter
    }

    /// Current counter value (the last issued or observed version).
    pub fn current(&self) -> u64 {
        self.counter
    }
}
