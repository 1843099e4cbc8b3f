//! Fixed-capacity ring of recent call outcomes

/// Circular buffer of success/failure outcomes
///
/// Until the buffer has wrapped once, the failure rate is computed over the
/// filled slots only, so a cold breaker reacts to its first few calls.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    outcomes: Vec<bool>,
    index: usize,
    filled: usize,
}

impl SlidingWindow {
    /// Create a window holding `capacity` outcomes (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            outcomes: vec![true; capacity.max(1)],
            index: 0,
            filled: 0,
        }
    }

    /// Record one outcome, overwriting the oldest once full
    pub fn record(&mut self, success: bool) {
        let capacity = self.outcomes.len();
        self.outcomes[self.index] = success;
        self.index = (self.index + 1) % capacity;
        if self.filled < capacity {
            self.filled += 1;
        }
    }

    /// Percentage of failures among filled slots, 0.0 when empty
    pub fn failure_rate(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let failures = self.outcomes[..self.filled].iter().filter(|ok| !**ok).count();
        failures as f64 / self.filled as f64 * 100.0
    }

    /// Number of slots holding an outcome
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Maximum number of outcomes kept
    pub fn capacity(&self) -> usize {
        self.outcomes.len()
    }

    /// Forget every recorded outcome
    pub fn reset(&mut self) {
        self.index = 0;
        self.filled = 0;
    }
}
