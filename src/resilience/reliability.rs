use std::collections::VecDeque;

/// Sliding window of recent outcomes for one source/adapter.
#[derive(Debug, Clone)]
pub struct ReliabilityTracker {
    window_size: usize,
    outcomes: VecDeque<bool>,
}

impl ReliabilityTracker {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        ReliabilityTracker {
            window_size,
            outcomes: VecDeque::with_capacity(window_size),
        }
    }

    pub fn record_success(&mut self) {
        self.push(true);
    }

    pub fn record_failure(&mut self) {
        self.push(false);
    }

    /// Percentage of successes in the window; 100 while nothing is recorded.
    pub fn get_score(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 100.0;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        100.0 * successes as f64 / self.outcomes.len() as f64
    }

    fn push(&mut self, outcome: bool) {
        if self.outcomes.len() == self.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_window_scores_100() {
        let tracker = ReliabilityTracker::new(10);
        assert_relative_eq!(tracker.get_score(), 100.0);
    }

    #[test]
    fn test_half_and_half_then_all_failures() {
        let mut tracker = ReliabilityTracker::new(10);
        for _ in 0..5 {
            tracker.record_success();
        }
        for _ in 0..5 {
            tracker.record_failure();
        }
        assert_relative_eq!(tracker.get_score(), 50.0);

        for _ in 0..10 {
            tracker.record_failure();
        }
        assert_relative_eq!(tracker.get_score(), 0.0);
    }

    #[test]
    fn test_oldest_outcome_is_evicted() {
        let mut tracker = ReliabilityTracker::new(2);
        tracker.record_failure();
        tracker.record_success();
        tracker.record_success();
        assert_relative_eq!(tracker.get_score(), 100.0);
    }
}
