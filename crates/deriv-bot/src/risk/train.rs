//! Momentum-train detection.
//!
//! A train is two consecutive ticks each rising by more than the
//! threshold, the burst pattern that stops out scalping shorts. The
//! detector keeps the last five tick prices and evaluates the two most
//! recent deltas on every arrival.

use std::collections::VecDeque;

use rust_decimal::Decimal;

/// Rolling tick window length.
pub const TRAIN_WINDOW: usize = 5;

/// Detects two consecutive upward deltas above the threshold.
#[derive(Debug)]
pub struct TrainDetector {
    threshold: Decimal,
    window: VecDeque<Decimal>,
}

impl TrainDetector {
    pub fn new(threshold: Decimal) -> Self {
        Self {
            threshold,
            window: VecDeque::with_capacity(TRAIN_WINDOW),
        }
    }

    /// Feed one tick price. Returns true when the two most recent deltas
    /// both exceed the threshold.
    pub fn observe(&mut self, price: Decimal) -> bool {
        self.window.push_back(price);
        while self.window.len() > TRAIN_WINDOW {
            self.window.pop_front();
        }

        let n = self.window.len();
        if n < 3 {
            return false;
        }
        let latest = self.window[n - 1] - self.window[n - 2];
        let previous = self.window[n - 2] - self.window[n - 3];
        latest > self.threshold && previous > self.threshold
    }

    /// Drop the window, e.g. after a reconnect gap.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn feed(detector: &mut TrainDetector, prices: &[Decimal]) -> bool {
        let mut last = false;
        for p in prices {
            last = detector.observe(*p);
        }
        last
    }

    #[test]
    fn test_stalled_tail_does_not_trigger() {
        let mut detector = TrainDetector::new(dec!(4.0));
        // Deltas (0, +4.1, +4.1, 0); the two most recent are (+4.1, 0).
        let triggered = feed(
            &mut detector,
            &[dec!(100), dec!(100), dec!(104.1), dec!(108.2), dec!(108.2)],
        );
        assert!(!triggered);
    }

    #[test]
    fn test_two_consecutive_jumps_trigger() {
        let mut detector = TrainDetector::new(dec!(4.0));
        // Deltas (+4.1, +4.2, +4.2).
        let triggered = feed(
            &mut detector,
            &[dec!(100), dec!(104.1), dec!(108.3), dec!(112.5)],
        );
        assert!(triggered);
    }

    #[test]
    fn test_exact_threshold_is_not_enough() {
        let mut detector = TrainDetector::new(dec!(4.0));
        let triggered = feed(&mut detector, &[dec!(100), dec!(104.0), dec!(108.0)]);
        assert!(!triggered);
    }

    #[test]
    fn test_downward_moves_never_trigger() {
        let mut detector = TrainDetector::new(dec!(4.0));
        let triggered = feed(&mut detector, &[dec!(100), dec!(95), dec!(90), dec!(85)]);
        assert!(!triggered);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut detector = TrainDetector::new(dec!(4.0));
        detector.observe(dec!(100));
        detector.observe(dec!(104.5));
        detector.reset();
        // Only one delta after the reset.
        assert!(!detector.observe(dec!(109.0)));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut detector = TrainDetector::new(dec!(4.0));
        for i in 0..100 {
            detector.observe(Decimal::from(i));
        }
        assert!(detector.window.len() <= TRAIN_WINDOW);
    }
}
