//! Bollinger-squeeze breakout detection (alternate strategy variant).
//!
//! Bands are mean ± 2σ over the rolling tick buffer. When the bandwidth
//! `(upper − lower) / mean` compresses below the threshold the detector
//! arms; the first close outside a band afterwards is the breakout entry.
//! Each arm fires at most once.

use deriv_common::ContractType;
use rust_decimal::{Decimal, MathematicalOps};

/// A breakout from an armed squeeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakout {
    pub direction: ContractType,
}

/// Bollinger bands computed over a price window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub mean: Decimal,
    pub upper: Decimal,
    pub lower: Decimal,
    pub bandwidth: Decimal,
}

/// Arms on band compression, fires on the first breakout.
#[derive(Debug)]
pub struct SqueezeDetector {
    /// Minimum window before bands are meaningful.
    min_window: usize,
    /// Bandwidth threshold that arms the detector.
    threshold: Decimal,
    armed: bool,
}

impl SqueezeDetector {
    pub fn new(min_window: usize, threshold: Decimal) -> Self {
        Self {
            min_window,
            threshold,
            armed: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Evaluate the window after a new tick. `prices` is the rolling tick
    /// buffer, oldest first; the last element is the tick that just
    /// arrived.
    pub fn evaluate(&mut self, prices: &[Decimal]) -> Option<Breakout> {
        if prices.len() < self.min_window {
            return None;
        }
        let bands = compute_bands(prices)?;
        let last = *prices.last()?;

        if self.armed {
            if last > bands.upper {
                self.armed = false;
                return Some(Breakout {
                    direction: ContractType::MultUp,
                });
            }
            if last < bands.lower {
                self.armed = false;
                return Some(Breakout {
                    direction: ContractType::MultDown,
                });
            }
        }

        if bands.bandwidth < self.threshold {
            self.armed = true;
        }
        None
    }
}

/// Mean ± 2σ bands; `None` for a degenerate window (non-positive mean).
pub fn compute_bands(prices: &[Decimal]) -> Option<Bands> {
    if prices.is_empty() {
        return None;
    }
    let n = Decimal::from(prices.len() as u64);
    let mean = prices.iter().copied().sum::<Decimal>() / n;
    if mean <= Decimal::ZERO {
        return None;
    }

    let variance = prices
        .iter()
        .map(|p| {
            let d = *p - mean;
            d * d
        })
        .sum::<Decimal>()
        / n;
    let sd = variance.sqrt()?;

    let two_sd = Decimal::TWO * sd;
    let upper = mean + two_sd;
    let lower = mean - two_sd;
    Some(Bands {
        mean,
        upper,
        lower,
        bandwidth: (upper - lower) / mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat(n: usize, price: Decimal) -> Vec<Decimal> {
        vec![price; n]
    }

    #[test]
    fn test_flat_window_has_zero_bandwidth() {
        let bands = compute_bands(&flat(20, dec!(100))).unwrap();
        assert_eq!(bands.bandwidth, Decimal::ZERO);
        assert_eq!(bands.upper, dec!(100));
        assert_eq!(bands.lower, dec!(100));
    }

    #[test]
    fn test_arms_on_compression_then_fires_upward() {
        let mut detector = SqueezeDetector::new(10, dec!(0.001));

        let mut window = flat(20, dec!(100));
        assert!(detector.evaluate(&window).is_none());
        assert!(detector.is_armed());

        // Breakout above the (tight) upper band.
        window.remove(0);
        window.push(dec!(105));
        let breakout = detector.evaluate(&window).unwrap();
        assert_eq!(breakout.direction, ContractType::MultUp);
        assert!(!detector.is_armed());
    }

    #[test]
    fn test_downward_breakout_is_short() {
        let mut detector = SqueezeDetector::new(10, dec!(0.001));
        let mut window = flat(20, dec!(100));
        detector.evaluate(&window);

        window.remove(0);
        window.push(dec!(95));
        let breakout = detector.evaluate(&window).unwrap();
        assert_eq!(breakout.direction, ContractType::MultDown);
    }

    #[test]
    fn test_fires_once_per_arm() {
        let mut detector = SqueezeDetector::new(10, dec!(0.001));
        let mut window = flat(20, dec!(100));
        detector.evaluate(&window);

        window.remove(0);
        window.push(dec!(105));
        assert!(detector.evaluate(&window).is_some());

        // Volatile window now: no re-arm, no second fire.
        window.remove(0);
        window.push(dec!(110));
        assert!(detector.evaluate(&window).is_none());
    }

    #[test]
    fn test_short_window_never_arms() {
        let mut detector = SqueezeDetector::new(10, dec!(0.001));
        assert!(detector.evaluate(&flat(5, dec!(100))).is_none());
        assert!(!detector.is_armed());
    }

    #[test]
    fn test_wide_bands_do_not_arm() {
        let mut detector = SqueezeDetector::new(4, dec!(0.001));
        let window = vec![dec!(90), dec!(110), dec!(95), dec!(105)];
        assert!(detector.evaluate(&window).is_none());
        assert!(!detector.is_armed());
    }
}
