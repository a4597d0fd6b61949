//! Drawdown killswitch.
//!
//! Tracks the balance high-water mark on every balance update. Once the
//! drawdown from the peak reaches the threshold, the latch trips and all
//! entries are refused for 24 hours.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{error, info};

/// Balance-drawdown latch.
#[derive(Debug)]
pub struct DrawdownKillSwitch {
    /// Trip threshold as a fraction of the peak (e.g. 0.045).
    threshold: Decimal,
    trip_duration: Duration,
    starting_balance: Option<Decimal>,
    highest_balance: Option<Decimal>,
    tripped_until: Option<Instant>,
}

impl DrawdownKillSwitch {
    pub fn new(threshold: Decimal, trip_duration: Duration) -> Self {
        Self {
            threshold,
            trip_duration,
            starting_balance: None,
            highest_balance: None,
            tripped_until: None,
        }
    }

    /// Feed one balance update; returns the drawdown fraction when this
    /// update tripped the switch.
    pub fn observe_balance(&mut self, balance: Decimal, now: Instant) -> Option<Decimal> {
        if self.starting_balance.is_none() {
            self.starting_balance = Some(balance);
            info!(%balance, "Starting balance recorded");
        }
        let peak = match self.highest_balance {
            Some(peak) if peak >= balance => peak,
            _ => {
                self.highest_balance = Some(balance);
                balance
            }
        };
        if peak <= Decimal::ZERO {
            return None;
        }

        let drawdown = (peak - balance) / peak;
        if drawdown >= self.threshold && !self.is_tripped(now) {
            self.tripped_until = Some(now + self.trip_duration);
            error!(
                %drawdown,
                %peak,
                %balance,
                "Drawdown killswitch tripped, entries blocked for {:?}",
                self.trip_duration
            );
            return Some(drawdown);
        }
        None
    }

    /// True while the latch holds.
    pub fn is_tripped(&self, now: Instant) -> bool {
        matches!(self.tripped_until, Some(until) if now < until)
    }

    pub fn tripped_until(&self) -> Option<Instant> {
        self.tripped_until
    }

    pub fn starting_balance(&self) -> Option<Decimal> {
        self.starting_balance
    }

    pub fn highest_balance(&self) -> Option<Decimal> {
        self.highest_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn test_trips_at_threshold() {
        let mut ks = DrawdownKillSwitch::new(dec!(0.045), DAY);
        let now = Instant::now();

        assert!(ks.observe_balance(dec!(1000), now).is_none());
        assert!(ks.observe_balance(dec!(980), now).is_none());
        assert!(ks.observe_balance(dec!(960), now).is_none());
        // (1000 - 955) / 1000 = 0.045 exactly.
        let drawdown = ks.observe_balance(dec!(955), now).unwrap();
        assert_eq!(drawdown, dec!(0.045));
        assert!(ks.is_tripped(now));
    }

    #[test]
    fn test_peak_tracks_new_highs() {
        let mut ks = DrawdownKillSwitch::new(dec!(0.045), DAY);
        let now = Instant::now();
        ks.observe_balance(dec!(1000), now);
        ks.observe_balance(dec!(1100), now);
        assert_eq!(ks.highest_balance(), Some(dec!(1100)));
        // 4.4% off the higher peak: no trip.
        assert!(ks.observe_balance(dec!(1052), now).is_none());
    }

    #[test]
    fn test_latch_expires_after_duration() {
        let mut ks = DrawdownKillSwitch::new(dec!(0.045), DAY);
        let now = Instant::now();
        ks.observe_balance(dec!(1000), now);
        ks.observe_balance(dec!(900), now);
        assert!(ks.is_tripped(now));
        assert!(ks.is_tripped(now + DAY - Duration::from_secs(1)));
        assert!(!ks.is_tripped(now + DAY));
    }

    #[test]
    fn test_starting_balance_is_first_observation() {
        let mut ks = DrawdownKillSwitch::new(dec!(0.045), DAY);
        let now = Instant::now();
        ks.observe_balance(dec!(500), now);
        ks.observe_balance(dec!(600), now);
        assert_eq!(ks.starting_balance(), Some(dec!(500)));
    }
}
