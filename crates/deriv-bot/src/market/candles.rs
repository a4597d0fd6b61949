//! Per-timeframe candle storage.
//!
//! Invariant: at most one forming candle exists per timeframe at any
//! instant: the last element. Everything before it is closed and
//! immutable. The book holds at most 300 candles.

use std::collections::VecDeque;

use deriv_common::{Candle, Timeframe};
use tracing::debug;

/// Maximum candles retained per timeframe.
pub const CANDLE_CAPACITY: usize = 300;

/// Bounded ordered candle sequence for one timeframe, most recent last.
#[derive(Debug)]
pub struct CandleBook {
    timeframe: Timeframe,
    candles: VecDeque<Candle>,
}

impl CandleBook {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            candles: VecDeque::with_capacity(CANDLE_CAPACITY),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Replace the contents with a history snapshot. The snapshot's last
    /// candle is treated as still forming.
    pub fn seed(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        for candle in candles {
            self.candles.push_back(candle);
        }
        self.trim();
    }

    /// Apply one OHLC update.
    ///
    /// Same open-epoch as the forming candle → overwrite in place. A newer
    /// open-epoch closes the forming candle and starts a new one; the
    /// newly closed candle is returned. Stale epochs are dropped.
    pub fn apply(&mut self, update: Candle) -> Option<Candle> {
        match self.candles.back_mut() {
            Some(forming) if forming.epoch_open == update.epoch_open => {
                *forming = update;
                None
            }
            Some(forming) if update.epoch_open < forming.epoch_open => {
                debug!(
                    timeframe = %self.timeframe,
                    epoch = update.epoch_open,
                    "Dropping stale candle update"
                );
                None
            }
            Some(forming) => {
                let closed = *forming;
                self.candles.push_back(update);
                self.trim();
                Some(closed)
            }
            None => {
                self.candles.push_back(update);
                None
            }
        }
    }

    /// Closes of every closed candle, oldest first (the forming candle is
    /// excluded).
    pub fn closed_closes(&self) -> impl Iterator<Item = rust_decimal::Decimal> + '_ {
        let closed = self.candles.len().saturating_sub(1);
        self.candles.iter().take(closed).map(|c| c.close)
    }

    /// Number of closed candles.
    pub fn closed_len(&self) -> usize {
        self.candles.len().saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// The still-forming candle, if any.
    pub fn forming(&self) -> Option<&Candle> {
        self.candles.back()
    }

    fn trim(&mut self) {
        while self.candles.len() > CANDLE_CAPACITY {
            self.candles.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(epoch_open: i64, close: rust_decimal::Decimal) -> Candle {
        Candle {
            epoch_open,
            granularity_secs: 60,
            open: close,
            high: close,
            low: close,
            close,
        }
    }

    #[test]
    fn test_same_epoch_overwrites_forming() {
        let mut book = CandleBook::new(Timeframe::M1);
        assert!(book.apply(candle(60, dec!(100))).is_none());
        assert!(book.apply(candle(60, dec!(101))).is_none());

        assert_eq!(book.len(), 1);
        assert_eq!(book.forming().unwrap().close, dec!(101));
        assert_eq!(book.closed_len(), 0);
    }

    #[test]
    fn test_new_epoch_closes_previous() {
        let mut book = CandleBook::new(Timeframe::M1);
        book.apply(candle(60, dec!(100)));
        let closed = book.apply(candle(120, dec!(102))).unwrap();

        assert_eq!(closed.close, dec!(100));
        assert_eq!(book.closed_len(), 1);
        assert_eq!(book.forming().unwrap().epoch_open, 120);
    }

    #[test]
    fn test_stale_epoch_is_dropped() {
        let mut book = CandleBook::new(Timeframe::M1);
        book.apply(candle(120, dec!(100)));
        assert!(book.apply(candle(60, dec!(95))).is_none());
        assert_eq!(book.len(), 1);
        assert_eq!(book.forming().unwrap().epoch_open, 120);
    }

    #[test]
    fn test_trims_to_capacity() {
        let mut book = CandleBook::new(Timeframe::M1);
        for i in 0..(CANDLE_CAPACITY as i64 + 50) {
            book.apply(candle(i * 60, dec!(100)));
        }
        assert_eq!(book.len(), CANDLE_CAPACITY);
    }

    #[test]
    fn test_seed_replaces_contents() {
        let mut book = CandleBook::new(Timeframe::M1);
        book.apply(candle(60, dec!(1)));

        book.seed(vec![candle(600, dec!(10)), candle(660, dec!(11))]);
        assert_eq!(book.len(), 2);
        assert_eq!(book.closed_len(), 1);
        assert_eq!(book.closed_closes().collect::<Vec<_>>(), vec![dec!(10)]);
    }
}
