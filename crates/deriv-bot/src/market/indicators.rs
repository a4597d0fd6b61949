//! Incremental SMA cluster and the derived market state.
//!
//! SMAs are computed only over closed candles of the primary timeframe;
//! the forming candle never contributes, so indicator values cannot
//! repaint.

use std::collections::VecDeque;

use rust_decimal::Decimal;

/// Rolling simple moving average with a running sum.
#[derive(Debug)]
pub struct RollingSma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl RollingSma {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: Decimal::ZERO,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Push one closed-candle close; returns the SMA once the window is
    /// full, `None` before that.
    pub fn push(&mut self, close: Decimal) -> Option<Decimal> {
        self.window.push_back(close);
        self.sum += close;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        self.value()
    }

    /// Current SMA, defined only when `period` closes have been seen.
    pub fn value(&self) -> Option<Decimal> {
        if self.window.len() == self.period {
            Some(self.sum / Decimal::from(self.period as u64))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}

/// Snapshot of the SMA cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmaSet {
    pub sma25: Option<Decimal>,
    pub sma50: Option<Decimal>,
    pub sma100: Option<Decimal>,
    pub sma200: Option<Decimal>,
}

impl SmaSet {
    /// True once the three slow SMAs driving the market state are defined.
    pub fn gating_defined(&self) -> bool {
        self.sma50.is_some() && self.sma100.is_some() && self.sma200.is_some()
    }
}

/// The four-average cluster, updated exactly once per candle close.
#[derive(Debug)]
pub struct SmaCluster {
    sma25: RollingSma,
    sma50: RollingSma,
    sma100: RollingSma,
    sma200: RollingSma,
}

impl SmaCluster {
    pub fn new() -> Self {
        Self {
            sma25: RollingSma::new(25),
            sma50: RollingSma::new(50),
            sma100: RollingSma::new(100),
            sma200: RollingSma::new(200),
        }
    }

    /// Feed one newly closed close and return the updated snapshot.
    pub fn push(&mut self, close: Decimal) -> SmaSet {
        self.sma25.push(close);
        self.sma50.push(close);
        self.sma100.push(close);
        self.sma200.push(close);
        self.snapshot()
    }

    /// Rebuild from a full closed-close history (after a reconnect
    /// reseeded the candle book).
    pub fn recompute<I: IntoIterator<Item = Decimal>>(&mut self, closes: I) -> SmaSet {
        self.sma25.reset();
        self.sma50.reset();
        self.sma100.reset();
        self.sma200.reset();
        for close in closes {
            self.sma25.push(close);
            self.sma50.push(close);
            self.sma100.push(close);
            self.sma200.push(close);
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> SmaSet {
        SmaSet {
            sma25: self.sma25.value(),
            sma50: self.sma50.value(),
            sma100: self.sma100.value(),
            sma200: self.sma200.value(),
        }
    }
}

impl Default for SmaCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Trade permission derived from price against the slow SMAs, computed on
/// every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    /// Entries blocked. The default whenever any gating SMA is undefined.
    Restricted,
    /// Price is below sma50, sma100 and sma200; shorts permitted.
    Permissive,
}

impl MarketState {
    pub fn compute(price: Decimal, smas: &SmaSet) -> Self {
        match (smas.sma50, smas.sma100, smas.sma200) {
            (Some(s50), Some(s100), Some(s200))
                if price < s50 && price < s100 && price < s200 =>
            {
                MarketState::Permissive
            }
            _ => MarketState::Restricted,
        }
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self, MarketState::Permissive)
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketState::Restricted => write!(f, "RESTRICTED"),
            MarketState::Permissive => write!(f, "PERMISSIVE"),
        }
    }
}
