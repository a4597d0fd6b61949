//! Market-data aggregation: rolling tick buffer, per-timeframe candle
//! books and the incremental SMA cluster.
//!
//! The book is owned by the engine and mutated only on its event loop.
//! Ingestion methods return the derived events (candle closed, indicators
//! updated) instead of firing callbacks, keeping handlers total.

pub mod candles;
pub mod indicators;

use std::collections::{HashMap, VecDeque};

use deriv_common::{Candle, Tick, Timeframe};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use crate::link::protocol::{self, OhlcUpdate, TickUpdate};
use candles::CandleBook;
use indicators::{SmaCluster, SmaSet};

pub use candles::CANDLE_CAPACITY;
pub use indicators::MarketState;

/// Derived events produced by candle ingestion.
#[derive(Debug, Clone)]
pub enum BookEvent {
    /// A candle on `timeframe` finished forming.
    CandleClosed { timeframe: Timeframe, candle: Candle },
    /// The primary-timeframe SMA cluster was recomputed.
    IndicatorsUpdated(SmaSet),
}

/// Rolling tick buffer, candle books for every tracked timeframe, and the
/// SMA cluster over the primary timeframe.
#[derive(Debug)]
pub struct MarketBook {
    symbol: String,
    primary: Timeframe,
    books: HashMap<Timeframe, CandleBook>,
    ticks: VecDeque<Tick>,
    tick_limit: usize,
    current_price: Option<Decimal>,
    cluster: SmaCluster,
    smas: SmaSet,
}

impl MarketBook {
    pub fn new(symbol: impl Into<String>, primary: Timeframe, tick_limit: usize) -> Self {
        let books = Timeframe::ALL
            .into_iter()
            .map(|tf| (tf, CandleBook::new(tf)))
            .collect();
        Self {
            symbol: symbol.into(),
            primary,
            books,
            ticks: VecDeque::with_capacity(tick_limit),
            tick_limit,
            current_price: None,
            cluster: SmaCluster::new(),
            smas: SmaSet::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn primary_timeframe(&self) -> Timeframe {
        self.primary
    }

    /// The full subscription set for this book, issued on every reconnect
    /// after authorize: the tick stream plus one candle-history
    /// subscription per timeframe.
    pub fn subscription_frames(&self) -> Vec<Value> {
        let mut frames = vec![protocol::tick_subscribe(&self.symbol)];
        for tf in Timeframe::ALL {
            frames.push(protocol::candle_history_subscribe(
                &self.symbol,
                tf,
                CANDLE_CAPACITY,
            ));
        }
        frames
    }

    /// Ingest one tick: update the current price and the rolling buffer.
    pub fn apply_tick(&mut self, update: &TickUpdate) -> Tick {
        let tick = Tick::new(update.epoch, update.quote);
        self.current_price = Some(tick.price);
        self.ticks.push_back(tick);
        while self.ticks.len() > self.tick_limit {
            self.ticks.pop_front();
        }
        tick
    }

    /// Ingest one OHLC update, returning any derived events.
    pub fn apply_ohlc(&mut self, update: &OhlcUpdate) -> Vec<BookEvent> {
        let Some(timeframe) = update.timeframe() else {
            warn!(granularity = update.granularity, "OHLC for unknown granularity");
            return Vec::new();
        };
        let book = self
            .books
            .get_mut(&timeframe)
            .expect("book exists for every tracked timeframe");

        let mut events = Vec::new();
        if let Some(closed) = book.apply(update.to_candle()) {
            events.push(BookEvent::CandleClosed {
                timeframe,
                candle: closed,
            });
            if timeframe == self.primary {
                self.smas = self.cluster.push(closed.close);
                events.push(BookEvent::IndicatorsUpdated(self.smas));
            }
        }
        events
    }

    /// Seed one timeframe from a history snapshot; the cluster is rebuilt
    /// when the primary timeframe reseeds.
    pub fn seed_history(&mut self, timeframe: Timeframe, candles: Vec<Candle>) -> Option<SmaSet> {
        let book = self
            .books
            .get_mut(&timeframe)
            .expect("book exists for every tracked timeframe");
        book.seed(candles);

        if timeframe == self.primary {
            let closes: Vec<Decimal> = book.closed_closes().collect();
            self.smas = self.cluster.recompute(closes);
            Some(self.smas)
        } else {
            None
        }
    }

    /// Latest tick price, if any tick has arrived.
    pub fn current_price(&self) -> Option<Decimal> {
        self.current_price
    }

    /// Current SMA snapshot for the primary timeframe.
    pub fn smas(&self) -> SmaSet {
        self.smas
    }

    /// Market state for a hypothetical price against the current SMAs.
    pub fn state_for(&self, price: Decimal) -> MarketState {
        MarketState::compute(price, &self.smas)
    }

    /// Prices in the rolling tick buffer, oldest first.
    pub fn tick_prices(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.ticks.iter().map(|t| t.price)
    }

    /// Number of buffered ticks.
    pub fn tick_count(&self) -> usize {
        self.ticks.len()
    }

    #[cfg(test)]
    pub fn book(&self, timeframe: Timeframe) -> &CandleBook {
        &self.books[&timeframe]
    }
}
