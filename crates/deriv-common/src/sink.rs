//! Sink interfaces for the external persistence and broadcast collaborators.
//!
//! The agent treats trade storage as an append-only sink with upsert
//! semantics: a crash-restart may replay `trade_opened`/`trade_closed`
//! events, so every write is idempotent on `contract_id`. Persistence
//! failures are logged by callers and never block trading.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{DailyStat, TradeRecord};

/// Errors surfaced by a persistence sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Write failed: {0}")]
    Write(String),
}

/// External persistence for trade records and daily stats.
///
/// All operations are idempotent: `record_entry` and `record_exit` upsert
/// by `contract_id`, `upsert_daily_stat` applies an atomic increment to at
/// most one row per UTC date.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Upsert an opened trade.
    async fn record_entry(&self, trade: &TradeRecord) -> Result<(), SinkError>;

    /// Upsert the exit fields of a trade.
    async fn record_exit(
        &self,
        contract_id: u64,
        exit_price: Decimal,
        profit: Decimal,
        balance: Option<Decimal>,
    ) -> Result<(), SinkError>;

    /// Atomically add `profit_delta` (and one taken trade) to the row for
    /// `date`, creating it if absent.
    async fn upsert_daily_stat(&self, date: NaiveDate, profit_delta: Decimal)
        -> Result<(), SinkError>;
}

/// Fire-and-forget operator notifications. Implementations must never
/// block the caller; failures are swallowed.
pub trait BroadcastSink: Send + Sync {
    fn on_trade_open(&self, trade: &TradeRecord);
    fn on_trade_close(&self, trade: &TradeRecord);
    fn on_balance_change(&self, balance: Decimal);
    fn on_status_change(&self, status: &str);
}

/// Broadcast sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcast;

impl BroadcastSink for NoopBroadcast {
    fn on_trade_open(&self, _trade: &TradeRecord) {}
    fn on_trade_close(&self, _trade: &TradeRecord) {}
    fn on_balance_change(&self, _balance: Decimal) {}
    fn on_status_change(&self, _status: &str) {}
}

/// In-memory reference implementation of [`PersistenceSink`].
///
/// Used as the default sink and by the idempotency tests. Exit fields are
/// only applied once per contract: replaying the same entry/exit pair
/// leaves the store unchanged.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemorySinkState>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    trades: HashMap<u64, TradeRecord>,
    daily: HashMap<NaiveDate, DailyStat>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored trade, if present.
    pub async fn trade(&self, contract_id: u64) -> Option<TradeRecord> {
        self.inner.lock().await.trades.get(&contract_id).cloned()
    }

    /// Number of stored trades.
    pub async fn trade_count(&self) -> usize {
        self.inner.lock().await.trades.len()
    }

    /// Snapshot of the daily row for `date`, if present.
    pub async fn daily_stat(&self, date: NaiveDate) -> Option<DailyStat> {
        self.inner.lock().await.daily.get(&date).copied()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn record_entry(&self, trade: &TradeRecord) -> Result<(), SinkError> {
        let mut state = self.inner.lock().await;
        // Replays of an entry must not clobber exit fields already written.
        state
            .trades
            .entry(trade.contract_id)
            .or_insert_with(|| trade.clone());
        Ok(())
    }

    async fn record_exit(
        &self,
        contract_id: u64,
        exit_price: Decimal,
        profit: Decimal,
        balance: Option<Decimal>,
    ) -> Result<(), SinkError> {
        let mut state = self.inner.lock().await;
        if let Some(trade) = state.trades.get_mut(&contract_id) {
            if trade.profit.is_none() {
                trade.close(chrono::Utc::now(), exit_price, profit, balance);
            }
        }
        Ok(())
    }

    async fn upsert_daily_stat(
        &self,
        date: NaiveDate,
        profit_delta: Decimal,
    ) -> Result<(), SinkError> {
        let mut state = self.inner.lock().await;
        state
            .daily
            .entry(date)
            .or_insert_with(|| DailyStat::new(date))
            .apply_exit(profit_delta);
        Ok(())
    }
}
