//! Shared types for the trading agent.
//!
//! CRITICAL: All prices, stakes, profits and balances use
//! `rust_decimal::Decimal`. NEVER use f64 for financial math.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single quoted price sample from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Broker epoch (seconds). Monotonic per symbol per session, but may
    /// have gaps across reconnects.
    pub epoch: i64,
    /// Quoted price.
    pub price: Decimal,
}

impl Tick {
    pub fn new(epoch: i64, price: Decimal) -> Self {
        Self { epoch, price }
    }
}

/// Candle timeframes tracked by the market book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    /// All tracked timeframes, shortest first.
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1];

    /// Granularity in seconds as used on the wire.
    pub fn granularity_secs(&self) -> u32 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3600,
        }
    }

    /// Map a wire granularity back to a timeframe.
    pub fn from_granularity(secs: u32) -> Option<Self> {
        match secs {
            60 => Some(Timeframe::M1),
            300 => Some(Timeframe::M5),
            900 => Some(Timeframe::M15),
            3600 => Some(Timeframe::H1),
            _ => None,
        }
    }

    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An OHLC candle. The most recent candle of a timeframe is still forming
/// and mutable; earlier candles are closed and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Epoch of the candle open (seconds).
    pub epoch_open: i64,
    /// Interval length in seconds.
    pub granularity_secs: u32,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// Broker contract types for multiplier positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractType {
    /// Long multiplier position.
    MultUp,
    /// Short multiplier position.
    MultDown,
}

impl ContractType {
    /// Wire name understood by the broker.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ContractType::MultUp => "MULTUP",
            ContractType::MultDown => "MULTDOWN",
        }
    }

    /// True for short (MULTDOWN) positions.
    pub fn is_short(&self) -> bool {
        matches!(self, ContractType::MultDown)
    }
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Why a trade was opened or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerReason {
    /// Spike entry while the market state permitted shorts.
    SpikeShort,
    /// Squeeze-breakout entry (alternate strategy).
    SqueezeBreakout,
    /// Take-profit threshold reached.
    TakeProfit,
    /// Stop-loss threshold reached.
    StopLoss,
    /// Momentum train detected; emergency close.
    TrainDetected,
    /// Market state flipped restrictive while a position was open.
    RestrictedState,
    /// SMA25 crossed up through a slower SMA.
    CrossoverGuard,
    /// Operator or process shutdown.
    Shutdown,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::SpikeShort => "SPIKE_SHORT",
            TriggerReason::SqueezeBreakout => "SQUEEZE_BREAKOUT",
            TriggerReason::TakeProfit => "TAKE_PROFIT",
            TriggerReason::StopLoss => "STOP_LOSS",
            TriggerReason::TrainDetected => "TRAIN_DETECTED",
            TriggerReason::RestrictedState => "RESTRICTED_STATE",
            TriggerReason::CrossoverGuard => "CROSSOVER_GUARD",
            TriggerReason::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

/// A trade, keyed by the broker-assigned contract id.
///
/// Born on buy confirmation, finalized once on sell confirmation, then
/// observed only by the persistence sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Broker-assigned contract id (primary key).
    pub contract_id: u64,
    /// Instrument symbol.
    pub symbol: String,
    /// Long or short.
    pub contract_type: ContractType,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    /// Why the position was opened.
    pub trigger_reason: TriggerReason,
    pub status: TradeStatus,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    /// Account balance after the exit, when the broker reported one.
    pub account_balance: Option<Decimal>,
}

impl TradeRecord {
    /// Create an open record at entry.
    pub fn opened(
        contract_id: u64,
        symbol: impl Into<String>,
        contract_type: ContractType,
        entry_time: DateTime<Utc>,
        entry_price: Decimal,
        trigger_reason: TriggerReason,
    ) -> Self {
        Self {
            contract_id,
            symbol: symbol.into(),
            contract_type,
            entry_time,
            entry_price,
            trigger_reason,
            status: TradeStatus::Open,
            exit_time: None,
            exit_price: None,
            profit: None,
            account_balance: None,
        }
    }

    /// Finalize the record on sell confirmation.
    pub fn close(
        &mut self,
        exit_time: DateTime<Utc>,
        exit_price: Decimal,
        profit: Decimal,
        account_balance: Option<Decimal>,
    ) {
        self.status = TradeStatus::Closed;
        self.exit_time = Some(exit_time);
        self.exit_price = Some(exit_price);
        self.profit = Some(profit);
        self.account_balance = account_balance;
    }
}

/// Per-UTC-date trading accumulator. At most one row per date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    /// UTC calendar date this row covers.
    pub date_utc: NaiveDate,
    pub accumulated_profit: Decimal,
    pub trades_taken: u32,
    pub is_cap_reached: bool,
}

impl DailyStat {
    pub fn new(date_utc: NaiveDate) -> Self {
        Self {
            date_utc,
            accumulated_profit: Decimal::ZERO,
            trades_taken: 0,
            is_cap_reached: false,
        }
    }

    /// Apply one trade exit (`$inc`-equivalent semantics).
    pub fn apply_exit(&mut self, profit: Decimal) {
        self.accumulated_profit += profit;
        self.trades_taken += 1;
    }
}
