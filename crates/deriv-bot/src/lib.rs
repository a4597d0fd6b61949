//! Autonomous trading agent for Deriv synthetic volatility indices.
//!
//! The agent maintains one WebSocket to the broker, aggregates the tick
//! and candle streams into derived indicator state, and drives a strategy
//! state machine that holds at most one open contract under hard risk
//! constraints.
//!
//! ## Modules
//!
//! - `config`: configuration loading and validation
//! - `link`: socket lifecycle, request/response correlation, wire protocol
//! - `market`: tick buffer, candle books, SMA cluster, market state
//! - `risk`: session gate, daily cap, train detector, killswitch, sizing
//! - `execution`: proposal→buy two-phase open, sells, contract tracking
//! - `engine`: the strategy state machine and its event mailbox

pub mod config;
pub mod engine;
pub mod execution;
pub mod link;
pub mod market;
pub mod risk;

pub use config::{BotConfig, BrokerConfig, RiskConfig, TradingConfig};
pub use engine::{EngineConfig, EngineEvent, EngineFatal, StrategyEngine, StrategyKind};
pub use execution::{ExecEvent, Execution, ExecutionConfig, OpenPosition, OrderIntent};
pub use link::correlator::{CallError, Correlator};
pub use link::protocol::{ApiError, ErrorCode, StreamUpdate};
pub use link::{BrokerAlert, BrokerLink, FatalReason, LinkConfig, LinkEvent, LinkHandle};
pub use market::{BookEvent, MarketBook, MarketState};
pub use risk::{RiskGuardian, RiskRefusal, RiskSettings};
