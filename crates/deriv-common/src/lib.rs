//! Shared types and utilities for the Deriv synthetic-index trading agent.
//!
//! This crate contains:
//! - Common types (Tick, Candle, Timeframe, ContractType, TradeRecord)
//! - Sink interfaces for the external persistence and broadcast collaborators

pub mod sink;
pub mod types;

pub use sink::{BroadcastSink, MemorySink, NoopBroadcast, PersistenceSink, SinkError};
pub use types::*;
