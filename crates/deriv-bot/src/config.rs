//! Configuration for deriv-bot.
//!
//! Supports loading from a TOML file with environment variable overrides.
//! Credentials come from the environment (`APP_ID`, `DERIV_TOKEN`) and are
//! required: a missing credential fails validation before boot.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::{EngineConfig, StrategyKind};
use crate::execution::ExecutionConfig;
use crate::link::{LinkConfig, DEFAULT_CALL_TIMEOUT};
use crate::risk::RiskSettings;
use deriv_common::Timeframe;

/// Top-level configuration for the agent.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Broker credentials and instrument.
    pub broker: BrokerConfig,
    /// Strategy and order parameters.
    pub trading: TradingConfig,
    /// Risk guardian parameters.
    pub risk: RiskConfig,
    /// Logging level.
    pub log_level: String,
}

/// Broker credentials and the traded instrument.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Application id for the socket URL (required).
    pub app_id: String,
    /// API token (required).
    pub token: String,
    /// Primary instrument.
    pub symbol: String,
    /// Account currency.
    pub currency: String,
}

/// Strategy and order parameters.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Strategy variant: "sma" | "squeeze".
    pub strategy: String,
    /// Fixed stake for the squeeze variant.
    pub stake_amount: Decimal,
    pub multiplier: Decimal,
    /// Manual take-profit distance in points.
    pub tp_points: Decimal,
    /// Manual stop-loss distance in points.
    pub sl_points: Decimal,
    /// Single-tick delta that qualifies as a spike.
    pub spike_delta: Decimal,
    /// Broker take-profit as a fraction of stake (squeeze variant).
    pub take_profit_multiplier: Decimal,
    /// Broker stop-loss as a fraction of stake (squeeze variant).
    pub stop_loss_multiplier: Decimal,
    /// Rolling tick buffer length.
    pub tick_limit: usize,
    /// Bandwidth threshold that arms the squeeze.
    pub squeeze_threshold: Decimal,
    /// Primary candle timeframe for the SMA cluster.
    pub primary_timeframe: Timeframe,
}

/// Risk guardian parameters.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub daily_cap: Decimal,
    pub train_delta: Decimal,
    pub train_pause_minutes: u64,
    pub cooldown_minutes_crossover: u64,
    pub rate_limit_cooldown_secs: u64,
    pub killswitch_threshold: Decimal,
    pub killswitch_hours: u64,
    pub session_start_utc_hour: u32,
    pub session_end_utc_hour: u32,
    pub risk_fraction: Decimal,
}

impl Default for BotConfig {
    fn default() -> Self {
        TomlConfig::default().into()
    }
}

impl BotConfig {
    /// Load from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse from TOML content.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(file.into())
    }

    /// Apply environment variable overrides. Credentials only come from
    /// here.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.broker.app_id, "APP_ID");
        override_string(&mut self.broker.token, "DERIV_TOKEN");
        override_string(&mut self.broker.symbol, "SYMBOL");
        override_string(&mut self.broker.currency, "CURRENCY");
        override_string(&mut self.trading.strategy, "STRATEGY");
        override_string(&mut self.log_level, "LOG_LEVEL");

        override_parse(&mut self.trading.stake_amount, "STAKE_AMOUNT");
        override_parse(&mut self.trading.multiplier, "MULTIPLIER");
        override_parse(&mut self.trading.tp_points, "TP_POINTS");
        override_parse(&mut self.trading.sl_points, "SL_POINTS");
        override_parse(&mut self.trading.take_profit_multiplier, "TAKE_PROFIT_MULTIPLIER");
        override_parse(&mut self.trading.stop_loss_multiplier, "STOP_LOSS_MULTIPLIER");
        override_parse(&mut self.trading.tick_limit, "TICK_LIMIT");
        override_parse(&mut self.trading.squeeze_threshold, "SQUEEZE_THRESHOLD");

        override_parse(&mut self.risk.daily_cap, "DAILY_CAP");
        override_parse(&mut self.risk.train_delta, "TRAIN_DELTA");
        override_parse(&mut self.risk.train_pause_minutes, "TRAIN_PAUSE_MINUTES");
        override_parse(
            &mut self.risk.cooldown_minutes_crossover,
            "COOLDOWN_MINUTES_CROSSOVER",
        );
        override_parse(&mut self.risk.killswitch_threshold, "KILLSWITCH_THRESHOLD");
        override_parse(&mut self.risk.session_start_utc_hour, "SESSION_START_UTC_HOUR");
        override_parse(&mut self.risk.session_end_utc_hour, "SESSION_END_UTC_HOUR");
        override_parse(&mut self.risk.risk_fraction, "RISK_FRACTION");

        // The spike entry threshold tracks the train delta unless set
        // explicitly.
        override_parse(&mut self.trading.spike_delta, "TRAIN_DELTA");
        override_parse(&mut self.trading.spike_delta, "SPIKE_DELTA");
    }

    /// Validate before boot. Missing credentials are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.broker.app_id.is_empty() {
            bail!("APP_ID is required");
        }
        if self.broker.token.is_empty() {
            bail!("DERIV_TOKEN is required");
        }
        if self.broker.symbol.is_empty() {
            bail!("SYMBOL must not be empty");
        }
        if self.strategy_kind().is_none() {
            bail!("Unknown strategy {:?}", self.trading.strategy);
        }
        if self.risk.session_start_utc_hour >= self.risk.session_end_utc_hour {
            bail!("Session start hour must precede end hour");
        }
        if self.risk.session_end_utc_hour > 24 {
            bail!("Session end hour must be at most 24");
        }
        if self.trading.multiplier <= Decimal::ZERO {
            bail!("Multiplier must be positive");
        }
        if self.trading.stake_amount <= Decimal::ZERO {
            bail!("Stake amount must be positive");
        }
        if self.risk.risk_fraction <= Decimal::ZERO || self.risk.risk_fraction >= Decimal::ONE {
            bail!("Risk fraction must be in (0, 1)");
        }
        if self.trading.tick_limit < 3 {
            bail!("Tick limit must be at least 3");
        }
        Ok(())
    }

    pub fn strategy_kind(&self) -> Option<StrategyKind> {
        match self.trading.strategy.to_lowercase().as_str() {
            "sma" => Some(StrategyKind::Sma),
            "squeeze" => Some(StrategyKind::Squeeze),
            _ => None,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            app_id: self.broker.app_id.clone(),
            token: self.broker.token.clone(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            symbol: self.broker.symbol.clone(),
            currency: self.broker.currency.clone(),
            multiplier: self.trading.multiplier,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            strategy: self.strategy_kind().unwrap_or(StrategyKind::Sma),
            stake_amount: self.trading.stake_amount,
            multiplier: self.trading.multiplier,
            tp_points: self.trading.tp_points,
            sl_points: self.trading.sl_points,
            spike_delta: self.trading.spike_delta,
            crossover_cooldown: Duration::from_secs(self.risk.cooldown_minutes_crossover * 60),
            rate_limit_cooldown: Duration::from_secs(self.risk.rate_limit_cooldown_secs),
            take_profit_multiplier: self.trading.take_profit_multiplier,
            stop_loss_multiplier: self.trading.stop_loss_multiplier,
            squeeze_threshold: self.trading.squeeze_threshold,
            squeeze_min_window: self.trading.tick_limit,
        }
    }

    pub fn risk_settings(&self) -> RiskSettings {
        RiskSettings {
            daily_cap: self.risk.daily_cap,
            train_delta: self.risk.train_delta,
            train_pause: Duration::from_secs(self.risk.train_pause_minutes * 60),
            killswitch_threshold: self.risk.killswitch_threshold,
            killswitch_duration: Duration::from_secs(self.risk.killswitch_hours * 3600),
            session_start_utc_hour: self.risk.session_start_utc_hour,
            session_end_utc_hour: self.risk.session_end_utc_hour,
            risk_fraction: self.risk.risk_fraction,
        }
    }
}

fn override_string(target: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn override_parse<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

// ============================================================================
// TOML mirror
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    general: GeneralToml,
    broker: BrokerToml,
    trading: TradingToml,
    risk: RiskToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BrokerToml {
    app_id: String,
    symbol: String,
    currency: String,
}

impl Default for BrokerToml {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            symbol: "BOOM500".to_string(),
            currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TradingToml {
    strategy: String,
    stake_amount: f64,
    multiplier: f64,
    tp_points: f64,
    sl_points: f64,
    spike_delta: f64,
    take_profit_multiplier: f64,
    stop_loss_multiplier: f64,
    tick_limit: usize,
    squeeze_threshold: f64,
}

impl Default for TradingToml {
    fn default() -> Self {
        Self {
            strategy: "sma".to_string(),
            stake_amount: 1.0,
            multiplier: 100.0,
            tp_points: 15.0,
            sl_points: 5.0,
            spike_delta: 4.0,
            take_profit_multiplier: 0.6,
            stop_loss_multiplier: 0.4,
            tick_limit: 50,
            squeeze_threshold: 0.0015,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RiskToml {
    daily_cap: f64,
    train_delta: f64,
    train_pause_minutes: u64,
    cooldown_minutes_crossover: u64,
    rate_limit_cooldown_secs: u64,
    killswitch_threshold: f64,
    killswitch_hours: u64,
    session_start_utc_hour: u32,
    session_end_utc_hour: u32,
    risk_fraction: f64,
}

impl Default for RiskToml {
    fn default() -> Self {
        Self {
            daily_cap: 8.0,
            train_delta: 4.0,
            train_pause_minutes: 15,
            cooldown_minutes_crossover: 5,
            rate_limit_cooldown_secs: 60,
            killswitch_threshold: 0.045,
            killswitch_hours: 24,
            session_start_utc_hour: 8,
            session_end_utc_hour: 21,
            risk_fraction: 0.015,
        }
    }
}

fn f64_to_decimal(v: f64) -> Decimal {
    Decimal::try_from(v).unwrap_or_default()
}

impl From<TomlConfig> for BotConfig {
    fn from(file: TomlConfig) -> Self {
        Self {
            broker: BrokerConfig {
                app_id: file.broker.app_id,
                token: String::new(),
                symbol: file.broker.symbol,
                currency: file.broker.currency,
            },
            trading: TradingConfig {
                strategy: file.trading.strategy,
                stake_amount: f64_to_decimal(file.trading.stake_amount),
                multiplier: f64_to_decimal(file.trading.multiplier),
                tp_points: f64_to_decimal(file.trading.tp_points),
                sl_points: f64_to_decimal(file.trading.sl_points),
                spike_delta: f64_to_decimal(file.trading.spike_delta),
                take_profit_multiplier: f64_to_decimal(file.trading.take_profit_multiplier),
                stop_loss_multiplier: f64_to_decimal(file.trading.stop_loss_multiplier),
                tick_limit: file.trading.tick_limit,
                squeeze_threshold: f64_to_decimal(file.trading.squeeze_threshold),
                primary_timeframe: Timeframe::M1,
            },
            risk: RiskConfig {
                daily_cap: f64_to_decimal(file.risk.daily_cap),
                train_delta: f64_to_decimal(file.risk.train_delta),
                train_pause_minutes: file.risk.train_pause_minutes,
                cooldown_minutes_crossover: file.risk.cooldown_minutes_crossover,
                rate_limit_cooldown_secs: file.risk.rate_limit_cooldown_secs,
                killswitch_threshold: f64_to_decimal(file.risk.killswitch_threshold),
                killswitch_hours: file.risk.killswitch_hours,
                session_start_utc_hour: file.risk.session_start_utc_hour,
                session_end_utc_hour: file.risk.session_end_utc_hour,
                risk_fraction: f64_to_decimal(file.risk.risk_fraction),
            },
            log_level: file.general.log_level,
        }
    }
}
