//! Strategy engine: the single-context state machine that turns ticks and
//! indicator updates into orders.
//!
//! Every event source (link lifecycle, streams, execution outcomes)
//! funnels through one FIFO mailbox and is processed on one loop; handlers
//! mutate state and return actions, and the loop performs them. Within a
//! tick, train detection precedes TP/SL evaluation which precedes entry
//! evaluation.
//!
//! The at-most-one-trade invariant is the `is_trading` flag: taken
//! synchronously before the proposal is launched, released only on
//! `trade_opened`, `trade_closed` or any execution error.

pub mod squeeze;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deriv_common::{BroadcastSink, ContractType, PersistenceSink, TradeRecord, TriggerReason};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::execution::{ExecEvent, Execution, OpenFailure, OrderIntent};
use crate::link::protocol::{LimitOrder, StreamUpdate};
use crate::link::{BrokerAlert, FatalReason, LinkEvent, LinkHandle};
use crate::market::indicators::SmaSet;
use crate::market::{BookEvent, MarketBook, MarketState};
use crate::risk::RiskGuardian;
use squeeze::SqueezeDetector;

/// Which strategy variant drives entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// SMA-cluster spike shorts; TP/SL checked manually on every tick.
    Sma,
    /// Bollinger-squeeze breakouts; TP/SL offloaded to the broker.
    Squeeze,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: StrategyKind,
    /// Fixed stake for the squeeze variant.
    pub stake_amount: Decimal,
    pub multiplier: Decimal,
    /// Manual take-profit distance in points (SMA variant).
    pub tp_points: Decimal,
    /// Manual stop-loss distance in points (SMA variant).
    pub sl_points: Decimal,
    /// Single-tick delta that qualifies as a spike entry signal.
    pub spike_delta: Decimal,
    pub crossover_cooldown: Duration,
    pub rate_limit_cooldown: Duration,
    /// Broker-enforced limits as fractions of stake (squeeze variant).
    pub take_profit_multiplier: Decimal,
    pub stop_loss_multiplier: Decimal,
    pub squeeze_threshold: Decimal,
    pub squeeze_min_window: usize,
}

/// Conditions that terminate the process with exit code 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineFatal {
    #[error("Broker rejected the API token")]
    InvalidToken,

    #[error("Broker buy limit reached")]
    BuyLimitReached,
}

/// One event on the engine mailbox.
#[derive(Debug)]
pub enum EngineEvent {
    Link(LinkEvent),
    Exec(ExecEvent),
}

/// What a handler decided to do.
#[derive(Debug, Clone)]
pub enum EngineAction {
    Open(OrderIntent),
    Sell {
        contract_id: u64,
        reason: TriggerReason,
    },
    SellAll {
        reason: TriggerReason,
    },
}

/// The strategy state machine. All state is mutated on the run loop.
pub struct StrategyEngine {
    config: EngineConfig,
    link: LinkHandle,
    book: MarketBook,
    risk: RiskGuardian,
    execution: Execution,
    sink: Arc<dyn PersistenceSink>,
    broadcast: Arc<dyn BroadcastSink>,
    squeeze: SqueezeDetector,

    current_price: Option<Decimal>,
    previous_price: Option<Decimal>,
    prev_smas: Option<SmaSet>,
    market_state: MarketState,
    active_contract: Option<u64>,
    cooldown_until: Option<Instant>,
    is_trading: bool,
    balance: Option<Decimal>,
}

impl StrategyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        link: LinkHandle,
        book: MarketBook,
        risk: RiskGuardian,
        execution: Execution,
        sink: Arc<dyn PersistenceSink>,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Self {
        let squeeze = SqueezeDetector::new(config.squeeze_min_window, config.squeeze_threshold);
        Self {
            config,
            link,
            book,
            risk,
            execution,
            sink,
            broadcast,
            squeeze,
            current_price: None,
            previous_price: None,
            prev_smas: None,
            market_state: MarketState::Restricted,
            active_contract: None,
            cooldown_until: None,
            is_trading: false,
            balance: None,
        }
    }

    /// Run until the mailbox closes, shutdown is requested, or a fatal
    /// condition surfaces.
    pub async fn run(
        &mut self,
        mailbox: &mut mpsc::Receiver<EngineEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), EngineFatal> {
        info!(strategy = ?self.config.strategy, "Strategy engine running");
        loop {
            tokio::select! {
                event = mailbox.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await?,
                        None => {
                            info!("Mailbox closed, engine stopping");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown requested, engine stopping");
                    if self.execution.has_open() {
                        self.execution.spawn_sell_all(TriggerReason::Shutdown);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Process one mailbox event and perform the resulting actions.
    pub async fn dispatch(&mut self, event: EngineEvent) -> Result<(), EngineFatal> {
        let now_utc = Utc::now();
        let now = Instant::now();
        match event {
            EngineEvent::Link(link_event) => self.handle_link(link_event, now_utc, now).await,
            EngineEvent::Exec(exec_event) => self.handle_exec(exec_event, now_utc, now).await,
        }
    }

    async fn handle_link(
        &mut self,
        event: LinkEvent,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Result<(), EngineFatal> {
        match event {
            LinkEvent::Authorized(info) => {
                info!(balance = %info.balance, currency = %info.currency, "Session authorized, subscribing");
                self.balance = Some(info.balance);
                self.risk.observe_balance(info.balance, now);
                // Re-establish every subscription before any further
                // stream event is processed.
                for frame in self.book.subscription_frames() {
                    if let Err(e) = self.link.send(frame) {
                        warn!("Subscription send failed: {e}");
                    }
                }
                if let Err(e) = self.execution.subscribe_balance() {
                    warn!("Balance subscribe failed: {e}");
                }
                self.execution.resubscribe_contracts();
                // Tick history across the gap is meaningless to the train
                // detector.
                self.risk.reset_train();
                self.previous_price = None;
                self.broadcast.on_status_change("connected");
                Ok(())
            }
            LinkEvent::Closed => {
                self.broadcast.on_status_change("disconnected");
                Ok(())
            }
            LinkEvent::Alert(BrokerAlert::RateLimit) => {
                self.apply_rate_limit(now);
                Ok(())
            }
            LinkEvent::Alert(BrokerAlert::BuyLimitReached) => Err(EngineFatal::BuyLimitReached),
            LinkEvent::Fatal(FatalReason::InvalidToken) => Err(EngineFatal::InvalidToken),
            LinkEvent::Stream(update) => self.handle_stream(update, now_utc, now).await,
        }
    }

    async fn handle_stream(
        &mut self,
        update: StreamUpdate,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Result<(), EngineFatal> {
        match update {
            StreamUpdate::Tick(tick) => {
                self.book.apply_tick(&tick);
                let actions = self.on_tick(tick.quote, now_utc, now);
                self.perform(actions);
                Ok(())
            }
            StreamUpdate::Ohlc(ohlc) => {
                for event in self.book.apply_ohlc(&ohlc) {
                    match event {
                        BookEvent::CandleClosed { timeframe, candle } => {
                            trace!(%timeframe, close = %candle.close, "Candle closed");
                        }
                        BookEvent::IndicatorsUpdated(smas) => {
                            let actions = self.on_indicators(smas, now);
                            self.perform(actions);
                        }
                    }
                }
                Ok(())
            }
            StreamUpdate::CandleHistory { timeframe, candles } => {
                debug!(%timeframe, count = candles.len(), "Candle history seeded");
                if let Some(smas) = self.book.seed_history(timeframe, candles) {
                    // Fresh baseline; no crossover evaluation against a
                    // pre-reconnect snapshot.
                    self.prev_smas = Some(smas);
                }
                Ok(())
            }
            StreamUpdate::Balance(update) => {
                self.balance = Some(update.balance);
                self.broadcast.on_balance_change(update.balance);
                if let Some(drawdown) = self.risk.observe_balance(update.balance, now) {
                    self.broadcast.on_status_change("killswitch");
                    warn!(%drawdown, "Killswitch engaged on balance update");
                }
                Ok(())
            }
            StreamUpdate::OpenContract(update) => {
                if let Some(event) = self.execution.handle_contract_update(&update) {
                    self.handle_exec(event, now_utc, now).await?;
                }
                Ok(())
            }
            StreamUpdate::Buy(confirmation) => {
                debug!(contract_id = confirmation.contract_id, "Buy stream frame");
                Ok(())
            }
            StreamUpdate::Sell(confirmation) => {
                debug!(?confirmation.contract_id, "Sell stream frame");
                Ok(())
            }
        }
    }

    async fn handle_exec(
        &mut self,
        event: ExecEvent,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Result<(), EngineFatal> {
        match event {
            ExecEvent::TradeOpened(position) => {
                self.active_contract = Some(position.contract_id);
                self.is_trading = false;
                let record = self.execution.register(position);
                self.broadcast.on_trade_open(&record);
                if let Err(e) = self.sink.record_entry(&record).await {
                    // In-memory tracking stays authoritative.
                    warn!("Persisting trade entry failed: {e}");
                }
                Ok(())
            }
            ExecEvent::OpenFailed(failure) => {
                self.is_trading = false;
                match failure {
                    OpenFailure::RateLimited => self.apply_rate_limit(now),
                    OpenFailure::BuyLimitReached => return Err(EngineFatal::BuyLimitReached),
                    OpenFailure::Rejected(err) => {
                        // Transient refusal: drop this opportunity, never
                        // retry the same signal.
                        warn!("Proposal rejected: {err}");
                    }
                    OpenFailure::Transport(e) => {
                        warn!("Open failed on transport: {e}");
                    }
                }
                Ok(())
            }
            ExecEvent::TradeClosed {
                contract_id,
                exit_price,
                profit,
                balance,
            } => {
                let Some(position) = self.execution.unregister(contract_id) else {
                    // Duplicate confirmation or a replay across restarts.
                    warn!(contract_id, "Close for untracked contract ignored");
                    return Ok(());
                };
                if self.active_contract == Some(contract_id) {
                    self.active_contract = None;
                }
                self.is_trading = false;
                if let Some(balance) = balance {
                    self.balance = Some(balance);
                }

                let daily = self.risk.record_trade_exit(now_utc, profit);
                info!(
                    contract_id,
                    %profit,
                    %exit_price,
                    day_profit = %daily.accumulated_profit,
                    "Trade closed"
                );

                let mut record = TradeRecord::opened(
                    contract_id,
                    self.book.symbol(),
                    position.contract_type,
                    position.start_time,
                    position.entry_spot,
                    position.trigger_reason,
                );
                record.close(now_utc, exit_price, profit, balance);
                self.broadcast.on_trade_close(&record);

                if let Err(e) = self.sink.record_exit(contract_id, exit_price, profit, balance).await
                {
                    warn!("Persisting trade exit failed: {e}");
                }
                if let Err(e) = self
                    .sink
                    .upsert_daily_stat(now_utc.date_naive(), profit)
                    .await
                {
                    warn!("Persisting daily stat failed: {e}");
                }
                Ok(())
            }
            ExecEvent::SellFailed { contract_id } => {
                // Keep tracking; TP/SL will issue another sell.
                warn!(contract_id, "Sell attempt failed, position stays tracked");
                Ok(())
            }
        }
    }

    /// Tick handler. Order inside a tick: train detection, then TP/SL,
    /// then entry evaluation.
    pub fn on_tick(
        &mut self,
        price: Decimal,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Vec<EngineAction> {
        self.previous_price = self.current_price;
        self.current_price = Some(price);

        if self.risk.observe_tick(price, now) {
            return vec![EngineAction::SellAll {
                reason: TriggerReason::TrainDetected,
            }];
        }

        let mut actions = Vec::new();
        if self.config.strategy == StrategyKind::Sma {
            actions.extend(self.evaluate_exits(price));
        }

        let Some(previous) = self.previous_price else {
            return actions;
        };

        self.market_state = self.book.state_for(price);

        if let Some(until) = self.cooldown_until {
            if now < until {
                return actions;
            }
        }

        match self.config.strategy {
            StrategyKind::Sma => {
                let delta = price - previous;
                if self.market_state.is_permissive() && delta > self.config.spike_delta {
                    if let Some(intent) = self.try_enter(
                        ContractType::MultDown,
                        TriggerReason::SpikeShort,
                        now_utc,
                        now,
                    ) {
                        actions.push(EngineAction::Open(intent));
                    }
                } else if !self.market_state.is_permissive() && self.active_contract.is_some() {
                    actions.push(EngineAction::SellAll {
                        reason: TriggerReason::RestrictedState,
                    });
                }
            }
            StrategyKind::Squeeze => {
                let window: Vec<Decimal> = self.book.tick_prices().collect();
                if let Some(breakout) = self.squeeze.evaluate(&window) {
                    if let Some(intent) = self.try_enter(
                        breakout.direction,
                        TriggerReason::SqueezeBreakout,
                        now_utc,
                        now,
                    ) {
                        actions.push(EngineAction::Open(intent));
                    }
                }
            }
        }
        actions
    }

    /// Manual TP/SL for every open contract (SMA variant only; the
    /// squeeze variant leaves limits to the broker).
    fn evaluate_exits(&self, price: Decimal) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for position in self.execution.open_positions() {
            let favorable = if position.contract_type.is_short() {
                position.entry_spot - price
            } else {
                price - position.entry_spot
            };
            if favorable >= self.config.tp_points {
                actions.push(EngineAction::Sell {
                    contract_id: position.contract_id,
                    reason: TriggerReason::TakeProfit,
                });
            } else if -favorable >= self.config.sl_points {
                actions.push(EngineAction::Sell {
                    contract_id: position.contract_id,
                    reason: TriggerReason::StopLoss,
                });
            }
        }
        actions
    }

    /// Take the `is_trading` mutex and consult the risk guardian. Returns
    /// the sized intent on all-green, releasing the mutex otherwise.
    fn try_enter(
        &mut self,
        contract_type: ContractType,
        reason: TriggerReason,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Option<OrderIntent> {
        if self.is_trading || self.active_contract.is_some() {
            return None;
        }
        self.is_trading = true;

        if let Err(refusal) = self.risk.permits_entry(now_utc, now) {
            debug!(%refusal, "Entry refused");
            self.is_trading = false;
            return None;
        }
        let Some(balance) = self.balance else {
            warn!("Entry signal before any balance update, dropping");
            self.is_trading = false;
            return None;
        };

        let (stake, limit_order) = match self.config.strategy {
            StrategyKind::Sma => (
                self.risk
                    .stake(balance, self.config.multiplier, self.config.sl_points),
                None,
            ),
            StrategyKind::Squeeze => {
                let stake = self.config.stake_amount;
                (
                    stake,
                    Some(LimitOrder {
                        take_profit: (stake * self.config.take_profit_multiplier).round_dp(2),
                        stop_loss: (stake * self.config.stop_loss_multiplier).round_dp(2),
                    }),
                )
            }
        };

        info!(%contract_type, %stake, %reason, "Entry signal accepted");
        Some(OrderIntent {
            contract_type,
            stake,
            trigger_reason: reason,
            limit_order,
        })
    }

    /// Indicator handler: the upward SMA25 crossover guard.
    pub fn on_indicators(&mut self, new: SmaSet, now: Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if let Some(prev) = self.prev_smas {
            if crossed_up(prev.sma25, prev.sma50, new.sma25, new.sma50)
                || crossed_up(prev.sma25, prev.sma100, new.sma25, new.sma100)
            {
                info!("Upward SMA crossover, closing positions and cooling down");
                self.extend_cooldown(now + self.config.crossover_cooldown);
                if self.execution.has_open() {
                    actions.push(EngineAction::SellAll {
                        reason: TriggerReason::CrossoverGuard,
                    });
                }
            }
        }
        self.prev_smas = Some(new);
        actions
    }

    fn apply_rate_limit(&mut self, now: Instant) {
        warn!("Rate limited, cooling down");
        self.extend_cooldown(now + self.config.rate_limit_cooldown);
        self.is_trading = false;
    }

    fn extend_cooldown(&mut self, until: Instant) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn perform(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Open(intent) => self.execution.spawn_open(intent),
                EngineAction::Sell {
                    contract_id,
                    reason,
                } => self.execution.spawn_sell(contract_id, reason),
                EngineAction::SellAll { reason } => self.execution.spawn_sell_all(reason),
            }
        }
    }

    // Accessors used by the harness and tests.

    pub fn is_trading(&self) -> bool {
        self.is_trading
    }

    pub fn active_contract(&self) -> Option<u64> {
        self.active_contract
    }

    pub fn market_state(&self) -> MarketState {
        self.market_state
    }

    pub fn open_trades(&self) -> usize {
        self.execution.open_count()
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    #[cfg(test)]
    pub(crate) fn book_mut(&mut self) -> &mut MarketBook {
        &mut self.book
    }

    #[cfg(test)]
    pub(crate) fn set_balance(&mut self, balance: Decimal) {
        self.balance = Some(balance);
    }

    #[cfg(test)]
    pub(crate) fn set_prev_smas(&mut self, smas: SmaSet) {
        self.prev_smas = Some(smas);
    }
}

/// Did `sma25` cross up through `other` between two snapshots?
fn crossed_up(
    prev_sma25: Option<Decimal>,
    prev_other: Option<Decimal>,
    new_sma25: Option<Decimal>,
    new_other: Option<Decimal>,
) -> bool {
    match (prev_sma25, prev_other, new_sma25, new_other) {
        (Some(p25), Some(pk), Some(n25), Some(nk)) => p25 <= pk && n25 > nk,
        _ => false,
    }
}
