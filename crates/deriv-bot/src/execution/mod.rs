//! Order execution: the proposal→buy two-phase open, market sells, the
//! balance subscription and open-contract tracking.
//!
//! RPC flows run on spawned tasks so tick handling never blocks on the
//! broker; every outcome returns to the engine mailbox as an `ExecEvent`.
//! The open-contract map itself is mutated only from the engine loop
//! (`register`/`unregister`), keeping ownership single-context.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use deriv_common::{ContractType, TradeRecord, TriggerReason};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::correlator::CallError;
use crate::link::protocol::{
    self, frame_error, ApiError, BuyConfirmation, ErrorCode, LimitOrder, OpenContractUpdate,
    ProposalInfo, ProposalRequest, SellConfirmation,
};
use crate::link::LinkHandle;

/// Static order parameters shared by every contract.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub symbol: String,
    pub currency: String,
    pub multiplier: Decimal,
}

/// A fully sized order the engine decided to open.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub contract_type: ContractType,
    pub stake: Decimal,
    pub trigger_reason: TriggerReason,
    /// Broker-enforced limits; only the squeeze variant sets this.
    pub limit_order: Option<LimitOrder>,
}

/// Why an open attempt failed.
#[derive(Debug, Clone)]
pub enum OpenFailure {
    /// Broker rate limit; the engine imposes a cooldown.
    RateLimited,
    /// Buy limit reached; fatal for the process.
    BuyLimitReached,
    /// Any other broker refusal; the signal is dropped, never retried.
    Rejected(ApiError),
    /// Send failure or response deadline; the signal is dropped.
    Transport(CallError),
}

/// One tracked open contract.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub contract_id: u64,
    pub contract_type: ContractType,
    /// Stake paid on buy.
    pub buy_price: Decimal,
    /// Spot at entry; the engine's TP/SL distances measure from here.
    pub entry_spot: Decimal,
    pub start_time: DateTime<Utc>,
    pub trigger_reason: TriggerReason,
}

/// Execution outcomes delivered to the engine mailbox.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    TradeOpened(OpenPosition),
    OpenFailed(OpenFailure),
    TradeClosed {
        contract_id: u64,
        exit_price: Decimal,
        profit: Decimal,
        balance: Option<Decimal>,
    },
    SellFailed {
        contract_id: u64,
    },
}

/// Order execution over the broker link.
#[derive(Debug)]
pub struct Execution {
    link: LinkHandle,
    config: ExecutionConfig,
    events: mpsc::Sender<ExecEvent>,
    open: HashMap<u64, OpenPosition>,
}

impl Execution {
    pub fn new(link: LinkHandle, config: ExecutionConfig, events: mpsc::Sender<ExecEvent>) -> Self {
        Self {
            link,
            config,
            events,
            open: HashMap::new(),
        }
    }

    /// Subscribe to balance updates; issued once per authorized session.
    pub fn subscribe_balance(&self) -> Result<(), CallError> {
        self.link.send(protocol::balance_subscribe()).map(|_| ())
    }

    /// Re-subscribe to updates for every tracked contract (after a
    /// reconnect).
    pub fn resubscribe_contracts(&self) {
        for contract_id in self.open.keys() {
            if let Err(e) = self
                .link
                .send(protocol::open_contract_subscribe(*contract_id))
            {
                warn!(contract_id, "Contract resubscribe failed: {e}");
            }
        }
    }

    /// Launch the two-phase open flow. The outcome arrives on the mailbox
    /// as `TradeOpened` or `OpenFailed`.
    pub fn spawn_open(&self, intent: OrderIntent) {
        let link = self.link.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let event = match open_flow(&link, &config, &intent).await {
                Ok(position) => ExecEvent::TradeOpened(position),
                Err(failure) => ExecEvent::OpenFailed(failure),
            };
            let _ = events.send(event).await;
        });
    }

    /// Launch a market sell for one tracked contract.
    pub fn spawn_sell(&self, contract_id: u64, reason: TriggerReason) {
        let Some(position) = self.open.get(&contract_id).cloned() else {
            // May happen across restarts or after a broker-side close.
            warn!(contract_id, "Sell requested for untracked contract");
            return;
        };
        info!(contract_id, %reason, "Selling contract");

        let link = self.link.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match sell_flow(&link, contract_id).await {
                Ok(confirmation) => ExecEvent::TradeClosed {
                    contract_id,
                    exit_price: confirmation.sold_for,
                    // The sell response carries no profit field; the
                    // broker-reported figure arrives on the contract
                    // update, which wins if it lands first.
                    profit: confirmation.sold_for - position.buy_price,
                    balance: confirmation.balance_after,
                },
                Err(e) => {
                    warn!(contract_id, "Sell failed: {e:?}");
                    ExecEvent::SellFailed { contract_id }
                }
            };
            let _ = events.send(event).await;
        });
    }

    /// Sell every tracked contract.
    pub fn spawn_sell_all(&self, reason: TriggerReason) {
        let ids: Vec<u64> = self.open.keys().copied().collect();
        for contract_id in ids {
            self.spawn_sell(contract_id, reason);
        }
    }

    /// Track a confirmed open. Returns the trade record for persistence.
    pub fn register(&mut self, position: OpenPosition) -> TradeRecord {
        let record = TradeRecord::opened(
            position.contract_id,
            self.config.symbol.clone(),
            position.contract_type,
            position.start_time,
            position.entry_spot,
            position.trigger_reason,
        );
        self.open.insert(position.contract_id, position);
        record
    }

    /// Stop tracking a contract. `None` means it was already closed (a
    /// duplicate confirmation or a replay) and must not be re-finalized.
    pub fn unregister(&mut self, contract_id: u64) -> Option<OpenPosition> {
        self.open.remove(&contract_id)
    }

    /// Translate an open-contract stream update into a close event.
    /// Realized profit prefers the broker-reported `profit` field.
    pub fn handle_contract_update(&self, update: &OpenContractUpdate) -> Option<ExecEvent> {
        if !update.sold() {
            return None;
        }
        let position = self.open.get(&update.contract_id)?;
        let exit_price = update.sell_price.unwrap_or(Decimal::ZERO);
        let profit = update
            .profit
            .unwrap_or_else(|| exit_price - position.buy_price);
        Some(ExecEvent::TradeClosed {
            contract_id: update.contract_id,
            exit_price,
            profit,
            balance: None,
        })
    }

    pub fn has_open(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &OpenPosition> {
        self.open.values()
    }

    pub fn position(&self, contract_id: u64) -> Option<&OpenPosition> {
        self.open.get(&contract_id)
    }
}

/// The two-phase open: price the proposal, then buy it at the quoted
/// stake.
async fn open_flow(
    link: &LinkHandle,
    config: &ExecutionConfig,
    intent: &OrderIntent,
) -> Result<OpenPosition, OpenFailure> {
    let request = ProposalRequest {
        proposal: 1,
        amount: intent.stake,
        basis: "stake",
        contract_type: intent.contract_type.as_wire(),
        currency: config.currency.clone(),
        symbol: config.symbol.clone(),
        multiplier: config.multiplier,
        limit_order: intent.limit_order,
    };

    let frame = link
        .call(request.to_value())
        .await
        .map_err(OpenFailure::Transport)?;
    let proposal: ProposalInfo = parse_payload(&frame, "proposal")?;

    debug!(id = %proposal.id, ask = %proposal.ask_price, "Proposal priced, buying");

    let frame = link
        .call(protocol::buy(&proposal.id, intent.stake))
        .await
        .map_err(OpenFailure::Transport)?;
    let confirmation: BuyConfirmation = parse_payload(&frame, "buy")?;

    // Track the contract on the broker side as well.
    if let Err(e) = link.send(protocol::open_contract_subscribe(confirmation.contract_id)) {
        warn!(
            contract_id = confirmation.contract_id,
            "Contract subscribe failed: {e}"
        );
    }

    info!(
        contract_id = confirmation.contract_id,
        stake = %confirmation.buy_price,
        %intent.contract_type,
        "Trade opened"
    );

    Ok(OpenPosition {
        contract_id: confirmation.contract_id,
        contract_type: intent.contract_type,
        buy_price: confirmation.buy_price,
        entry_spot: proposal.spot,
        start_time: Utc
            .timestamp_opt(confirmation.start_time, 0)
            .single()
            .unwrap_or_else(Utc::now),
        trigger_reason: intent.trigger_reason,
    })
}

/// Market sell at any price.
async fn sell_flow(link: &LinkHandle, contract_id: u64) -> Result<SellConfirmation, OpenFailure> {
    let frame = link
        .call(protocol::sell(contract_id))
        .await
        .map_err(OpenFailure::Transport)?;
    parse_payload(&frame, "sell")
}

/// Extract a typed payload from a response frame, classifying broker
/// refusals.
fn parse_payload<T: serde::de::DeserializeOwned>(
    frame: &Value,
    field: &str,
) -> Result<T, OpenFailure> {
    if let Some(err) = frame_error(frame) {
        return Err(match err.error_code() {
            ErrorCode::RateLimit => OpenFailure::RateLimited,
            ErrorCode::BuyLimitReached => OpenFailure::BuyLimitReached,
            _ => OpenFailure::Rejected(err),
        });
    }
    frame
        .get(field)
        .cloned()
        .ok_or_else(|| OpenFailure::Transport(CallError::Serialize(format!("missing {field}"))))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| OpenFailure::Transport(CallError::Serialize(e.to_string())))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            symbol: "BOOM500".to_string(),
            currency: "USD".to_string(),
            multiplier: dec!(100),
        }
    }

    fn intent() -> OrderIntent {
        OrderIntent {
            contract_type: ContractType::MultDown,
            stake: dec!(1.50),
            trigger_reason: TriggerReason::SpikeShort,
            limit_order: None,
        }
    }

    fn position(contract_id: u64) -> OpenPosition {
        OpenPosition {
            contract_id,
            contract_type: ContractType::MultDown,
            buy_price: dec!(1.50),
            entry_spot: dec!(104.1),
            start_time: Utc::now(),
            trigger_reason: TriggerReason::SpikeShort,
        }
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&frames.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_two_phase_open_emits_trade_opened() {
        let (link, mut frames) = LinkHandle::pair();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let execution = Execution::new(link.clone(), config(), events_tx);

        execution.spawn_open(intent());

        let proposal_frame = next_frame(&mut frames).await;
        assert_eq!(proposal_frame["proposal"], 1);
        assert_eq!(proposal_frame["contract_type"], "MULTDOWN");
        assert_eq!(proposal_frame["basis"], "stake");
        let req_id = proposal_frame["req_id"].as_u64().unwrap();
        link.inject_frame(
            &json!({
                "msg_type": "proposal", "req_id": req_id,
                "proposal": {"id": "prop-1", "ask_price": 1.50, "spot": 104.1}
            })
            .to_string(),
        );

        let buy_frame = next_frame(&mut frames).await;
        assert_eq!(buy_frame["buy"], "prop-1");
        let req_id = buy_frame["req_id"].as_u64().unwrap();
        link.inject_frame(
            &json!({
                "msg_type": "buy", "req_id": req_id,
                "buy": {"contract_id": 777, "buy_price": 1.50, "start_time": 1717320000}
            })
            .to_string(),
        );

        // The contract subscription follows the confirmation.
        let sub_frame = next_frame(&mut frames).await;
        assert_eq!(sub_frame["proposal_open_contract"], 1);
        assert_eq!(sub_frame["contract_id"], 777);

        match events_rx.recv().await.unwrap() {
            ExecEvent::TradeOpened(position) => {
                assert_eq!(position.contract_id, 777);
                assert_eq!(position.entry_spot, dec!(104.1));
                assert_eq!(position.buy_price, dec!(1.50));
            }
            other => panic!("expected TradeOpened, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_proposal() {
        let (link, mut frames) = LinkHandle::pair();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let execution = Execution::new(link.clone(), config(), events_tx);

        execution.spawn_open(intent());
        let frame = next_frame(&mut frames).await;
        let req_id = frame["req_id"].as_u64().unwrap();
        link.inject_frame(
            &json!({
                "msg_type": "proposal", "req_id": req_id,
                "error": {"code": "RateLimit", "message": "slow down"}
            })
            .to_string(),
        );

        match events_rx.recv().await.unwrap() {
            ExecEvent::OpenFailed(OpenFailure::RateLimited) => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buy_limit_reached_is_classified() {
        let (link, mut frames) = LinkHandle::pair();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let execution = Execution::new(link.clone(), config(), events_tx);

        execution.spawn_open(intent());
        let frame = next_frame(&mut frames).await;
        let req_id = frame["req_id"].as_u64().unwrap();
        link.inject_frame(
            &json!({
                "msg_type": "proposal", "req_id": req_id,
                "error": {"code": "buy_limit_reached", "message": "no more"}
            })
            .to_string(),
        );

        match events_rx.recv().await.unwrap() {
            ExecEvent::OpenFailed(OpenFailure::BuyLimitReached) => {}
            other => panic!("expected BuyLimitReached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sell_flow_computes_fallback_profit() {
        let (link, mut frames) = LinkHandle::pair();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut execution = Execution::new(link.clone(), config(), events_tx);
        execution.register(position(777));

        execution.spawn_sell(777, TriggerReason::TakeProfit);
        let frame = next_frame(&mut frames).await;
        assert_eq!(frame["sell"], 777);
        assert_eq!(frame["price"], 0);
        let req_id = frame["req_id"].as_u64().unwrap();
        link.inject_frame(
            &json!({
                "msg_type": "sell", "req_id": req_id,
                "sell": {"sold_for": 3.75, "balance_after": 1002.25}
            })
            .to_string(),
        );

        match events_rx.recv().await.unwrap() {
            ExecEvent::TradeClosed {
                contract_id,
                exit_price,
                profit,
                balance,
            } => {
                assert_eq!(contract_id, 777);
                assert_eq!(exit_price, dec!(3.75));
                assert_eq!(profit, dec!(2.25));
                assert_eq!(balance, Some(dec!(1002.25)));
            }
            other => panic!("expected TradeClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sell_for_untracked_contract_is_dropped() {
        let (link, mut frames) = LinkHandle::pair();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let execution = Execution::new(link, config(), events_tx);

        execution.spawn_sell(404, TriggerReason::StopLoss);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_contract_update_prefers_broker_profit() {
        let (link, _frames) = LinkHandle::pair();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut execution = Execution::new(link, config(), events_tx);
        execution.register(position(777));

        let update = OpenContractUpdate {
            contract_id: 777,
            is_sold: 1,
            profit: Some(dec!(2.10)),
            sell_price: Some(dec!(3.60)),
            buy_price: Some(dec!(1.50)),
            current_spot: None,
            status: Some("sold".to_string()),
        };
        match execution.handle_contract_update(&update).unwrap() {
            ExecEvent::TradeClosed { profit, .. } => assert_eq!(profit, dec!(2.10)),
            other => panic!("expected TradeClosed, got {other:?}"),
        }

        // Without the broker field, profit falls back to price delta.
        let update = OpenContractUpdate {
            profit: None,
            sell_price: Some(dec!(3.80)),
            ..update
        };
        match execution.handle_contract_update(&update).unwrap() {
            ExecEvent::TradeClosed { profit, .. } => assert_eq!(profit, dec!(2.30)),
            other => panic!("expected TradeClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregister_is_single_shot() {
        let (link, _frames) = LinkHandle::pair();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut execution = Execution::new(link, config(), events_tx);
        execution.register(position(777));

        assert!(execution.unregister(777).is_some());
        assert!(execution.unregister(777).is_none());
        assert!(!execution.has_open());
    }

    #[tokio::test]
    async fn test_update_for_still_open_contract_is_ignored() {
        let (link, _frames) = LinkHandle::pair();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut execution = Execution::new(link, config(), events_tx);
        execution.register(position(777));

        let update = OpenContractUpdate {
            contract_id: 777,
            is_sold: 0,
            profit: Some(dec!(0.50)),
            sell_price: None,
            buy_price: None,
            current_spot: Some(dec!(103.0)),
            status: Some("open".to_string()),
        };
        assert!(execution.handle_contract_update(&update).is_none());
    }
}
