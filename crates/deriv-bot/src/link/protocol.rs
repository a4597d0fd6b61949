//! Broker wire protocol: JSON frames over WSS.
//!
//! Outbound requests are serde structs or small `json!` payloads; the link
//! tags each with a `req_id` before writing. Inbound frames are identified
//! by `msg_type` and carry their payload under a field of the same name;
//! errors arrive as an `error: {code, message}` object.

use deriv_common::{Candle, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// WebSocket endpoint template; the app id is appended as a query param.
pub const WS_URL_BASE: &str = "wss://ws.derivws.com/websockets/v3";

/// Build the socket URL for an application id.
pub fn ws_url(app_id: &str) -> String {
    format!("{WS_URL_BASE}?app_id={app_id}")
}

/// Broker error codes the agent handles distinctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    RateLimit,
    BuyLimitReached,
    InvalidToken,
    AuthorizationRequired,
    MarketIsClosed,
    InvalidSymbol,
    InvalidGranularity,
    Other(String),
}

impl ErrorCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "RateLimit" => ErrorCode::RateLimit,
            "buy_limit_reached" => ErrorCode::BuyLimitReached,
            "InvalidToken" => ErrorCode::InvalidToken,
            "AuthorizationRequired" => ErrorCode::AuthorizationRequired,
            "MarketIsClosed" => ErrorCode::MarketIsClosed,
            "InvalidSymbol" => ErrorCode::InvalidSymbol,
            "InvalidGranularity" => ErrorCode::InvalidGranularity,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

/// Application-level error body attached to a response frame.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_wire(&self.code)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ============================================================================
// Outbound requests
// ============================================================================

/// `{"authorize": TOKEN}`, the first frame after every connect.
pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

/// `{"ping": 1}` heartbeat, sent every 10 s.
pub fn ping() -> Value {
    json!({ "ping": 1 })
}

/// Subscribe to the tick stream for a symbol.
pub fn tick_subscribe(symbol: &str) -> Value {
    json!({ "ticks": symbol, "subscribe": 1 })
}

/// Request 300 historical candles for a timeframe and subscribe to OHLC
/// updates on the same stream.
pub fn candle_history_subscribe(symbol: &str, timeframe: Timeframe, count: usize) -> Value {
    json!({
        "ticks_history": symbol,
        "style": "candles",
        "granularity": timeframe.granularity_secs(),
        "count": count,
        "end": "latest",
        "adjust_start_time": 1,
        "subscribe": 1,
    })
}

/// Subscribe to balance updates.
pub fn balance_subscribe() -> Value {
    json!({ "balance": 1, "subscribe": 1 })
}

/// Subscribe to updates for one open contract.
pub fn open_contract_subscribe(contract_id: u64) -> Value {
    json!({ "proposal_open_contract": 1, "contract_id": contract_id, "subscribe": 1 })
}

/// Buy a previously priced proposal at the quoted stake.
pub fn buy(proposal_id: &str, price: Decimal) -> Value {
    json!({ "buy": proposal_id, "price": price })
}

/// Market-sell an open contract (`price: 0` accepts any price).
pub fn sell(contract_id: u64) -> Value {
    json!({ "sell": contract_id, "price": 0 })
}

/// Broker-enforced limit orders attached to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

/// Pricing request for a multiplier contract (step one of the two-phase
/// open).
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub proposal: u8,
    pub amount: Decimal,
    pub basis: &'static str,
    pub contract_type: &'static str,
    pub currency: String,
    pub symbol: String,
    pub multiplier: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_order: Option<LimitOrder>,
}

impl ProposalRequest {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("proposal request serializes")
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// Payload of a successful `authorize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeInfo {
    pub loginid: String,
    pub balance: Decimal,
    pub currency: String,
}

/// A tick quote from the `tick` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct TickUpdate {
    pub symbol: String,
    pub epoch: i64,
    pub quote: Decimal,
}

/// An OHLC update from a candle subscription. `open_time` is the epoch of
/// the (possibly still forming) candle the update belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct OhlcUpdate {
    pub symbol: String,
    pub granularity: u32,
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl OhlcUpdate {
    pub fn timeframe(&self) -> Option<Timeframe> {
        Timeframe::from_granularity(self.granularity)
    }

    pub fn to_candle(&self) -> Candle {
        Candle {
            epoch_open: self.open_time,
            granularity_secs: self.granularity,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// One historical candle from a `candles` snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryCandle {
    pub epoch: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl HistoryCandle {
    pub fn to_candle(&self, granularity_secs: u32) -> Candle {
        Candle {
            epoch_open: self.epoch,
            granularity_secs,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// Balance update from the balance subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceUpdate {
    pub balance: Decimal,
    pub currency: String,
}

/// Payload of a successful `proposal` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposalInfo {
    pub id: String,
    pub ask_price: Decimal,
    pub spot: Decimal,
}

/// Payload of a successful `buy` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyConfirmation {
    pub contract_id: u64,
    pub buy_price: Decimal,
    pub start_time: i64,
    pub balance_after: Option<Decimal>,
}

/// Payload of a successful `sell` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SellConfirmation {
    pub contract_id: Option<u64>,
    pub sold_for: Decimal,
    pub balance_after: Option<Decimal>,
}

/// Update for one open contract; `is_sold = 1` marks the close.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenContractUpdate {
    pub contract_id: u64,
    #[serde(default)]
    pub is_sold: u8,
    pub profit: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    pub buy_price: Option<Decimal>,
    pub current_spot: Option<Decimal>,
    pub status: Option<String>,
}

impl OpenContractUpdate {
    pub fn sold(&self) -> bool {
        self.is_sold != 0
    }
}

/// Stream messages dispatched by `msg_type` when no pending call claims
/// the frame.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Tick(TickUpdate),
    Ohlc(OhlcUpdate),
    /// Historical candle snapshot for one timeframe.
    CandleHistory {
        timeframe: Timeframe,
        candles: Vec<Candle>,
    },
    Balance(BalanceUpdate),
    OpenContract(OpenContractUpdate),
    Buy(BuyConfirmation),
    Sell(SellConfirmation),
}

/// Parse the payload of a stream frame. Returns `None` for kinds the agent
/// does not consume (e.g. pong) or payloads that fail to parse.
pub fn parse_stream(msg_type: &str, frame: &Value) -> Option<StreamUpdate> {
    match msg_type {
        "tick" => serde_json::from_value(frame.get("tick")?.clone())
            .ok()
            .map(StreamUpdate::Tick),
        "ohlc" => serde_json::from_value(frame.get("ohlc")?.clone())
            .ok()
            .map(StreamUpdate::Ohlc),
        "candles" => {
            let granularity = frame
                .get("echo_req")?
                .get("granularity")?
                .as_u64()? as u32;
            let timeframe = Timeframe::from_granularity(granularity)?;
            let raw: Vec<HistoryCandle> =
                serde_json::from_value(frame.get("candles")?.clone()).ok()?;
            let candles = raw.iter().map(|c| c.to_candle(granularity)).collect();
            Some(StreamUpdate::CandleHistory { timeframe, candles })
        }
        "balance" => serde_json::from_value(frame.get("balance")?.clone())
            .ok()
            .map(StreamUpdate::Balance),
        "proposal_open_contract" => {
            serde_json::from_value(frame.get("proposal_open_contract")?.clone())
                .ok()
                .map(StreamUpdate::OpenContract)
        }
        "buy" => serde_json::from_value(frame.get("buy")?.clone())
            .ok()
            .map(StreamUpdate::Buy),
        "sell" => serde_json::from_value(frame.get("sell")?.clone())
            .ok()
            .map(StreamUpdate::Sell),
        _ => None,
    }
}

/// Extract the error body of a frame, if any.
pub fn frame_error(frame: &Value) -> Option<ApiError> {
    serde_json::from_value(frame.get("error")?.clone()).ok()
}

/// Extract the `req_id` echoed on a frame, if any.
pub fn frame_req_id(frame: &Value) -> Option<u64> {
    frame.get("req_id").and_then(Value::as_u64)
}

/// Extract the `msg_type` of a frame, if any.
pub fn frame_msg_type(frame: &Value) -> Option<&str> {
    frame.get("msg_type").and_then(Value::as_str)
}
