//! Shared transport types: snapshots, bars, scanner rows, positions, orders, events.

use optiondesk::Price;
use serde::Serialize;

/// Market data class requested from the terminal (`reqMarketDataType`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataType {
    Live,
    Frozen,
    Delayed,
    DelayedFrozen,
}

impl MarketDataType {
    /// Numeric code used on the wire.
    pub fn code(self) -> i32 {
        match self {
            MarketDataType::Live => 1,
            MarketDataType::Frozen => 2,
            MarketDataType::Delayed => 3,
            MarketDataType::DelayedFrozen => 4,
        }
    }
}

/// One market data snapshot. Missing ticks stay `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QuoteSnapshot {
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    pub last: Option<Price>,
    pub close: Option<Price>,
    pub volume: Option<f64>,
}

impl QuoteSnapshot {
    pub fn has_price(&self) -> bool {
        self.bid.is_some() || self.ask.is_some() || self.last.is_some() || self.close.is_some()
    }
}

/// Historical data request shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoricalRequest {
    /// How far back to look, in calendar days.
    pub duration_days: u32,
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
}

impl HistoricalRequest {
    pub fn daily(duration_days: u32) -> Self {
        Self {
            duration_days,
            bar_size: "1 day".to_string(),
            what_to_show: "TRADES".to_string(),
            use_rth: true,
        }
    }
}

/// One OHLCV bar. `time` is Unix seconds at bar open.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bar {
    pub time: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContractDetails {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub long_name: String,
}

/// Option chain parameters for one exchange (`reqSecDefOptParams`).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptionChainParams {
    pub exchange: String,
    pub underlying_con_id: i64,
    pub trading_class: String,
    pub multiplier: String,
    /// `YYYYMMDD` strings, as sent by the broker.
    pub expirations: Vec<String>,
    pub strikes: Vec<f64>,
}

/// One broker-side scan.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScannerSubscription {
    pub instrument: String,
    pub location_code: String,
    pub scan_code: String,
    pub number_of_rows: usize,
    /// Filter tag/value pairs (`abovePrice`, `aboveVolume`, ...).
    pub filters: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScannerRow {
    pub rank: i32,
    pub symbol: String,
    pub sec_type: String,
    pub con_id: i64,
}

/// A row from the structured positions call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PositionRow {
    pub account: String,
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub expiration: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<String>,
    pub position: f64,
    pub average_cost: f64,
}

/// A row from the "all open orders" poll.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OpenOrderRow {
    pub order_id: i64,
    pub perm_id: Option<i64>,
    pub client_id: Option<i32>,
    pub symbol: String,
    pub status: Option<String>,
    pub filled: Option<f64>,
    pub remaining: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub why_held: Option<String>,
}

/// Streamed order status update.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OrderStatusEvent {
    pub order_id: i64,
    pub status: String,
    pub filled: f64,
    pub remaining: f64,
    pub avg_fill_price: f64,
    pub last_fill_price: f64,
    pub perm_id: i64,
    pub client_id: i32,
    pub why_held: String,
}

/// A raw positional protocol record: message type id first, then fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fieldset(pub Vec<String>);

impl Fieldset {
    pub fn from_strs(fields: &[&str]) -> Self {
        Fieldset(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

/// Everything a session pushes without being asked.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    OrderStatus(OrderStatusEvent),
    Fieldset(Fieldset),
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerSide {
    Buy,
    Sell,
}

impl BrokerSide {
    pub fn action(self) -> &'static str {
        match self {
            BrokerSide::Buy => "BUY",
            BrokerSide::Sell => "SELL",
        }
    }
}

/// Market or limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrokerOrderType {
    Market,
    Limit(Price),
}

/// Order parameters handed to `place_order`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTicket {
    pub side: BrokerSide,
    pub quantity: f64,
    pub order_type: BrokerOrderType,
    pub time_in_force: String,
    pub account: Option<String>,
    /// Caller-side reference, echoed back by the broker as `orderRef`.
    pub order_ref: Option<String>,
}

