//! Mock transport for testing. Implements [`Transport`] and [`Connector`]
//! with scripted behavior.
//!
//! Use this in integration tests to simulate the terminal without a socket.
//!
//! ```ignore
//! use optiondesk_broker::mock::{MockConnector, MockTransport};
//! use optiondesk_broker::MarketDataType;
//! use optiondesk::Symbol;
//!
//! let transport = MockTransport::builder()
//!     .with_quote(Symbol::new("AAPL"), 189_50, 189_60)
//!     .entitled_to(&[MarketDataType::Delayed])
//!     .build();
//! let connector = MockConnector::new().with_port(4002, transport.clone());
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use optiondesk::{Instrument, Price, Symbol};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::types::*;
use crate::{Connector, Transport, TransportResult};

/// A recorded call, for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    pub method: &'static str,
    pub key: String,
}

/// A recorded order placement.
#[derive(Clone, Debug)]
pub struct RecordedOrder {
    pub order_id: i64,
    pub instrument: Instrument,
    pub ticket: OrderTicket,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    server_time: i64,
    data_type: Option<MarketDataType>,
    data_type_history: Vec<MarketDataType>,
    entitled: Vec<MarketDataType>,
    quotes: FxHashMap<String, QuoteSnapshot>,
    bars: FxHashMap<String, Vec<Bar>>,
    contract_details: FxHashMap<String, Vec<ContractDetails>>,
    chains: FxHashMap<String, Vec<OptionChainParams>>,
    scanner_rows: FxHashMap<String, Vec<ScannerRow>>,
    positions: Option<Vec<PositionRow>>,
    open_orders: Vec<OpenOrderRow>,
    account_fieldsets: Vec<Fieldset>,
    place_status: Option<String>,
    next_order_id: i64,
    placed: Vec<RecordedOrder>,
    /// `"method:key"` → failures returned (front first) before normal behavior.
    failures: FxHashMap<String, VecDeque<TransportError>>,
    calls: Vec<MockCall>,
}

/// Builder for [`MockTransport`].
pub struct MockTransportBuilder {
    state: MockState,
    latency: Duration,
}

impl MockTransportBuilder {
    /// Every call sleeps this long (tokio time) before answering.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_quote(mut self, symbol: Symbol, bid_cents: i64, ask_cents: i64) -> Self {
        self.state.quotes.insert(
            symbol.as_str().to_string(),
            QuoteSnapshot {
                bid: Some(Price(bid_cents)),
                ask: Some(Price(ask_cents)),
                last: Some(Price((bid_cents + ask_cents) / 2)),
                close: None,
                volume: None,
            },
        );
        self
    }

    pub fn with_snapshot(mut self, instrument: &Instrument, snapshot: QuoteSnapshot) -> Self {
        self.state.quotes.insert(instrument.key(), snapshot);
        self
    }

    /// Market data classes the account may use. Snapshots requested in any
    /// other class fail with a subscription error.
    pub fn entitled_to(mut self, types: &[MarketDataType]) -> Self {
        self.state.entitled = types.to_vec();
        self
    }

    pub fn with_bars(mut self, symbol: Symbol, bars: Vec<Bar>) -> Self {
        self.state.bars.insert(symbol.as_str().to_string(), bars);
        self
    }

    pub fn with_contract_details(mut self, symbol: Symbol, con_id: i64) -> Self {
        self.state.contract_details.insert(
            symbol.as_str().to_string(),
            vec![ContractDetails {
                con_id,
                symbol: symbol.as_str().to_string(),
                sec_type: "STK".to_string(),
                exchange: "SMART".to_string(),
                primary_exchange: "NASDAQ".to_string(),
                currency: "USD".to_string(),
                long_name: String::new(),
            }],
        );
        self
    }

    pub fn with_option_chain(mut self, symbol: Symbol, params: OptionChainParams) -> Self {
        self.state
            .chains
            .entry(symbol.as_str().to_string())
            .or_default()
            .push(params);
        self
    }

    pub fn with_scanner_rows(mut self, scan_code: &str, symbols: &[&str]) -> Self {
        let rows = symbols
            .iter()
            .enumerate()
            .map(|(rank, s)| ScannerRow {
                rank: rank as i32,
                symbol: s.to_string(),
                sec_type: "STK".to_string(),
                con_id: 1000 + rank as i64,
            })
            .collect();
        self.state.scanner_rows.insert(scan_code.to_string(), rows);
        self
    }

    pub fn with_positions(mut self, rows: Vec<PositionRow>) -> Self {
        self.state.positions = Some(rows);
        self
    }

    /// Fieldsets pushed as events when account updates are subscribed.
    pub fn with_account_fieldsets(mut self, fieldsets: Vec<Fieldset>) -> Self {
        self.state.account_fieldsets = fieldsets;
        self
    }

    /// Status pushed as an order-status event right after `place_order`.
    pub fn with_place_status(mut self, status: &str) -> Self {
        self.state.place_status = Some(status.to_string());
        self
    }

    /// Queue a failure for `method` (and `key`: symbol, scan code, or `""`).
    pub fn fail_next(mut self, method: &str, key: &str, error: TransportError) -> Self {
        self.state
            .failures
            .entry(format!("{method}:{key}"))
            .or_default()
            .push_back(error);
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        let (events, _) = broadcast::channel(256);
        Arc::new(MockTransport {
            state: Mutex::new(self.state),
            events,
            latency: self.latency,
        })
    }
}

/// An in-memory terminal session that records calls and returns scripted responses.
pub struct MockTransport {
    state: Mutex<MockState>,
    events: broadcast::Sender<TransportEvent>,
    latency: Duration,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder {
            state: MockState {
                connected: true,
                server_time: 1_790_000_000,
                entitled: vec![
                    MarketDataType::Live,
                    MarketDataType::Frozen,
                    MarketDataType::Delayed,
                    MarketDataType::DelayedFrozen,
                ],
                next_order_id: 1,
                ..Default::default()
            },
            latency: Duration::ZERO,
        }
    }

    /// Number of recorded calls to `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Number of recorded calls to `method` with `key`.
    pub fn call_count_for(&self, method: &str, key: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.key == key)
            .count()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Market data types requested so far, in order.
    pub fn data_type_history(&self) -> Vec<MarketDataType> {
        self.state.lock().data_type_history.clone()
    }

    pub fn placed_orders(&self) -> Vec<RecordedOrder> {
        self.state.lock().placed.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn set_open_orders(&self, rows: Vec<OpenOrderRow>) {
        self.state.lock().open_orders = rows;
    }

    pub fn set_scanner_rows(&self, scan_code: &str, symbols: &[&str]) {
        let rows = symbols
            .iter()
            .enumerate()
            .map(|(rank, s)| ScannerRow {
                rank: rank as i32,
                symbol: s.to_string(),
                sec_type: "STK".to_string(),
                con_id: 1000 + rank as i64,
            })
            .collect();
        self.state.lock().scanner_rows.insert(scan_code.to_string(), rows);
    }

    pub fn push_failure(&self, method: &str, key: &str, error: TransportError) {
        self.state
            .lock()
            .failures
            .entry(format!("{method}:{key}"))
            .or_default()
            .push_back(error);
    }

    /// Push an event to every subscribed receiver.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Record the call, apply latency, and surface any queued failure.
    async fn enter(&self, method: &'static str, key: &str) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            state.calls.push(MockCall {
                method,
                key: key.to_string(),
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::disconnected("mock: not connected"));
        }
        if let Some(queue) = state.failures.get_mut(&format!("{method}:{key}")) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn current_time(&self) -> TransportResult<i64> {
        self.enter("current_time", "").await?;
        Ok(self.state.lock().server_time)
    }

    async fn set_market_data_type(&self, data_type: MarketDataType) -> TransportResult<()> {
        self.enter("set_market_data_type", "").await?;
        let mut state = self.state.lock();
        state.data_type = Some(data_type);
        state.data_type_history.push(data_type);
        Ok(())
    }

    async fn market_data_snapshot(&self, instrument: &Instrument) -> TransportResult<QuoteSnapshot> {
        let key = instrument.key();
        self.enter("market_data_snapshot", &key).await?;
        let state = self.state.lock();
        let data_type = state.data_type.unwrap_or(MarketDataType::Live);
        if !state.entitled.contains(&data_type) {
            return Err(TransportError::from_broker(
                354,
                "Requested market data is not subscribed. Requires additional subscription",
            ));
        }
        state
            .quotes
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::from_broker(200, format!("No security definition has been found for {key}")))
    }

    async fn historical_bars(
        &self,
        instrument: &Instrument,
        _request: &HistoricalRequest,
    ) -> TransportResult<Vec<Bar>> {
        let key = instrument.key();
        self.enter("historical_bars", &key).await?;
        Ok(self.state.lock().bars.get(&key).cloned().unwrap_or_default())
    }

    async fn contract_details(&self, instrument: &Instrument) -> TransportResult<Vec<ContractDetails>> {
        let key = instrument.key();
        self.enter("contract_details", &key).await?;
        self.state
            .lock()
            .contract_details
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::from_broker(200, format!("No security definition has been found for {key}")))
    }

    async fn sec_def_opt_params(
        &self,
        symbol: Symbol,
        _underlying_con_id: i64,
    ) -> TransportResult<Vec<OptionChainParams>> {
        self.enter("sec_def_opt_params", symbol.as_str()).await?;
        Ok(self
            .state
            .lock()
            .chains
            .get(symbol.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn market_scanner(&self, subscription: &ScannerSubscription) -> TransportResult<Vec<ScannerRow>> {
        self.enter("market_scanner", &subscription.scan_code).await?;
        let rows = self
            .state
            .lock()
            .scanner_rows
            .get(&subscription.scan_code)
            .cloned()
            .unwrap_or_default();
        Ok(rows.into_iter().take(subscription.number_of_rows).collect())
    }

    async fn positions(&self) -> TransportResult<Vec<PositionRow>> {
        self.enter("positions", "").await?;
        self.state
            .lock()
            .positions
            .clone()
            .ok_or_else(|| TransportError::unsupported("mock: positions not supported"))
    }

    async fn all_open_orders(&self) -> TransportResult<Vec<OpenOrderRow>> {
        self.enter("all_open_orders", "").await?;
        Ok(self.state.lock().open_orders.clone())
    }

    async fn next_order_id(&self) -> TransportResult<i64> {
        self.enter("next_order_id", "").await?;
        let mut state = self.state.lock();
        let id = state.next_order_id;
        state.next_order_id += 1;
        Ok(id)
    }

    async fn place_order(
        &self,
        order_id: i64,
        instrument: &Instrument,
        ticket: &OrderTicket,
    ) -> TransportResult<()> {
        self.enter("place_order", &instrument.key()).await?;
        let status = {
            let mut state = self.state.lock();
            state.placed.push(RecordedOrder {
                order_id,
                instrument: instrument.clone(),
                ticket: ticket.clone(),
            });
            state.place_status.clone()
        };
        if let Some(status) = status {
            self.emit(TransportEvent::OrderStatus(OrderStatusEvent {
                order_id,
                status,
                remaining: ticket.quantity,
                ..Default::default()
            }));
        }
        Ok(())
    }

    async fn req_account_updates(&self, subscribe: bool, account_code: &str) -> TransportResult<()> {
        self.enter("req_account_updates", account_code).await?;
        if subscribe {
            let fieldsets = self.state.lock().account_fieldsets.clone();
            for fieldset in fieldsets {
                self.emit(TransportEvent::Fieldset(fieldset));
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.calls.push(MockCall {
            method: "disconnect",
            key: String::new(),
        });
        state.connected = false;
    }
}

/// How a mock port answers a raw TCP probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpBehavior {
    Accept,
    Refuse,
    /// Hang until the probe's timeout elapses.
    Hang,
}

struct MockPort {
    tcp: TcpBehavior,
    transport: Option<Arc<MockTransport>>,
}

/// Connector over a fixed set of mock ports. Unknown ports refuse.
#[derive(Default)]
pub struct MockConnector {
    ports: Mutex<FxHashMap<u16, MockPort>>,
    connects: Mutex<Vec<u16>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A port that accepts TCP and serves `transport`.
    pub fn with_port(self, port: u16, transport: Arc<MockTransport>) -> Self {
        self.ports.lock().insert(
            port,
            MockPort {
                tcp: TcpBehavior::Accept,
                transport: Some(transport),
            },
        );
        self
    }

    /// A port with the given TCP behavior and no session behind it.
    pub fn with_dead_port(self, port: u16, tcp: TcpBehavior) -> Self {
        self.ports.lock().insert(port, MockPort { tcp, transport: None });
        self
    }

    pub fn set_tcp(&self, port: u16, tcp: TcpBehavior) {
        if let Some(entry) = self.ports.lock().get_mut(&port) {
            entry.tcp = tcp;
        }
    }

    /// How many sessions were opened on `port`.
    pub fn connect_count(&self, port: u16) -> usize {
        self.connects.lock().iter().filter(|p| **p == port).count()
    }

    fn behavior(&self, port: u16) -> (TcpBehavior, Option<Arc<MockTransport>>) {
        match self.ports.lock().get(&port) {
            Some(entry) => (entry.tcp, entry.transport.clone()),
            None => (TcpBehavior::Refuse, None),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16, _client_id: i32) -> TransportResult<Arc<dyn Transport>> {
        match self.behavior(port) {
            (TcpBehavior::Accept, Some(transport)) => {
                self.connects.lock().push(port);
                transport.set_connected(true);
                Ok(transport as Arc<dyn Transport>)
            }
            (TcpBehavior::Hang, _) => Err(TransportError::timeout(format!(
                "mock: connect to {host}:{port} timed out"
            ))),
            _ => Err(TransportError::refused(format!(
                "mock: connection refused by {host}:{port}"
            ))),
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16, timeout: Duration) -> TransportResult<()> {
        match self.behavior(port).0 {
            TcpBehavior::Accept => Ok(()),
            TcpBehavior::Refuse => Err(TransportError::refused(format!(
                "mock: connection refused by {host}:{port}"
            ))),
            TcpBehavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::timeout(format!(
                    "mock: tcp connect to {host}:{port} timed out"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aapl() -> Symbol {
        Symbol::new("AAPL")
    }

    #[tokio::test]
    async fn builder_basic() {
        let mock = MockTransport::builder()
            .with_quote(aapl(), 189_50, 189_60)
            .build();

        let quote = mock
            .market_data_snapshot(&Instrument::Stock(aapl()))
            .await
            .unwrap();
        assert_eq!(quote.bid, Some(Price(189_50)));
        assert_eq!(mock.call_count("market_data_snapshot"), 1);
    }

    #[tokio::test]
    async fn entitlement_gate() {
        let mock = MockTransport::builder()
            .with_quote(aapl(), 100_00, 100_10)
            .entitled_to(&[MarketDataType::Delayed])
            .build();
        let stock = Instrument::Stock(aapl());

        let err = mock.market_data_snapshot(&stock).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Subscription);

        mock.set_market_data_type(MarketDataType::Delayed).await.unwrap();
        assert!(mock.market_data_snapshot(&stock).await.is_ok());
    }

    #[tokio::test]
    async fn queued_failures_come_first() {
        let mock = MockTransport::builder()
            .fail_next("current_time", "", TransportError::timeout("slow"))
            .build();
        assert!(mock.current_time().await.is_err());
        assert!(mock.current_time().await.is_ok());
    }

    #[tokio::test]
    async fn not_connected_errors() {
        let mock = MockTransport::builder().build();
        mock.disconnect().await;
        let err = mock.current_time().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn account_updates_emit_fieldsets() {
        let mock = MockTransport::builder()
            .with_account_fieldsets(vec![Fieldset::from_strs(&["54", "1", "DU1"])])
            .build();
        let mut rx = mock.events();
        mock.req_account_updates(true, "DU1").await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Fieldset(f) => assert_eq!(f.fields()[0], "54"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connector_probe_behaviors() {
        let connector = MockConnector::new()
            .with_port(4002, MockTransport::builder().build())
            .with_dead_port(7497, TcpBehavior::Refuse);

        assert!(connector.probe_tcp("127.0.0.1", 4002, Duration::from_millis(10)).await.is_ok());
        let err = connector
            .probe_tcp("127.0.0.1", 7497, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::ConnectionRefused);
        assert!(connector.connect("127.0.0.1", 7497, 1).await.is_err());
        assert!(connector.connect("127.0.0.1", 4002, 1).await.is_ok());
        assert_eq!(connector.connect_count(4002), 1);
    }
}
