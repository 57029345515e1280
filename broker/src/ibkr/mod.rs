//! Interactive Brokers (TWS / IB Gateway) transport over the `ibapi` blocking client.
//!
//! Each blocking call runs on tokio's blocking pool. Errors are classified
//! here, once, into [`ErrorKind`](crate::ErrorKind); nothing above this module
//! looks at message text.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Datelike;
use ibapi::accounts::types::AccountGroup;
use ibapi::accounts::{AccountSummaryResult, PositionUpdate};
use ibapi::client::blocking::Client;
use ibapi::contracts::{Contract, SecurityType};
use ibapi::market_data::realtime::{TickType, TickTypes};
use ibapi::orders::order_builder::{limit_order, market_order};
use ibapi::orders::{Action as IbAction, Orders, PlaceOrder};
use log::{debug, info, warn};
use optiondesk::{Instrument, OptionRight, Price, Symbol};
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::types::*;
use crate::{Connector, Transport, TransportResult};

/// Opens [`IbkrTransport`] sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct IbkrConnector;

#[async_trait]
impl Connector for IbkrConnector {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> TransportResult<Arc<dyn Transport>> {
        let address = format!("{host}:{port}");
        info!("Connecting to IB Gateway at {address}...");
        let target = address.clone();
        let client = tokio::task::spawn_blocking(move || Client::connect(&target, client_id))
            .await
            .map_err(|e| TransportError::new(crate::ErrorKind::Other, format!("connect worker failed: {e}")))?
            .map_err(|e| TransportError::from_message(format!("failed to connect to {address}: {e}")))?;
        info!("Connected to {address} (client_id={client_id})");

        let (events, _) = broadcast::channel(1024);
        Ok(Arc::new(IbkrTransport {
            client: Arc::new(client),
            address,
            events,
            connected: AtomicBool::new(true),
        }))
    }
}

/// One connected TWS/Gateway session.
pub struct IbkrTransport {
    client: Arc<Client>,
    address: String,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl IbkrTransport {
    /// Run `f` against the client on the blocking pool.
    async fn blocking<T, F>(&self, what: &'static str, f: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, TransportError> + Send + 'static,
    {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::disconnected(format!(
                "{what}: session to {} is closed",
                self.address
            )));
        }
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| TransportError::new(crate::ErrorKind::Other, format!("{what}: worker failed: {e}")))?
    }
}

fn ib_error(what: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::from_message(format!("{what}: {err}"))
}

fn ib_contract(instrument: &Instrument) -> Contract {
    match instrument {
        Instrument::Stock(symbol) => Contract::stock(symbol.as_str()).build(),
        Instrument::Option(contract) => {
            let builder = match contract.right {
                OptionRight::Call => Contract::call(contract.symbol.as_str()),
                OptionRight::Put => Contract::put(contract.symbol.as_str()),
            };
            let expiration = contract.expiration;
            builder
                .strike(contract.strike.as_f64())
                .expires_on(expiration.year() as _, expiration.month() as _, expiration.day() as _)
                .build()
        }
    }
}

#[async_trait]
impl Transport for IbkrTransport {
    async fn current_time(&self) -> TransportResult<i64> {
        self.blocking("current_time", |client| {
            client
                .server_time()
                .map(|t| t.unix_timestamp())
                .map_err(|e| ib_error("server time request failed", e))
        })
        .await
    }

    async fn set_market_data_type(&self, data_type: MarketDataType) -> TransportResult<()> {
        use ibapi::market_data::MarketDataType as IbType;
        let ib_type = match data_type {
            MarketDataType::Live => IbType::Realtime,
            MarketDataType::Frozen => IbType::Frozen,
            MarketDataType::Delayed => IbType::Delayed,
            MarketDataType::DelayedFrozen => IbType::DelayedFrozen,
        };
        self.blocking("set_market_data_type", move |client| {
            client
                .switch_market_data_type(ib_type)
                .map_err(|e| ib_error("market data type switch failed", e))
        })
        .await
    }

    async fn market_data_snapshot(&self, instrument: &Instrument) -> TransportResult<QuoteSnapshot> {
        let contract = ib_contract(instrument);
        let label = instrument.to_string();
        self.blocking("market_data_snapshot", move |client| {
            let subscription = client
                .market_data(&contract)
                .snapshot()
                .subscribe()
                .map_err(|e| ib_error("market data request failed", e))?;

            let mut quote = QuoteSnapshot::default();
            for tick in subscription {
                match tick {
                    TickTypes::Price(t) => apply_price(&mut quote, &t.tick_type, t.price),
                    TickTypes::PriceSize(t) => apply_price(&mut quote, &t.price_tick_type, t.price),
                    TickTypes::Size(t) if matches!(t.tick_type, TickType::Volume) => {
                        quote.volume = Some(t.size)
                    }
                    TickTypes::Notice(notice) => {
                        // Entitlement denials arrive as notices on the subscription.
                        if notice.code < 2000 {
                            return Err(TransportError::from_broker(notice.code, notice.message));
                        }
                    }
                    TickTypes::SnapshotEnd => break,
                    _ => {}
                }
            }
            debug!("{label}: {quote:?}");
            Ok(quote)
        })
        .await
    }

    async fn historical_bars(
        &self,
        instrument: &Instrument,
        _request: &HistoricalRequest,
    ) -> TransportResult<Vec<Bar>> {
        // TODO: wire ibapi's historical_data once its duration/bar-size types settle across 2.x.
        Err(TransportError::unsupported(format!(
            "historical bars for {instrument} are not implemented on this session"
        )))
    }

    async fn contract_details(&self, instrument: &Instrument) -> TransportResult<Vec<ContractDetails>> {
        let contract = ib_contract(instrument);
        let sec_type = instrument.sec_type();
        self.blocking("contract_details", move |client| {
            let details = client
                .contract_details(&contract)
                .map_err(|e| ib_error("contract details request failed", e))?;
            Ok(details
                .into_iter()
                .map(|d| ContractDetails {
                    con_id: d.contract.contract_id as i64,
                    symbol: d.contract.symbol.to_string(),
                    sec_type: sec_type.to_string(),
                    exchange: d.contract.exchange.to_string(),
                    primary_exchange: d.contract.primary_exchange.to_string(),
                    currency: d.contract.currency.to_string(),
                    long_name: d.long_name.to_string(),
                })
                .collect())
        })
        .await
    }

    async fn sec_def_opt_params(
        &self,
        symbol: Symbol,
        underlying_con_id: i64,
    ) -> TransportResult<Vec<OptionChainParams>> {
        self.blocking("sec_def_opt_params", move |client| {
            let subscription = client
                .option_chain(symbol.as_str(), "", SecurityType::Stock, underlying_con_id as i32)
                .map_err(|e| ib_error("option chain request failed", e))?;
            Ok(subscription
                .into_iter()
                .map(|chain| OptionChainParams {
                    exchange: chain.exchange.to_string(),
                    underlying_con_id: chain.underlying_contract_id as i64,
                    trading_class: chain.trading_class.to_string(),
                    multiplier: chain.multiplier.to_string(),
                    expirations: chain.expirations.clone(),
                    strikes: chain.strikes.clone(),
                })
                .collect())
        })
        .await
    }

    async fn market_scanner(&self, subscription: &ScannerSubscription) -> TransportResult<Vec<ScannerRow>> {
        // TODO: map ScannerSubscription onto ibapi's scanner_subscription request.
        Err(TransportError::unsupported(format!(
            "market scanner '{}' is not implemented on this session",
            subscription.scan_code
        )))
    }

    async fn positions(&self) -> TransportResult<Vec<PositionRow>> {
        self.blocking("positions", |client| {
            let subscription = client
                .positions()
                .map_err(|e| ib_error("failed to request positions", e))?;

            let mut rows = Vec::new();
            for update in subscription {
                match update {
                    PositionUpdate::Position(pos) => {
                        let expiration = pos.contract.last_trade_date_or_contract_month.to_string();
                        let right = pos.contract.right.to_string();
                        rows.push(PositionRow {
                            account: pos.account.to_string(),
                            con_id: pos.contract.contract_id as i64,
                            symbol: pos.contract.symbol.to_string(),
                            sec_type: format!("{:?}", pos.contract.security_type),
                            expiration: (!expiration.is_empty()).then_some(expiration),
                            strike: (pos.contract.strike > 0.0).then_some(pos.contract.strike),
                            right: (!right.is_empty()).then_some(right),
                            position: pos.position,
                            average_cost: pos.average_cost,
                        });
                    }
                    PositionUpdate::PositionEnd => break,
                }
            }
            info!("Fetched {} positions", rows.len());
            Ok(rows)
        })
        .await
    }

    async fn all_open_orders(&self) -> TransportResult<Vec<OpenOrderRow>> {
        self.blocking("all_open_orders", |client| {
            let subscription = client
                .all_open_orders()
                .map_err(|e| ib_error("open orders request failed", e))?;

            let mut rows: Vec<OpenOrderRow> = Vec::new();
            for item in subscription {
                match item {
                    Orders::OrderData(data) => rows.push(OpenOrderRow {
                        order_id: data.order_id as i64,
                        perm_id: Some(data.order.perm_id as i64),
                        client_id: Some(data.order.client_id),
                        symbol: data.contract.symbol.to_string(),
                        status: Some(data.order_state.status.to_string()),
                        ..Default::default()
                    }),
                    Orders::OrderStatus(status) => {
                        let order_id = status.order_id as i64;
                        if let Some(row) = rows.iter_mut().find(|r| r.order_id == order_id) {
                            row.status = Some(status.status.to_string());
                            row.filled = Some(status.filled);
                            row.remaining = Some(status.remaining);
                            row.avg_fill_price = Some(status.average_fill_price);
                            row.last_fill_price = Some(status.last_fill_price);
                            row.why_held = Some(status.why_held.to_string());
                        }
                    }
                    _ => {}
                }
            }
            Ok(rows)
        })
        .await
    }

    async fn next_order_id(&self) -> TransportResult<i64> {
        self.blocking("next_order_id", |client| {
            client
                .next_valid_order_id()
                .map(|id| id as i64)
                .map_err(|e| ib_error("failed to get order id", e))
        })
        .await
    }

    async fn place_order(
        &self,
        order_id: i64,
        instrument: &Instrument,
        ticket: &OrderTicket,
    ) -> TransportResult<()> {
        let contract = ib_contract(instrument);
        let action = match ticket.side {
            BrokerSide::Buy => IbAction::Buy,
            BrokerSide::Sell => IbAction::Sell,
        };
        let mut order = match ticket.order_type {
            BrokerOrderType::Limit(price) => limit_order(action, ticket.quantity, price.as_f64()),
            BrokerOrderType::Market => market_order(action, ticket.quantity),
        };
        if let Some(account) = &ticket.account {
            order.account = account.clone();
        }
        if let Some(order_ref) = &ticket.order_ref {
            order.order_ref = order_ref.clone();
        }
        info!(
            "Submitting: {:?} {} {} (id={order_id})",
            ticket.side, ticket.quantity, instrument
        );

        // The status subscription outlives this call: a dedicated thread keeps
        // reading it and forwards every status onto the event channel.
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let (placed_tx, placed_rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let subscription = match client.place_order(order_id as i32, &contract, &order) {
                Ok(subscription) => {
                    let _ = placed_tx.send(Ok(()));
                    subscription
                }
                Err(e) => {
                    let _ = placed_tx.send(Err(ib_error(&format!("failed to place order {order_id}"), e)));
                    return;
                }
            };
            for response in subscription {
                match response {
                    PlaceOrder::OrderStatus(s) => {
                        let _ = events.send(TransportEvent::OrderStatus(OrderStatusEvent {
                            order_id: s.order_id as i64,
                            status: s.status.to_string(),
                            filled: s.filled,
                            remaining: s.remaining,
                            avg_fill_price: s.average_fill_price,
                            last_fill_price: s.last_fill_price,
                            perm_id: s.perm_id as i64,
                            client_id: s.client_id,
                            why_held: s.why_held.to_string(),
                        }));
                    }
                    PlaceOrder::Message(notice) => {
                        if notice.code < 0 || notice.code >= 2000 {
                            debug!("Order {order_id} notice {}: {}", notice.code, notice.message);
                        } else {
                            warn!("Order {order_id} error {}: {}", notice.code, notice.message);
                        }
                    }
                    _ => {}
                }
            }
        });

        placed_rx
            .await
            .map_err(|_| TransportError::disconnected(format!("order {order_id}: placement thread exited")))?
    }

    /// The blocking client has no raw account stream, so one subscribe call
    /// replays the account summary as account-value fieldsets followed by a
    /// download-end marker.
    async fn req_account_updates(&self, subscribe: bool, account_code: &str) -> TransportResult<()> {
        if !subscribe {
            return Ok(());
        }
        let account = account_code.to_string();
        let records = self
            .blocking("req_account_updates", move |client| {
                let group = AccountGroup("All".to_string());
                let tags = &[
                    "NetLiquidation",
                    "TotalCashValue",
                    "BuyingPower",
                    "AvailableFunds",
                    "ExcessLiquidity",
                    "GrossPositionValue",
                ];
                let subscription = client
                    .account_summary(&group, tags)
                    .map_err(|e| ib_error("failed to request account summary", e))?;

                let mut records = Vec::new();
                let mut last_account = account.clone();
                for result in subscription {
                    match result {
                        AccountSummaryResult::Summary(s) => {
                            if !account.is_empty() && s.account != account {
                                continue;
                            }
                            last_account = s.account.to_string();
                            records.push(Fieldset(vec![
                                "6".to_string(),
                                "2".to_string(),
                                s.tag.to_string(),
                                s.value.to_string(),
                                s.currency.to_string(),
                                s.account.to_string(),
                            ]));
                        }
                        AccountSummaryResult::End => break,
                    }
                }
                records.push(Fieldset(vec!["54".to_string(), "1".to_string(), last_account]));
                Ok(records)
            })
            .await?;

        for record in records {
            let _ = self.events.send(TransportEvent::Fieldset(record));
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("Closed session to {}", self.address);
        }
    }
}

fn apply_price(quote: &mut QuoteSnapshot, tick_type: &TickType, price: f64) {
    let price = Price::from_tick(price);
    match tick_type {
        TickType::Bid | TickType::DelayedBid => quote.bid = price,
        TickType::Ask | TickType::DelayedAsk => quote.ask = price,
        TickType::Last | TickType::DelayedLast => quote.last = price,
        TickType::Close | TickType::DelayedClose => quote.close = price,
        _ => {}
    }
}
