//! The gateway facade.
//!
//! Every broker-touching operation goes through the same path: readiness gate,
//! then [`with_retry`], then the [`Scheduler`], then the active session's
//! transport under an RPC deadline. Connectivity failures that survive the
//! retries open the cooldown and schedule a throttled recovery probe.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use optiondesk::{Instrument, OptionContract, Price, Symbol, ValidationError};
use optiondesk_broker::{
    Bar, BrokerOrderType, BrokerSide, Connector, ErrorKind, HistoricalRequest, OptionChainParams,
    OrderTicket, QuoteSnapshot, ScannerRow, ScannerSubscription, TransportError, TransportEvent,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::account::{
    AccountSnapshot, AccountStore, PositionSnapshot, join_positions, now_ms,
    positions_from_portfolio,
};
use crate::chain::select_contracts;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectivityStatus, DetectedMode, EventSink, Session};
use crate::entitlement::{DataClass, EntitlementMode, EntitlementSettings, EntitlementSnapshot, EntitlementState};
use crate::error::{ConfigError, Fetched, GatewayError, SubmitError, Unavailable, UnavailableReason};
use crate::inflight::InFlight;
use crate::orders::{OrderStatusSnapshot, OrderTracker, PENDING_SUBMIT};
use crate::resilience::{CircuitBreaker, CooldownStatus, LogThrottle, RetryPolicy, rpc, with_retry};
use crate::scanner::{ScanBroker, ScanRequest, ScanResult, Scanner, ScannerFallback, ScannerSettings, ScannerStatus};
use crate::scheduler::{Channel, Scheduler, SchedulerSettings};

/// A priced snapshot for one instrument.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub instrument: String,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    pub last: Option<Price>,
    pub close: Option<Price>,
    pub volume: Option<f64>,
    pub mode: EntitlementMode,
    pub delayed: bool,
    pub received_at: i64,
}

impl Quote {
    fn new(instrument: &Instrument, snapshot: QuoteSnapshot, mode: EntitlementMode) -> Self {
        Self {
            instrument: instrument.key(),
            bid: snapshot.bid,
            ask: snapshot.ask,
            last: snapshot.last,
            close: snapshot.close,
            volume: snapshot.volume,
            mode,
            delayed: mode != EntitlementMode::Live,
            received_at: now_ms(),
        }
    }

    /// Midpoint when both sides are quoted, else last, else close.
    pub fn reference_price(&self) -> Option<Price> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(Price((bid.0 + ask.0) / 2)),
            _ => self.last.or(self.close),
        }
    }
}

/// An order to place on a paper account.
#[derive(Clone, Debug, PartialEq)]
pub struct PaperOrderRequest {
    /// Caller's id for the order. Generated when absent.
    pub local_order_id: Option<String>,
    pub instrument: Instrument,
    pub side: BrokerSide,
    pub quantity: f64,
    pub order_type: BrokerOrderType,
    pub time_in_force: String,
    pub account: Option<String>,
}

impl PaperOrderRequest {
    pub fn market(instrument: Instrument, side: BrokerSide, quantity: f64) -> Self {
        Self {
            local_order_id: None,
            instrument,
            side,
            quantity,
            order_type: BrokerOrderType::Market,
            time_in_force: "DAY".to_string(),
            account: None,
        }
    }

    pub fn limit(instrument: Instrument, side: BrokerSide, quantity: f64, price: Price) -> Self {
        Self {
            order_type: BrokerOrderType::Limit(price),
            ..Self::market(instrument, side, quantity)
        }
    }

    pub fn with_local_id(mut self, local_order_id: impl Into<String>) -> Self {
        self.local_order_id = Some(local_order_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.instrument.validate()?;
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(ValidationError::NonPositiveQuantity);
        }
        if let BrokerOrderType::Limit(price) = self.order_type {
            if !price.is_positive() {
                return Err(ValidationError::NonPositivePrice);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub local_order_id: String,
    pub broker_order_id: i64,
    pub status: String,
}

/// Everything an operator dashboard needs in one read.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub enabled: bool,
    pub active_port: Option<u16>,
    pub detected_mode: DetectedMode,
    pub sessions: Vec<u16>,
    pub connectivity: Option<ConnectivityStatus>,
    pub cooldown: Option<CooldownStatus>,
    pub queue_depth: usize,
    pub active_requests: usize,
    pub backlogged: bool,
    pub entitlement: EntitlementSnapshot,
    pub scanner: ScannerStatus,
    pub tracked_orders: usize,
    pub account_download_complete: bool,
}

/// What a readiness check is about.
#[derive(Clone, Copy, Debug)]
enum Scope<'a> {
    Any,
    Symbol(&'a str),
    OptionContract(&'a str),
}

/// Routes pushed session events into the stores.
struct EventRouter {
    orders: Arc<OrderTracker>,
    account: Arc<AccountStore>,
}

impl EventSink for EventRouter {
    fn on_event(&self, port: u16, event: TransportEvent) {
        match event {
            TransportEvent::OrderStatus(status) => {
                if !self.orders.apply_event(&status) {
                    trace!("port {port}: status for untracked order {}", status.order_id);
                }
            }
            TransportEvent::Fieldset(fieldset) => {
                self.account.apply(&fieldset);
            }
        }
    }
}

struct GatewayInner {
    config: Mutex<Arc<Config>>,
    scheduler: Scheduler,
    breaker: CircuitBreaker,
    log_throttle: LogThrottle,
    entitlement: EntitlementState,
    connection: ConnectionManager,
    scanner: Arc<Scanner>,
    account: Arc<AccountStore>,
    orders: Arc<OrderTracker>,
    connectivity_flight: Arc<InFlight<(), ConnectivityStatus>>,
    positions_flight: Arc<InFlight<(), Vec<PositionSnapshot>>>,
    account_flight: Arc<InFlight<(), AccountSnapshot>>,
    order_poll_flight: Arc<InFlight<(), usize>>,
    account_cache: Mutex<Option<(Instant, AccountSnapshot)>>,
    chains: Mutex<FxHashMap<Symbol, (Instant, Vec<OptionChainParams>)>>,
    local_seq: AtomicU64,
    shut_down: AtomicBool,
}

pub struct GatewayBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    fallback: Option<Arc<dyn ScannerFallback>>,
}

impl GatewayBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn scanner_fallback(mut self, fallback: Arc<dyn ScannerFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Validate the config and start the scheduler. Needs a tokio runtime.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or_else(|| ConfigError::Invalid("no broker connector configured".into()))?;
        let config = self.config;

        let orders = Arc::new(OrderTracker::new());
        let account = Arc::new(AccountStore::new());
        let router = Arc::new(EventRouter {
            orders: Arc::clone(&orders),
            account: Arc::clone(&account),
        });

        let inner = GatewayInner {
            scheduler: Scheduler::new(SchedulerSettings::from(&config.scheduler)),
            breaker: CircuitBreaker::new(),
            log_throttle: LogThrottle::new(Duration::from_millis(config.resilience.log_throttle_ms)),
            entitlement: EntitlementState::new(EntitlementSettings::from(&config.market_data)),
            connection: ConnectionManager::new(connector, router),
            scanner: Arc::new(Scanner::new(self.fallback)),
            account,
            orders,
            connectivity_flight: InFlight::new(),
            positions_flight: InFlight::new(),
            account_flight: InFlight::new(),
            order_poll_flight: InFlight::new(),
            account_cache: Mutex::new(None),
            chains: Mutex::new(FxHashMap::default()),
            local_seq: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config: Mutex::new(Arc::new(config)),
        };
        Ok(Gateway {
            inner: Arc::new(inner),
        })
    }
}

/// Cheaply clonable handle to one broker gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            connector: None,
            fallback: None,
        }
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.inner.config.lock())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config().resilience)
    }

    // ------------------------------------------------------------------
    // Call path
    // ------------------------------------------------------------------

    /// Run one transport call on the active session through retry and the
    /// scheduler.
    async fn call<T, F, Fut>(
        &self,
        channel: Channel,
        operation: &'static str,
        policy: RetryPolicy,
        run: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.inner.breaker.check()?;
        let config = self.config();
        let timeout = config.connection.rpc_timeout();
        let backlog = config.scheduler.backlog_threshold;
        let this = self;
        let run = &run;

        let result = with_retry(
            &policy,
            operation,
            GatewayError::is_connectivity,
            || this.retry_gate(backlog),
            move || async move {
                let session = this.session().await?;
                let port = session.port;
                let outcome = this
                    .inner
                    .scheduler
                    .enqueue(channel, operation, || rpc(timeout, operation, run(session)))
                    .await
                    .and_then(|result| result);
                if let Err(err) = &outcome {
                    if err.kind() == Some(ErrorKind::Disconnected) {
                        this.inner.connection.pool().drop_session(port).await;
                        this.inner.connection.invalidate();
                    }
                }
                outcome
            },
        )
        .await;

        if let Err(err) = &result {
            if err.is_connectivity() {
                self.open_cooldown(&format!("{operation}: {err}"));
            } else if matches!(err.kind(), Some(ErrorKind::Other | ErrorKind::Rejected)) {
                self.inner
                    .log_throttle
                    .warn(&format!("{operation}:{}", err.kind().map_or("", |k| k.label())), || {
                        format!("{operation} failed: {err}")
                    });
            }
        }
        result
    }

    fn retry_gate(&self, backlog: usize) -> Result<(), GatewayError> {
        self.inner.breaker.check()?;
        if self.inner.scheduler.is_backlogged(backlog) {
            return Err(GatewayError::Backlogged);
        }
        Ok(())
    }

    /// The active session, probing ports when there is none.
    async fn session(&self) -> Result<Arc<Session>, GatewayError> {
        if let Some(session) = self.inner.connection.pool().active() {
            return Ok(session);
        }
        let status = self.check_connectivity().await;
        match self.inner.connection.pool().active() {
            Some(session) if status.reachable => Ok(session),
            _ => Err(GatewayError::Unreachable(status.message)),
        }
    }

    fn open_cooldown(&self, reason: &str) {
        let config = self.config();
        let until = self.inner.breaker.open(config.resilience.cooldown(), reason);
        self.inner.connection.invalidate();
        self.inner.log_throttle.warn("cooldown", || {
            format!(
                "broker requests paused for {}ms: {reason}",
                config.resilience.cooldown_ms
            )
        });
        if !self
            .inner
            .breaker
            .claim_recovery_probe(config.resilience.recovery_throttle())
        {
            return;
        }
        let weak: Weak<GatewayInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.shut_down.load(Ordering::Acquire) || inner.breaker.active().is_some() {
                return;
            }
            let gateway = Gateway { inner };
            let status = gateway.probe_now().await;
            info!(
                "recovery probe: {}",
                if status.reachable { "broker reachable" } else { "still unreachable" }
            );
        });
    }

    fn readiness_for(&self, scope: Scope<'_>) -> Result<(), Unavailable> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(Unavailable::new(
                UnavailableReason::QueueCleared,
                "gateway is shut down",
            ));
        }
        let config = self.config();
        if !config.connection.enabled {
            return Err(Unavailable::new(
                UnavailableReason::Disabled,
                "broker integration disabled",
            ));
        }
        if let Some(cooldown) = self.inner.breaker.status() {
            return Err(Unavailable::new(
                UnavailableReason::CoolingDown,
                format!("cooling down for {}ms: {}", cooldown.remaining_ms, cooldown.reason),
            ));
        }
        match scope {
            Scope::Any => {}
            Scope::Symbol(symbol) => {
                if let Some((remaining, reason)) = self.inner.entitlement.symbol_blocked(symbol) {
                    return Err(Unavailable::new(
                        UnavailableReason::SymbolBackoff,
                        format!("{symbol} backed off for {}ms: {reason}", remaining.as_millis()),
                    ));
                }
            }
            Scope::OptionContract(key) => {
                if let Some((remaining, reason)) = self.inner.entitlement.options_blocked() {
                    return Err(Unavailable::new(
                        UnavailableReason::OptionBackoff,
                        format!("option quotes blocked for {}ms: {reason}", remaining.as_millis()),
                    ));
                }
                if let Some(reason) = self.inner.entitlement.invalid_reason(key) {
                    return Err(Unavailable::new(
                        UnavailableReason::InvalidContract,
                        format!("{key}: {reason}"),
                    ));
                }
            }
        }
        if self
            .inner
            .scheduler
            .is_backlogged(config.scheduler.backlog_threshold)
        {
            return Err(Unavailable::new(
                UnavailableReason::QueueBacklogged,
                format!(
                    "{} requests pending or running",
                    self.inner.scheduler.depth() + self.inner.scheduler.active()
                ),
            ));
        }
        Ok(())
    }

    /// Whether broker requests may be issued right now.
    pub fn readiness(&self) -> Result<(), Unavailable> {
        self.readiness_for(Scope::Any)
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Connectivity status, from cache when fresh. Never probes while the
    /// cooldown is open.
    pub async fn check_connectivity(&self) -> ConnectivityStatus {
        let config = self.config();
        if !config.connection.enabled {
            return ConnectivityStatus::disabled(&config.connection);
        }
        if let Some(cooldown) = self.inner.breaker.active() {
            return ConnectivityStatus::cooling_down(&config.connection, &cooldown.reason);
        }
        if let Some(status) = self
            .inner
            .connection
            .cached_status(config.connection.connectivity_cache_ttl())
        {
            return status;
        }
        self.probe_now().await
    }

    async fn probe_now(&self) -> ConnectivityStatus {
        let this = self.clone();
        let shared = self
            .inner
            .connectivity_flight
            .run((), move || async move { Ok(this.run_probe().await) })
            .await;
        shared.unwrap_or_else(|e| {
            ConnectivityStatus::unreachable(&self.config().connection, Vec::new(), e.to_string())
        })
    }

    async fn run_probe(&self) -> ConnectivityStatus {
        let config = self.config();
        let status = self
            .inner
            .connection
            .probe(&config.connection, &self.inner.scheduler)
            .await;
        if status.reachable {
            self.inner.breaker.clear();
        } else if status.enabled {
            self.open_cooldown(&status.message);
        }
        self.inner.connection.store_status(status.clone());
        status
    }

    // ------------------------------------------------------------------
    // Market data
    // ------------------------------------------------------------------

    /// Request a snapshot, degrading the market data class on entitlement
    /// denials until one is accepted or none are left.
    async fn fetch_snapshot(&self, instrument: &Instrument, class: DataClass) -> Fetched<Quote> {
        let policy = self.retry_policy();
        let mut mode = self.inner.entitlement.mode(class);
        loop {
            let data_type = mode.market_data_type();
            let result = self
                .call(Channel::Quote, "market_data_snapshot", policy, move |session| async move {
                    session.ensure_market_data_type(data_type).await?;
                    session.transport().market_data_snapshot(instrument).await
                })
                .await;
            match result {
                Ok(snapshot) if snapshot.has_price() => {
                    return Ok(Quote::new(instrument, snapshot, mode));
                }
                Ok(_) => {
                    return Err(Unavailable::new(
                        UnavailableReason::NoData,
                        format!("no prices for {instrument} in {mode:?} mode"),
                    ));
                }
                Err(err) if err.kind() == Some(ErrorKind::Subscription) => {
                    match self.inner.entitlement.downgrade(class, mode) {
                        Some(next) => {
                            debug!("{instrument}: {mode:?} denied, retrying as {next:?}");
                            mode = next;
                        }
                        None => {
                            let reason = format!("not entitled to market data for {instrument}: {err}");
                            match class {
                                DataClass::Quote => self
                                    .inner
                                    .entitlement
                                    .block_symbol(instrument.symbol().as_str(), &reason),
                                DataClass::Option => self.inner.entitlement.block_options(&reason),
                            }
                            return Err(Unavailable::new(UnavailableReason::Entitlement, reason));
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Snapshot quote for a stock.
    pub async fn get_quote(&self, symbol: Symbol) -> Fetched<Quote> {
        if symbol.is_empty() {
            return Err(Unavailable::new(
                UnavailableReason::InvalidRequest,
                ValidationError::EmptySymbol.to_string(),
            ));
        }
        self.readiness_for(Scope::Symbol(symbol.as_str()))?;
        let instrument = Instrument::Stock(symbol);
        let result = self.fetch_snapshot(&instrument, DataClass::Quote).await;
        if let Err(unavailable) = &result {
            if matches!(
                unavailable.reason,
                UnavailableReason::NoData
                    | UnavailableReason::InvalidContract
                    | UnavailableReason::Broker
                    | UnavailableReason::Unsupported
            ) {
                self.inner
                    .entitlement
                    .block_symbol(symbol.as_str(), &unavailable.message);
            }
        }
        result
    }

    /// Snapshot quote for one option contract.
    pub async fn get_option_quote(&self, contract: OptionContract) -> Fetched<Quote> {
        let instrument = Instrument::Option(contract);
        instrument.validate().map_err(|e| {
            Unavailable::new(UnavailableReason::InvalidRequest, e.to_string())
        })?;
        let key = instrument.key();
        self.readiness_for(Scope::OptionContract(&key))?;
        let result = self.fetch_snapshot(&instrument, DataClass::Option).await;
        if let Err(unavailable) = &result {
            if unavailable.reason == UnavailableReason::InvalidContract {
                self.inner.entitlement.mark_invalid(&key, &unavailable.message);
            }
        }
        result
    }

    /// The last `count` daily bars, oldest first.
    pub async fn get_recent_daily_bars(&self, symbol: Symbol, count: usize) -> Fetched<Vec<Bar>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.readiness_for(Scope::Any)?;
        // Calendar days, so ask for enough to cover weekends and holidays.
        let days = count.saturating_mul(2).max(5).min(u32::MAX as usize) as u32;
        let request = HistoricalRequest::daily(days);
        let instrument = Instrument::Stock(symbol);
        let (request, instrument) = (&request, &instrument);
        let mut bars = self
            .call(Channel::Historical, "historical_bars", self.retry_policy(), move |session| async move {
                session.transport().historical_bars(instrument, request).await
            })
            .await?;
        if bars.is_empty() {
            return Err(Unavailable::new(
                UnavailableReason::NoData,
                format!("no daily bars for {symbol}"),
            ));
        }
        bars.sort_by_key(|bar| bar.time);
        let skip = bars.len().saturating_sub(count);
        Ok(bars.split_off(skip))
    }

    async fn option_chain(&self, symbol: Symbol) -> Fetched<Vec<OptionChainParams>> {
        let config = self.config();
        let ttl = Duration::from_millis(config.options.chain_cache_ttl_ms);
        let cached = self
            .inner
            .chains
            .lock()
            .get(&symbol)
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, params)| params.clone());
        if let Some(params) = cached {
            return Ok(params);
        }

        let policy = self.retry_policy();
        let details = self
            .call(Channel::OptionChain, "contract_details", policy, move |session| async move {
                session
                    .transport()
                    .contract_details(&Instrument::Stock(symbol))
                    .await
            })
            .await?;
        let con_id = details
            .iter()
            .find(|d| d.con_id > 0)
            .map(|d| d.con_id)
            .ok_or_else(|| {
                Unavailable::new(UnavailableReason::NoData, format!("no contract for {symbol}"))
            })?;
        let params = self
            .call(Channel::OptionChain, "sec_def_opt_params", policy, move |session| async move {
                session.transport().sec_def_opt_params(symbol, con_id).await
            })
            .await?;
        if params.is_empty() {
            return Err(Unavailable::new(
                UnavailableReason::NoData,
                format!("no option chain for {symbol}"),
            ));
        }
        self.inner
            .chains
            .lock()
            .insert(symbol, (Instant::now(), params.clone()));
        Ok(params)
    }

    /// Contracts near `reference_price` expiring in `[dte_min, dte_max]` days.
    pub async fn get_option_contracts(
        &self,
        symbol: Symbol,
        reference_price: Price,
        dte_min: u32,
        dte_max: u32,
    ) -> Fetched<Vec<OptionContract>> {
        if !reference_price.is_positive() || dte_min > dte_max {
            return Err(Unavailable::new(
                UnavailableReason::InvalidRequest,
                format!("bad option window: price {reference_price}, dte {dte_min}..={dte_max}"),
            ));
        }
        self.readiness_for(Scope::Any)?;
        let params = self.option_chain(symbol).await?;
        let config = self.config();
        let chain = params
            .iter()
            .find(|p| p.exchange.eq_ignore_ascii_case(&config.options.exchange))
            .or_else(|| params.first())
            .ok_or_else(|| {
                Unavailable::new(UnavailableReason::NoData, format!("no option chain for {symbol}"))
            })?;
        let today = chrono::Utc::now().date_naive();
        let entitlement = &self.inner.entitlement;
        Ok(select_contracts(
            symbol,
            chain,
            reference_price,
            today,
            i64::from(dte_min)..=i64::from(dte_max),
            config.options.strike_window,
            |contract| entitlement.invalid_reason(&contract.key()).is_none(),
        ))
    }

    // ------------------------------------------------------------------
    // Scanner
    // ------------------------------------------------------------------

    /// Scanner symbols plus where they came from.
    pub async fn get_scanner_symbols_with_source(&self, request: &ScanRequest) -> ScanResult {
        let config = self.config();
        let normalized = request.normalize(&config.scanner);
        let broker: Arc<dyn ScanBroker> = Arc::new(GatewayScanBroker(self.clone()));
        self.inner
            .scanner
            .scan(broker, ScannerSettings::from(&config.scanner), normalized)
            .await
    }

    // ------------------------------------------------------------------
    // Account and positions
    // ------------------------------------------------------------------

    /// Subscribe the active session to account updates once.
    async fn ensure_account_updates(&self) -> Result<(), GatewayError> {
        if self
            .inner
            .connection
            .pool()
            .active()
            .is_some_and(|session| session.account_subscribed())
        {
            return Ok(());
        }
        let config = self.config();
        let account_code = config.connection.account_code.as_str();
        self.call(Channel::Account, "req_account_updates", self.retry_policy(), move |session| async move {
            if session.account_subscribed() {
                return Ok(());
            }
            session
                .transport()
                .req_account_updates(true, account_code)
                .await?;
            session.set_account_subscribed(true);
            Ok::<(), TransportError>(())
        })
        .await
    }

    /// Open positions with portfolio marks.
    pub async fn get_positions_snapshot(&self) -> Fetched<Vec<PositionSnapshot>> {
        self.readiness_for(Scope::Any)?;
        let this = self.clone();
        self.inner
            .positions_flight
            .run((), move || async move { this.load_positions().await })
            .await
    }

    async fn load_positions(&self) -> Fetched<Vec<PositionSnapshot>> {
        if let Err(err) = self.ensure_account_updates().await {
            if err.is_connectivity() || matches!(err, GatewayError::CoolingDown(_)) {
                return Err(err.into());
            }
            debug!("account updates unavailable: {err}");
        }
        let config = self.config();
        let account_code = config.connection.account_code.as_str();
        let rows = self
            .call(Channel::Positions, "positions", self.retry_policy(), |session| async move {
                session.transport().positions().await
            })
            .await;
        match rows {
            Ok(rows) => {
                let rows: Vec<_> = rows
                    .into_iter()
                    .filter(|row| account_code.is_empty() || row.account == account_code)
                    .collect();
                Ok(join_positions(&rows, &self.inner.account.portfolio_map()))
            }
            Err(err) if err.kind() == Some(ErrorKind::Unsupported) => {
                debug!("positions unsupported, using portfolio values");
                let wait = Duration::from_millis(config.account.download_wait_ms);
                if !self.inner.account.wait_for_download(wait).await {
                    debug!("account download incomplete after {}ms", wait.as_millis());
                }
                Ok(positions_from_portfolio(&self.inner.account.portfolio(account_code)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Account values, cached for the configured TTL.
    pub async fn get_account_snapshot(&self) -> Fetched<AccountSnapshot> {
        let config = self.config();
        let ttl = Duration::from_millis(config.account.snapshot_ttl_ms);
        let cached = self
            .inner
            .account_cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, snapshot)| snapshot.clone());
        if let Some(snapshot) = cached {
            return Ok(snapshot);
        }
        self.readiness_for(Scope::Any)?;
        let this = self.clone();
        self.inner
            .account_flight
            .run((), move || async move { this.load_account().await })
            .await
    }

    async fn load_account(&self) -> Fetched<AccountSnapshot> {
        self.ensure_account_updates().await?;
        let config = self.config();
        let wait = Duration::from_millis(config.account.download_wait_ms);
        self.inner.account.wait_for_download(wait).await;
        let snapshot = self.inner.account.snapshot(&config.connection.account_code);
        if snapshot.values.is_empty() {
            return Err(Unavailable::new(
                UnavailableReason::NoData,
                "no account values received",
            ));
        }
        *self.inner.account_cache.lock() = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    fn next_local_id(&self) -> String {
        let n = self.inner.local_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("od-{}-{n}", now_ms())
    }

    /// Place an order on the paper account. Never retried once placement
    /// starts.
    pub async fn submit_paper_order(&self, request: PaperOrderRequest) -> Result<OrderAck, SubmitError> {
        request.validate()?;
        self.readiness_for(Scope::Any)?;
        let config = self.config();

        let local_order_id = request
            .local_order_id
            .clone()
            .unwrap_or_else(|| self.next_local_id());
        if !self.inner.orders.reserve_local(&local_order_id) {
            return Err(duplicate_local_id(&local_order_id).into());
        }
        let _claim = LocalIdClaim {
            orders: &self.inner.orders,
            local_order_id: local_order_id.clone(),
        };

        if config.orders.paper_only {
            let status = self.check_connectivity().await;
            if !status.reachable {
                return Err(Unavailable::new(UnavailableReason::Unreachable, status.message).into());
            }
            if status.detected_mode != DetectedMode::Paper {
                return Err(Unavailable::new(
                    UnavailableReason::LiveAccountRefused,
                    format!(
                        "port {} is not a paper trading port",
                        status.port.map_or_else(|| "?".to_string(), |p| p.to_string())
                    ),
                )
                .into());
            }
        }

        let broker_order_id = self
            .call(Channel::Order, "next_order_id", self.retry_policy(), |session| async move {
                session.transport().next_order_id().await
            })
            .await
            .map_err(Unavailable::from)?;
        if !self.inner.orders.register_submit(&local_order_id, broker_order_id) {
            return Err(duplicate_local_id(&local_order_id).into());
        }

        let account = request
            .account
            .clone()
            .or_else(|| (!config.connection.account_code.is_empty()).then(|| config.connection.account_code.clone()));
        let ticket = OrderTicket {
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            time_in_force: request.time_in_force.clone(),
            account,
            order_ref: Some(local_order_id.clone()),
        };
        let (instrument, ticket) = (&request.instrument, &ticket);
        let placed = self
            .call(Channel::Order, "place_order", RetryPolicy::ONCE, move |session| async move {
                session
                    .transport()
                    .place_order(broker_order_id, instrument, ticket)
                    .await
            })
            .await;

        match placed {
            Ok(()) => {
                info!(
                    "placed {} {} {} as order {broker_order_id} ({local_order_id})",
                    request.side.action(),
                    request.quantity,
                    request.instrument
                );
                let status = self
                    .inner
                    .orders
                    .snapshot(broker_order_id)
                    .and_then(|s| s.status)
                    .unwrap_or_else(|| PENDING_SUBMIT.to_string());
                Ok(OrderAck {
                    local_order_id,
                    broker_order_id,
                    status,
                })
            }
            Err(err) => {
                // A connectivity failure leaves the outcome unknown; the next
                // poll settles it.
                if !err.is_connectivity() {
                    self.inner
                        .orders
                        .mark_rejected(broker_order_id, &err.to_string());
                }
                warn!("order {local_order_id} not placed: {err}");
                Err(Unavailable::from(err).into())
            }
        }
    }

    /// Best-known statuses for `local_order_ids`, polling open orders at most
    /// once and only when due.
    pub async fn refresh_order_statuses(&self, local_order_ids: &[String]) -> Vec<OrderStatusSnapshot> {
        let config = self.config();
        let interval = Duration::from_millis(config.orders.poll_min_interval_ms);
        let tracked = local_order_ids
            .iter()
            .any(|id| self.inner.orders.is_known_local(id));
        let may_poll = tracked
            && self.inner.orders.poll_due(interval)
            && self.inner.breaker.active().is_none()
            && !self
                .inner
                .scheduler
                .is_backlogged(config.scheduler.backlog_threshold);

        if may_poll {
            let this = self.clone();
            let polled = self
                .inner
                .order_poll_flight
                .run((), move || async move {
                    this.inner.orders.mark_polled();
                    let rows = this
                        .call(Channel::Order, "all_open_orders", this.retry_policy(), |session| async move {
                            session.transport().all_open_orders().await
                        })
                        .await?;
                    Ok::<usize, Unavailable>(this.inner.orders.apply_poll(&rows, now_ms()))
                })
                .await;
            match polled {
                Ok(applied) => trace!("open-order poll updated {applied} orders"),
                Err(e) => debug!("open-order poll failed: {e}"),
            }
        }
        self.inner.orders.best_known(local_order_ids)
    }

    // ------------------------------------------------------------------
    // Status and lifecycle
    // ------------------------------------------------------------------

    pub fn get_runtime_status(&self) -> RuntimeStatus {
        let config = self.config();
        let pool = self.inner.connection.pool();
        let active_port = pool.active_port();
        RuntimeStatus {
            enabled: config.connection.enabled,
            active_port,
            detected_mode: active_port.map_or(DetectedMode::Unknown, crate::connection::classify_port),
            sessions: pool.ports(),
            connectivity: self.inner.connection.last_status(),
            cooldown: self.inner.breaker.status(),
            queue_depth: self.inner.scheduler.depth(),
            active_requests: self.inner.scheduler.active(),
            backlogged: self
                .inner
                .scheduler
                .is_backlogged(config.scheduler.backlog_threshold),
            entitlement: self.inner.entitlement.snapshot(),
            scanner: self.inner.scanner.status(),
            tracked_orders: self.inner.orders.len(),
            account_download_complete: self.inner.account.download_complete(),
        }
    }

    pub fn get_market_data_entitlement_state(&self) -> EntitlementSnapshot {
        self.inner.entitlement.snapshot()
    }

    /// Apply a new configuration. Returns whether sessions were reset.
    ///
    /// Pacing, retry, backoff and TTL changes apply in place. Connection
    /// changes (host, ports, client id, account) also drop every session,
    /// clear the queue and the caches, and reset entitlement to live. Order
    /// identity survives.
    pub async fn reconfigure(&self, config: Config) -> Result<bool, ConfigError> {
        config.validate()?;
        let previous = self.config();
        let reset = previous.connection.requires_reset(&config.connection);

        self.inner.scheduler.reconfigure(SchedulerSettings::from(&config.scheduler));
        self.inner
            .log_throttle
            .set_window(Duration::from_millis(config.resilience.log_throttle_ms));
        self.inner
            .entitlement
            .set_settings(EntitlementSettings::from(&config.market_data));
        *self.inner.config.lock() = Arc::new(config);

        if reset {
            info!("connection settings changed, resetting broker sessions");
            self.reset().await;
        }
        Ok(reset)
    }

    async fn reset(&self) {
        let cleared = self.inner.scheduler.clear();
        if cleared > 0 {
            debug!("reset rejected {cleared} queued requests");
        }
        self.inner.connection.pool().drop_all().await;
        self.inner.connection.invalidate();
        self.inner.connectivity_flight.clear();
        self.inner.positions_flight.clear();
        self.inner.account_flight.clear();
        self.inner.order_poll_flight.clear();
        self.inner.scanner.clear();
        self.inner.entitlement.reset();
        self.inner.breaker.clear();
        self.inner.account.clear();
        *self.inner.account_cache.lock() = None;
        self.inner.chains.lock().clear();
    }

    /// Stop dispatching, reject queued work and disconnect every session.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.scheduler.close();
        self.inner.connection.pool().drop_all().await;
        info!("gateway shut down");
    }
}

fn duplicate_local_id(local_order_id: &str) -> Unavailable {
    Unavailable::new(
        UnavailableReason::InvalidRequest,
        format!("local order id {local_order_id} was already submitted"),
    )
}

/// Claim on a local order id for the length of one submit.
struct LocalIdClaim<'a> {
    orders: &'a OrderTracker,
    local_order_id: String,
}

impl Drop for LocalIdClaim<'_> {
    fn drop(&mut self) {
        self.orders.release_local(&self.local_order_id);
    }
}

/// The scanner's view of the gateway.
struct GatewayScanBroker(Gateway);

#[async_trait]
impl ScanBroker for GatewayScanBroker {
    fn ready(&self) -> Result<(), Unavailable> {
        self.0.readiness_for(Scope::Any)
    }

    async fn scan_code(&self, subscription: ScannerSubscription) -> Result<Vec<ScannerRow>, GatewayError> {
        let subscription = &subscription;
        self.0
            .call(Channel::Scanner, "market_scanner", self.0.retry_policy(), move |session| async move {
                session.transport().market_scanner(subscription).await
            })
            .await
    }

    async fn recycle(&self) {
        let pool = self.0.inner.connection.pool();
        if let Some(port) = pool.active_port() {
            pool.drop_session(port).await;
        }
        self.0.inner.connection.invalidate();
    }
}
