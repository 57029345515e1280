//! Broker transport boundary for the optiondesk gateway.
//!
//! The gateway never speaks the TWS wire protocol itself. It drives a
//! [`Transport`] (one per connected port) obtained from a [`Connector`].
//! Implementations:
//!
//! - **IBKR** (feature `ibkr`): TWS/IB Gateway via the `ibapi` blocking client
//! - **Mock** ([`mock`]): scriptable in-memory transport for tests

pub mod error;
pub mod mock;
pub mod types;

#[cfg(feature = "ibkr")]
pub mod ibkr;

pub use error::{ErrorKind, TransportError, classify};
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use optiondesk::{Instrument, Symbol};
use tokio::sync::broadcast;

pub type TransportResult<T> = Result<T, TransportError>;

/// One live session to the terminal on a single port.
///
/// Every call may block on the network; the gateway paces them through its
/// scheduler and wraps them in its own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lightweight echo (`reqCurrentTime`). Returns Unix seconds.
    async fn current_time(&self) -> TransportResult<i64>;

    /// Switch the market data class for subsequent snapshots.
    async fn set_market_data_type(&self, data_type: MarketDataType) -> TransportResult<()>;

    async fn market_data_snapshot(&self, instrument: &Instrument) -> TransportResult<QuoteSnapshot>;

    async fn historical_bars(
        &self,
        instrument: &Instrument,
        request: &HistoricalRequest,
    ) -> TransportResult<Vec<Bar>>;

    async fn contract_details(&self, instrument: &Instrument) -> TransportResult<Vec<ContractDetails>>;

    async fn sec_def_opt_params(
        &self,
        symbol: Symbol,
        underlying_con_id: i64,
    ) -> TransportResult<Vec<OptionChainParams>>;

    async fn market_scanner(&self, subscription: &ScannerSubscription) -> TransportResult<Vec<ScannerRow>>;

    /// Structured positions. Sessions that cannot serve it return `Unsupported`.
    async fn positions(&self) -> TransportResult<Vec<PositionRow>>;

    async fn all_open_orders(&self) -> TransportResult<Vec<OpenOrderRow>>;

    async fn next_order_id(&self) -> TransportResult<i64>;

    async fn place_order(
        &self,
        order_id: i64,
        instrument: &Instrument,
        ticket: &OrderTicket,
    ) -> TransportResult<()>;

    /// Start or stop the account/portfolio update stream (arrives as fieldsets).
    async fn req_account_updates(&self, subscribe: bool, account_code: &str) -> TransportResult<()>;

    /// Subscribe to pushed events. Each call returns an independent receiver.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the session. Idempotent.
    async fn disconnect(&self);
}

/// Opens sessions. One connector serves every candidate port.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> TransportResult<Arc<dyn Transport>>;

    /// Cheap reachability check: a bare TCP connect, dropped immediately.
    async fn probe_tcp(&self, host: &str, port: u16, timeout: Duration) -> TransportResult<()> {
        let address = format!("{host}:{port}");
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::timeout(format!(
                "tcp connect to {address} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}
