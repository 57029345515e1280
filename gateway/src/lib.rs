// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! # optiondesk-gateway
//!
//! Resilient session gateway between an options trading assistant and an
//! Interactive Brokers terminal (TWS or IB Gateway).
//!
//! The [`Gateway`] owns one session per port, probes paper and live ports in
//! order, paces every broker call through a per-channel [`Scheduler`], and
//! degrades instead of failing: reads return [`Unavailable`] with a reason
//! rather than an error.
//!
//! ```no_run
//! # async fn demo(connector: std::sync::Arc<dyn optiondesk_broker::Connector>) {
//! use optiondesk::Symbol;
//! use optiondesk_gateway::{Config, Gateway};
//!
//! let gateway = Gateway::builder(Config::default())
//!     .connector(connector)
//!     .build()
//!     .expect("valid config");
//!
//! match gateway.get_quote(Symbol::new("AAPL")).await {
//!     Ok(quote) => println!("{} bid {:?}", quote.instrument, quote.bid),
//!     Err(why) => println!("no quote: {why}"),
//! }
//! # }
//! ```

pub mod account;
pub mod chain;
pub mod config;
pub mod connection;
pub mod entitlement;
pub mod error;
pub mod fieldset;
pub mod gateway;
pub mod inflight;
pub mod orders;
pub mod resilience;
pub mod scanner;
pub mod scheduler;

pub use account::{AccountSnapshot, PositionSnapshot, PositionSource};
pub use config::Config;
pub use connection::{ConnectivityStatus, DetectedMode};
pub use entitlement::{EntitlementMode, EntitlementSnapshot};
pub use error::{ConfigError, Fetched, GatewayError, SubmitError, Unavailable, UnavailableReason};
pub use gateway::{Gateway, GatewayBuilder, OrderAck, PaperOrderRequest, Quote, RuntimeStatus};
pub use orders::OrderStatusSnapshot;
pub use scanner::{ScanRequest, ScanResult, ScanSource, ScannerFallback, StaticScannerFallback};
pub use scheduler::{Channel, Scheduler};
