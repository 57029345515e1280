// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! # optiondesk
//!
//! Core instrument types shared by the broker transport and the gateway.
//!
//! ## Price Representation
//!
//! Prices are stored as [`i64`] cents:
//!
//! ```
//! use optiondesk::Price;
//!
//! let price = Price(100_50);  // $100.50
//! assert_eq!(format!("{}", price), "$100.50");
//! assert_eq!(Price::from_f64(2.345), Some(Price(2_35)));
//! ```
//!
//! ## Symbols
//!
//! Tickers are inline and `Copy`. Untrusted text goes through
//! [`Symbol::normalize`]:
//!
//! ```
//! use optiondesk::Symbol;
//!
//! assert_eq!(Symbol::normalize(" brk b"), Some(Symbol::new("BRK.B")));
//! assert_eq!(Symbol::normalize("$$$"), None);
//! ```
//!
//! ## Option Contracts
//!
//! ```
//! use chrono::NaiveDate;
//! use optiondesk::{OptionContract, OptionRight, Price, Symbol};
//!
//! let expiry = NaiveDate::from_ymd_opt(2026, 11, 20).unwrap();
//! let call = OptionContract::new(Symbol::new("AAPL"), expiry, OptionRight::Call, Price(150_00));
//! assert_eq!(call.key(), "AAPL|20261120|C|15000");
//! ```

mod contract;
mod error;
mod types;

pub use contract::{Instrument, OptionContract, OptionRight, parse_expiration};
pub use error::ValidationError;
pub use types::{Price, Symbol};
