//! Instruments the gateway trades and quotes: stocks and listed options.

use std::fmt;

use chrono::NaiveDate;

use crate::error::ValidationError;
use crate::types::{Price, Symbol};

/// Call or put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Single-letter code used on the wire (`C` / `P`).
    pub fn code(self) -> &'static str {
        match self {
            OptionRight::Call => "C",
            OptionRight::Put => "P",
        }
    }

    /// Parse the broker's right field. Accepts `C`, `CALL`, `P`, `PUT` in any case.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(OptionRight::Call),
            "P" | "PUT" => Some(OptionRight::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single listed option contract.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptionContract {
    pub symbol: Symbol,
    pub expiration: NaiveDate,
    pub right: OptionRight,
    pub strike: Price,
    pub multiplier: u32,
    pub exchange: String,
    pub currency: String,
    pub trading_class: Option<String>,
}

impl OptionContract {
    /// US equity option on SMART with the standard 100 multiplier.
    pub fn new(symbol: Symbol, expiration: NaiveDate, right: OptionRight, strike: Price) -> Self {
        Self {
            symbol,
            expiration,
            right,
            strike,
            multiplier: 100,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            trading_class: None,
        }
    }

    /// Identity of the contract for suppression maps: `(symbol, expiration, right, strike)`.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.symbol,
            self.expiration_code(),
            self.right.code(),
            self.strike.0
        )
    }

    /// Expiration in the broker's `YYYYMMDD` form.
    pub fn expiration_code(&self) -> String {
        self.expiration.format("%Y%m%d").to_string()
    }

    /// Calendar days from `today` to expiration (negative once expired).
    pub fn days_to_expiration(&self, today: NaiveDate) -> i64 {
        (self.expiration - today).num_days()
    }
}

impl fmt::Display for OptionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.symbol,
            self.expiration_code(),
            self.strike,
            self.right
        )
    }
}

/// Parse a broker expiration (`YYYYMMDD`, or `YYYYMM` for a contract month).
///
/// A bare month resolves to its first day; callers only use it for DTE windows.
pub fn parse_expiration(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    match raw.len() {
        8 => NaiveDate::parse_from_str(raw, "%Y%m%d").ok(),
        6 => NaiveDate::parse_from_str(&format!("{raw}01"), "%Y%m%d").ok(),
        _ => None,
    }
}

/// What a request is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instrument {
    Stock(Symbol),
    Option(OptionContract),
}

impl Instrument {
    pub fn symbol(&self) -> Symbol {
        match self {
            Instrument::Stock(symbol) => *symbol,
            Instrument::Option(contract) => contract.symbol,
        }
    }

    /// Stable cache/backoff key.
    pub fn key(&self) -> String {
        match self {
            Instrument::Stock(symbol) => symbol.as_str().to_string(),
            Instrument::Option(contract) => contract.key(),
        }
    }

    pub fn sec_type(&self) -> &'static str {
        match self {
            Instrument::Stock(_) => "STK",
            Instrument::Option(_) => "OPT",
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Instrument::Stock(symbol) if symbol.is_empty() => Err(ValidationError::EmptySymbol),
            Instrument::Option(contract) if contract.symbol.is_empty() => {
                Err(ValidationError::EmptySymbol)
            }
            Instrument::Option(contract) if !contract.strike.is_positive() => {
                Err(ValidationError::NonPositiveStrike)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Stock(symbol) => write!(f, "{symbol}"),
            Instrument::Option(contract) => write!(f, "{contract}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nov(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, day).unwrap()
    }

    #[test]
    fn contract_key_is_stable() {
        let c = OptionContract::new(Symbol::new("AAPL"), nov(20), OptionRight::Call, Price(150_00));
        assert_eq!(c.key(), "AAPL|20261120|C|15000");
        assert_eq!(format!("{c}"), "AAPL 20261120 $150.00C");
    }

    #[test]
    fn days_to_expiration() {
        let c = OptionContract::new(Symbol::new("SPY"), nov(20), OptionRight::Put, Price(500_00));
        assert_eq!(c.days_to_expiration(nov(10)), 10);
        assert_eq!(c.days_to_expiration(nov(21)), -1);
    }

    #[test]
    fn right_parse() {
        assert_eq!(OptionRight::parse("call"), Some(OptionRight::Call));
        assert_eq!(OptionRight::parse("P"), Some(OptionRight::Put));
        assert_eq!(OptionRight::parse("X"), None);
    }

    #[test]
    fn expiration_parse() {
        assert_eq!(parse_expiration("20261120"), Some(nov(20)));
        assert_eq!(parse_expiration("202611"), Some(nov(1)));
        assert_eq!(parse_expiration("2026-11-20"), None);
    }

    #[test]
    fn instrument_validation() {
        let bad = OptionContract::new(Symbol::new("AAPL"), nov(20), OptionRight::Call, Price(0));
        assert_eq!(
            Instrument::Option(bad).validate(),
            Err(ValidationError::NonPositiveStrike)
        );
        assert!(Instrument::Stock(Symbol::new("AAPL")).validate().is_ok());
    }
}
