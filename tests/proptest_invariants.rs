// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! Property-based tests for the core instrument types.

use chrono::{Duration, NaiveDate};
use optiondesk::{Instrument, OptionContract, OptionRight, Price, Symbol, parse_expiration};
use proptest::prelude::*;

/// Expirations over the next few years.
fn expiry_strategy() -> impl Strategy<Value = NaiveDate> {
    (0i64..2_000).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default() + Duration::days(offset)
    })
}

fn right_strategy() -> impl Strategy<Value = OptionRight> {
    prop_oneof![Just(OptionRight::Call), Just(OptionRight::Put)]
}

/// Ticker-shaped text, including lowercase, padding and class separators.
fn raw_ticker_strategy() -> impl Strategy<Value = String> {
    "[ ]{0,2}[a-zA-Z][a-zA-Z0-9]{0,3}([ .-][a-zA-Z])?[ ]{0,2}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // ========================================================================
    // PRICE
    // ========================================================================

    #[test]
    fn cents_survive_decimal_conversion(cents in -1_000_000_000i64..1_000_000_000) {
        let decimal = cents as f64 / 100.0;
        prop_assert_eq!(Price::from_f64(decimal), Some(Price(cents)));
        prop_assert_eq!(Price(cents).as_f64(), decimal);
    }

    #[test]
    fn non_positive_ticks_are_absent(value in -1.0e9f64..=0.0) {
        prop_assert_eq!(Price::from_tick(value), None);
    }

    // ========================================================================
    // SYMBOL
    // ========================================================================

    #[test]
    fn normalize_is_idempotent(raw in raw_ticker_strategy()) {
        if let Some(symbol) = Symbol::normalize(&raw) {
            prop_assert_eq!(Symbol::normalize(symbol.as_str()), Some(symbol));
        }
    }

    #[test]
    fn normalized_symbols_are_ticker_shaped(raw in "\\PC{0,12}") {
        if let Some(symbol) = Symbol::normalize(&raw) {
            let text = symbol.as_str();
            prop_assert!(!text.is_empty() && text.len() <= Symbol::MAX_LEN);
            prop_assert!(text.as_bytes()[0].is_ascii_uppercase());
            prop_assert!(text.bytes().all(|b| b.is_ascii_uppercase()
                || b.is_ascii_digit()
                || b == b'.'
                || b == b'-'));
            prop_assert!(!text.ends_with('.') && !text.ends_with('-'));
        }
    }

    // ========================================================================
    // OPTION CONTRACTS
    // ========================================================================

    #[test]
    fn expiration_code_parses_back(expiry in expiry_strategy()) {
        let contract = OptionContract::new(Symbol::new("SPY"), expiry, OptionRight::Call, Price(500_00));
        prop_assert_eq!(parse_expiration(&contract.expiration_code()), Some(expiry));
    }

    #[test]
    fn dte_moves_with_the_calendar(expiry in expiry_strategy(), step in 0i64..400) {
        let contract = OptionContract::new(Symbol::new("SPY"), expiry, OptionRight::Put, Price(500_00));
        let today = expiry - Duration::days(step);
        prop_assert_eq!(contract.days_to_expiration(today), step);
    }

    #[test]
    fn contract_keys_distinguish_contracts(
        expiry in expiry_strategy(),
        right in right_strategy(),
        strike in 1i64..100_000,
        bump in 1i64..500,
    ) {
        let base = OptionContract::new(Symbol::new("AAPL"), expiry, right, Price(strike));
        let other = OptionContract::new(Symbol::new("AAPL"), expiry, right, Price(strike + bump));
        prop_assert_ne!(base.key(), other.key());
        prop_assert_eq!(Instrument::Option(base.clone()).key(), base.key());
        prop_assert!(Instrument::Option(base).validate().is_ok());
    }
}
