//! Option contract selection from chain parameters.

use std::ops::RangeInclusive;

use chrono::NaiveDate;
use optiondesk::{OptionContract, OptionRight, Price, Symbol, parse_expiration};
use optiondesk_broker::OptionChainParams;

/// Contracts near `reference` inside a days-to-expiration window.
///
/// Keeps up to `strike_window` strikes below the reference and up to
/// `strike_window` at or above it, both rights, for every expiration whose
/// DTE falls in `dte`. Contracts rejected by `keep` are skipped. Output is
/// ordered by expiration, then strike, calls before puts.
pub fn select_contracts(
    symbol: Symbol,
    chain: &OptionChainParams,
    reference: Price,
    today: NaiveDate,
    dte: RangeInclusive<i64>,
    strike_window: usize,
    mut keep: impl FnMut(&OptionContract) -> bool,
) -> Vec<OptionContract> {
    let mut expirations: Vec<NaiveDate> = chain
        .expirations
        .iter()
        .filter_map(|raw| parse_expiration(raw))
        .filter(|expiry| dte.contains(&(*expiry - today).num_days()))
        .collect();
    expirations.sort_unstable();
    expirations.dedup();

    let mut strikes: Vec<Price> = chain
        .strikes
        .iter()
        .filter_map(|s| Price::from_f64(*s))
        .filter(|p| p.is_positive())
        .collect();
    strikes.sort_unstable();
    strikes.dedup();

    let split = strikes.partition_point(|s| *s < reference);
    let lo = split.saturating_sub(strike_window);
    let hi = (split + strike_window).min(strikes.len());
    let window = &strikes[lo..hi];

    let multiplier = chain.multiplier.trim().parse::<u32>().unwrap_or(100);
    let trading_class = (!chain.trading_class.is_empty()).then(|| chain.trading_class.clone());

    let mut contracts = Vec::with_capacity(expirations.len() * window.len() * 2);
    for expiry in &expirations {
        for strike in window {
            for right in [OptionRight::Call, OptionRight::Put] {
                let mut contract = OptionContract::new(symbol, *expiry, right, *strike);
                contract.multiplier = multiplier;
                contract.trading_class = trading_class.clone();
                if keep(&contract) {
                    contracts.push(contract);
                }
            }
        }
    }
    contracts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> OptionChainParams {
        OptionChainParams {
            exchange: "SMART".to_string(),
            underlying_con_id: 265598,
            trading_class: "AAPL".to_string(),
            multiplier: "100".to_string(),
            expirations: vec![
                "20261016".to_string(),
                "20261030".to_string(),
                "20261120".to_string(),
                "20270115".to_string(),
            ],
            strikes: vec![140.0, 145.0, 150.0, 155.0, 160.0, 165.0, 170.0],
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()
    }

    #[test]
    fn windows_strikes_around_reference() {
        let contracts = select_contracts(
            Symbol::new("AAPL"),
            &chain(),
            Price(152_30),
            today(),
            7..=45,
            2,
            |_| true,
        );
        // 20261030 (15 DTE) and 20261120 (36 DTE); strikes 145, 150 | 155, 160.
        assert_eq!(contracts.len(), 2 * 4 * 2);
        let strikes: Vec<Price> = contracts.iter().take(8).map(|c| c.strike).collect();
        assert_eq!(
            strikes,
            vec![
                Price(145_00),
                Price(145_00),
                Price(150_00),
                Price(150_00),
                Price(155_00),
                Price(155_00),
                Price(160_00),
                Price(160_00)
            ]
        );
        assert_eq!(contracts[0].right, OptionRight::Call);
        assert_eq!(contracts[1].right, OptionRight::Put);
        assert_eq!(contracts[0].trading_class.as_deref(), Some("AAPL"));
    }

    #[test]
    fn skips_rejected_contracts() {
        let contracts = select_contracts(
            Symbol::new("AAPL"),
            &chain(),
            Price(150_00),
            today(),
            0..=1,
            1,
            |c| c.right == OptionRight::Put,
        );
        // 20261016 only; strikes 145 | 150; puts only.
        assert_eq!(contracts.len(), 2);
        assert!(contracts.iter().all(|c| c.right == OptionRight::Put));
    }

    #[test]
    fn reference_outside_strike_range() {
        let high = select_contracts(
            Symbol::new("AAPL"),
            &chain(),
            Price(500_00),
            today(),
            0..=400,
            3,
            |_| true,
        );
        assert!(high.iter().all(|c| c.strike >= Price(160_00)));
        assert_eq!(high.len(), 4 * 3 * 2);
    }
}
