//! Decoder for raw account/portfolio stream records.
//!
//! The session pushes positional string records whose first field is the
//! message type. Older server versions insert extra leading fields, so every
//! field is addressed from the end of the record. Records that are too short
//! or carry unparsable required numbers decode to `None` and are dropped.

use optiondesk_broker::Fieldset;

/// Message type ids handled here.
pub const ACCOUNT_VALUE: &str = "6";
pub const PORTFOLIO_VALUE: &str = "7";
pub const ACCOUNT_TIME: &str = "8";
pub const ACCOUNT_DOWNLOAD_END: &str = "54";

const ACCOUNT_VALUE_MIN_LEN: usize = 5;
const PORTFOLIO_VALUE_MIN_LEN: usize = 19;
const ACCOUNT_TIME_MIN_LEN: usize = 3;
const ACCOUNT_DOWNLOAD_END_MIN_LEN: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct AccountValueUpdate {
    pub key: String,
    /// Raw value. Most tags are numeric, some (`AccountType`) are not.
    pub value: String,
    pub currency: String,
    pub account: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioUpdate {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub expiration: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<String>,
    pub multiplier: Option<String>,
    pub exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    pub position: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub account: String,
}

/// A decoded stream record.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    AccountValue(AccountValueUpdate),
    PortfolioValue(PortfolioUpdate),
    /// `HH:MM` of the last account update.
    AccountTime(String),
    /// The initial account download finished for this account.
    AccountDownloadEnd(String),
}

/// Positional view that indexes from the end.
struct Tail<'a>(&'a [String]);

impl<'a> Tail<'a> {
    /// The field `back` places from the end (`1` is the last field).
    fn at(&self, back: usize) -> &'a str {
        self.0
            .len()
            .checked_sub(back)
            .and_then(|i| self.0.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    fn text(&self, back: usize) -> String {
        self.at(back).to_string()
    }

    fn optional(&self, back: usize) -> Option<String> {
        let raw = self.at(back);
        (!raw.is_empty()).then(|| raw.to_string())
    }

    fn number(&self, back: usize) -> Option<f64> {
        self.at(back).parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// Decode one record. Unknown types and malformed records yield `None`.
pub fn decode(fieldset: &Fieldset) -> Option<StreamMessage> {
    let fields = fieldset.fields();
    let kind = fields.first()?.trim();
    let tail = Tail(fields);
    match kind {
        ACCOUNT_VALUE if fields.len() >= ACCOUNT_VALUE_MIN_LEN => {
            let key = tail.text(4);
            if key.is_empty() {
                return None;
            }
            Some(StreamMessage::AccountValue(AccountValueUpdate {
                key,
                value: tail.text(3),
                currency: tail.text(2),
                account: tail.text(1),
            }))
        }
        PORTFOLIO_VALUE if fields.len() >= PORTFOLIO_VALUE_MIN_LEN => {
            decode_portfolio(&tail).map(StreamMessage::PortfolioValue)
        }
        ACCOUNT_TIME if fields.len() >= ACCOUNT_TIME_MIN_LEN => {
            Some(StreamMessage::AccountTime(tail.text(1)))
        }
        ACCOUNT_DOWNLOAD_END if fields.len() >= ACCOUNT_DOWNLOAD_END_MIN_LEN => {
            Some(StreamMessage::AccountDownloadEnd(tail.text(1)))
        }
        _ => None,
    }
}

fn decode_portfolio(tail: &Tail<'_>) -> Option<PortfolioUpdate> {
    let con_id = tail.at(18).parse::<i64>().ok().filter(|id| *id > 0)?;
    let symbol = tail.text(17);
    if symbol.is_empty() {
        return None;
    }
    Some(PortfolioUpdate {
        con_id,
        symbol,
        sec_type: tail.text(16),
        expiration: tail.optional(15),
        strike: tail.number(14).filter(|s| *s > 0.0),
        right: tail
            .optional(13)
            .filter(|r| !matches!(r.as_str(), "0" | "?")),
        multiplier: tail.optional(12),
        exchange: tail.text(11),
        currency: tail.text(10),
        local_symbol: tail.text(9),
        trading_class: tail.text(8),
        position: tail.number(7)?,
        market_price: tail.number(6)?,
        market_value: tail.number(5)?,
        average_cost: tail.number(4)?,
        unrealized_pnl: tail.number(3).filter(|v| v.abs() < f64::MAX / 2.0),
        realized_pnl: tail.number(2).filter(|v| v.abs() < f64::MAX / 2.0),
        account: tail.text(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn portfolio_record(con_id: &str, position: &str) -> Fieldset {
        Fieldset::from_strs(&[
            "7", "8", con_id, "AAPL", "OPT", "20261120", "150", "C", "100", "AMEX", "USD",
            "AAPL  261120C00150000", "AAPL", position, "4.25", "850", "3.10", "230", "0", "DU123",
        ])
    }

    #[test]
    fn account_value() {
        let record = Fieldset::from_strs(&["6", "2", "NetLiquidation", "100250.75", "USD", "DU123"]);
        assert_eq!(
            decode(&record),
            Some(StreamMessage::AccountValue(AccountValueUpdate {
                key: "NetLiquidation".to_string(),
                value: "100250.75".to_string(),
                currency: "USD".to_string(),
                account: "DU123".to_string(),
            }))
        );
    }

    #[test]
    fn portfolio_value_reads_from_the_end() {
        let Some(StreamMessage::PortfolioValue(update)) = decode(&portfolio_record("265598", "2"))
        else {
            panic!("expected portfolio value");
        };
        assert_eq!(update.con_id, 265598);
        assert_eq!(update.symbol, "AAPL");
        assert_eq!(update.expiration.as_deref(), Some("20261120"));
        assert_eq!(update.strike, Some(150.0));
        assert_eq!(update.right.as_deref(), Some("C"));
        assert_eq!(update.position, 2.0);
        assert_eq!(update.market_price, 4.25);
        assert_eq!(update.unrealized_pnl, Some(230.0));
        assert_eq!(update.account, "DU123");

        // One extra leading field shifts nothing.
        let mut longer = portfolio_record("265598", "2").0;
        longer.insert(1, "extra".to_string());
        assert_eq!(
            decode(&Fieldset(longer)),
            decode(&portfolio_record("265598", "2"))
        );
    }

    #[test]
    fn stock_portfolio_has_no_option_fields() {
        let record = Fieldset::from_strs(&[
            "7", "8", "756733", "SPY", "STK", "", "0", "0", "", "ARCA", "USD", "SPY", "SPY",
            "10", "500.1", "5001", "480", "201", "0", "DU123",
        ]);
        let Some(StreamMessage::PortfolioValue(update)) = decode(&record) else {
            panic!("expected portfolio value");
        };
        assert_eq!(update.expiration, None);
        assert_eq!(update.strike, None);
        assert_eq!(update.right, None);
        assert_eq!(update.multiplier, None);
    }

    #[test]
    fn malformed_records_are_dropped() {
        assert_eq!(decode(&portfolio_record("abc", "2")), None);
        assert_eq!(decode(&portfolio_record("265598", "two")), None);
        assert_eq!(decode(&Fieldset::from_strs(&["6", "NetLiquidation", "1"])), None);
        assert_eq!(decode(&Fieldset::from_strs(&["6", "2", "", "1", "USD", "DU1"])), None);
        assert_eq!(decode(&Fieldset::from_strs(&["54"])), None);
        assert_eq!(decode(&Fieldset::from_strs(&["99", "1", "2", "3"])), None);
        assert_eq!(decode(&Fieldset::default()), None);
    }

    #[test]
    fn time_and_download_end() {
        assert_eq!(
            decode(&Fieldset::from_strs(&["8", "1", "14:32"])),
            Some(StreamMessage::AccountTime("14:32".to_string()))
        );
        assert_eq!(
            decode(&Fieldset::from_strs(&["54", "1", "DU123"])),
            Some(StreamMessage::AccountDownloadEnd("DU123".to_string()))
        );
    }

    fn message_type() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("6".to_string()),
            Just("7".to_string()),
            Just("8".to_string()),
            Just("54".to_string()),
            "[0-9]{1,3}",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Arbitrary records never panic the decoder.
        #[test]
        fn decode_never_panics(
            kind in message_type(),
            rest in prop::collection::vec(".{0,12}", 0..30),
        ) {
            let mut fields = vec![kind];
            fields.extend(rest);
            let _ = decode(&Fieldset(fields));
        }

        /// Portfolio records shorter than the guard never decode.
        #[test]
        fn short_portfolio_records_are_rejected(
            rest in prop::collection::vec("[0-9]{1,4}", 0..PORTFOLIO_VALUE_MIN_LEN - 1),
        ) {
            let mut fields = vec!["7".to_string()];
            fields.extend(rest);
            prop_assert_eq!(decode(&Fieldset(fields)), None);
        }
    }
}
