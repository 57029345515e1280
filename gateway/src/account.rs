//! Account values and portfolio marks fed by the account update stream.

use std::time::Duration;

use log::debug;
use optiondesk::Price;
use optiondesk_broker::{Fieldset, PositionRow};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::Notify;

use crate::fieldset::{self, AccountValueUpdate, PortfolioUpdate, StreamMessage};

/// Tags lifted out of the raw values into named snapshot fields.
pub const NET_LIQUIDATION: &str = "NetLiquidation";
pub const TOTAL_CASH_VALUE: &str = "TotalCashValue";
pub const BUYING_POWER: &str = "BuyingPower";
pub const AVAILABLE_FUNDS: &str = "AvailableFunds";
pub const EXCESS_LIQUIDITY: &str = "ExcessLiquidity";
pub const GROSS_POSITION_VALUE: &str = "GrossPositionValue";

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountValue {
    pub key: String,
    pub value: String,
    pub currency: String,
    pub account_code: String,
    pub updated_at: i64,
}

/// Latest mark for one contract held in the account.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValue {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub expiration: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<String>,
    pub multiplier: Option<String>,
    pub position: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub account: String,
    pub updated_at: i64,
}

impl PortfolioValue {
    fn from_update(update: PortfolioUpdate, updated_at: i64) -> Self {
        Self {
            con_id: update.con_id,
            symbol: update.symbol,
            sec_type: update.sec_type,
            expiration: update.expiration,
            strike: update.strike,
            right: update.right,
            multiplier: update.multiplier,
            position: update.position,
            market_price: update.market_price,
            market_value: update.market_value,
            average_cost: update.average_cost,
            unrealized_pnl: update.unrealized_pnl,
            realized_pnl: update.realized_pnl,
            account: update.account,
            updated_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    /// Structured positions call, joined with portfolio marks.
    Positions,
    /// Portfolio values only (positions call unsupported).
    Portfolio,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub account: String,
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub expiration: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<String>,
    pub quantity: f64,
    pub average_cost: Option<Price>,
    pub mark_price: Option<Price>,
    pub market_value: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub source: PositionSource,
}

/// Join position rows with the portfolio marks for the same contract.
/// Flat rows are skipped.
pub fn join_positions(
    rows: &[PositionRow],
    portfolio: &FxHashMap<i64, PortfolioValue>,
) -> Vec<PositionSnapshot> {
    rows.iter()
        .filter(|row| row.position != 0.0)
        .map(|row| {
            let mark = portfolio.get(&row.con_id);
            PositionSnapshot {
                account: row.account.clone(),
                con_id: row.con_id,
                symbol: row.symbol.clone(),
                sec_type: row.sec_type.clone(),
                expiration: row.expiration.clone(),
                strike: row.strike,
                right: row.right.clone(),
                quantity: row.position,
                average_cost: Price::from_f64(row.average_cost),
                mark_price: mark.and_then(|m| Price::from_f64(m.market_price)),
                market_value: mark.map(|m| m.market_value),
                unrealized_pnl: mark.and_then(|m| m.unrealized_pnl),
                realized_pnl: mark.and_then(|m| m.realized_pnl),
                source: PositionSource::Positions,
            }
        })
        .collect()
}

/// Positions built from portfolio values alone.
pub fn positions_from_portfolio<'a>(
    portfolio: impl IntoIterator<Item = &'a PortfolioValue>,
) -> Vec<PositionSnapshot> {
    portfolio
        .into_iter()
        .filter(|value| value.position != 0.0)
        .map(|value| PositionSnapshot {
            account: value.account.clone(),
            con_id: value.con_id,
            symbol: value.symbol.clone(),
            sec_type: value.sec_type.clone(),
            expiration: value.expiration.clone(),
            strike: value.strike,
            right: value.right.clone(),
            quantity: value.position,
            average_cost: Price::from_f64(value.average_cost),
            mark_price: Price::from_f64(value.market_price),
            market_value: Some(value.market_value),
            unrealized_pnl: value.unrealized_pnl,
            realized_pnl: value.realized_pnl,
            source: PositionSource::Portfolio,
        })
        .collect()
}

/// Account summary with the common tags pulled out.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account: Option<String>,
    pub net_liquidation: Option<f64>,
    pub total_cash_value: Option<f64>,
    pub buying_power: Option<f64>,
    pub available_funds: Option<f64>,
    pub excess_liquidity: Option<f64>,
    pub gross_position_value: Option<f64>,
    pub values: Vec<AccountValue>,
    pub download_complete: bool,
    pub last_update_time: Option<String>,
    pub updated_at: Option<i64>,
}

type ValueKey = (String, String, String);

#[derive(Default)]
struct Inner {
    values: FxHashMap<ValueKey, AccountValue>,
    portfolio: FxHashMap<i64, PortfolioValue>,
    download_complete: bool,
    last_update_time: Option<String>,
    updated_at: Option<i64>,
}

/// Store for account values and portfolio marks.
#[derive(Default)]
pub struct AccountStore {
    inner: Mutex<Inner>,
    download: Notify,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and apply one raw record. Returns false when it was dropped.
    pub fn apply(&self, fieldset: &Fieldset) -> bool {
        match fieldset::decode(fieldset) {
            Some(message) => {
                self.apply_message(message);
                true
            }
            None => {
                debug!("dropping undecodable fieldset {:?}", fieldset.fields().first());
                false
            }
        }
    }

    pub fn apply_message(&self, message: StreamMessage) {
        let now = now_ms();
        let mut inner = self.inner.lock();
        match message {
            StreamMessage::AccountValue(AccountValueUpdate {
                key,
                value,
                currency,
                account,
            }) => {
                inner.values.insert(
                    (account.clone(), key.clone(), currency.clone()),
                    AccountValue {
                        key,
                        value,
                        currency,
                        account_code: account,
                        updated_at: now,
                    },
                );
            }
            StreamMessage::PortfolioValue(update) => {
                inner
                    .portfolio
                    .insert(update.con_id, PortfolioValue::from_update(update, now));
            }
            StreamMessage::AccountTime(time) => {
                inner.last_update_time = Some(time);
            }
            StreamMessage::AccountDownloadEnd(account) => {
                debug!("account download complete for {account}");
                inner.download_complete = true;
                drop(inner);
                self.download.notify_waiters();
                return;
            }
        }
        inner.updated_at = Some(now);
    }

    pub fn download_complete(&self) -> bool {
        self.inner.lock().download_complete
    }

    /// Wait up to `timeout` for the download-end marker. Returns whether it
    /// has arrived.
    pub async fn wait_for_download(&self, timeout: Duration) -> bool {
        let notified = self.download.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.download_complete() {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    pub fn portfolio_map(&self) -> FxHashMap<i64, PortfolioValue> {
        self.inner.lock().portfolio.clone()
    }

    /// Portfolio values for `account` (all accounts when empty).
    pub fn portfolio(&self, account: &str) -> Vec<PortfolioValue> {
        let inner = self.inner.lock();
        let mut values: Vec<PortfolioValue> = inner
            .portfolio
            .values()
            .filter(|v| account.is_empty() || v.account == account)
            .cloned()
            .collect();
        values.sort_by_key(|v| v.con_id);
        values
    }

    /// Summary for `account` (all accounts when empty).
    pub fn snapshot(&self, account: &str) -> AccountSnapshot {
        let inner = self.inner.lock();
        let mut values: Vec<AccountValue> = inner
            .values
            .values()
            .filter(|v| account.is_empty() || v.account_code == account)
            .cloned()
            .collect();
        values.sort_by(|a, b| {
            (&a.account_code, &a.key, &a.currency).cmp(&(&b.account_code, &b.key, &b.currency))
        });
        let tag = |name: &str| pick_tag(&values, name);
        AccountSnapshot {
            account: (!account.is_empty())
                .then(|| account.to_string())
                .or_else(|| values.first().map(|v| v.account_code.clone())),
            net_liquidation: tag(NET_LIQUIDATION),
            total_cash_value: tag(TOTAL_CASH_VALUE),
            buying_power: tag(BUYING_POWER),
            available_funds: tag(AVAILABLE_FUNDS),
            excess_liquidity: tag(EXCESS_LIQUIDITY),
            gross_position_value: tag(GROSS_POSITION_VALUE),
            download_complete: inner.download_complete,
            last_update_time: inner.last_update_time.clone(),
            updated_at: inner.updated_at,
            values,
        }
    }

    /// Forget everything. Used when the session subscription is restarted.
    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }
}

/// Numeric value of `tag`, preferring USD, then BASE, then any currency.
fn pick_tag(values: &[AccountValue], tag: &str) -> Option<f64> {
    let candidates: Vec<&AccountValue> = values.iter().filter(|v| v.key == tag).collect();
    ["USD", "BASE"]
        .iter()
        .find_map(|ccy| candidates.iter().find(|v| v.currency == *ccy))
        .or_else(|| candidates.first())
        .and_then(|v| v.value.trim().parse::<f64>().ok())
}
