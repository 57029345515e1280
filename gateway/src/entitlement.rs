//! Market-data entitlement state.
//!
//! Each data class degrades `Live → Delayed → DelayedFrozen` when the broker
//! denies the current class, and never upgrades again until a reset. On top
//! of that:
//!
//! - a per-symbol quote backoff, independent of the class mode, swept of
//!   expired symbols whenever another one is blocked;
//! - a global option backoff once options are denied even when frozen;
//! - a bounded map of option contracts the broker does not know, kept for
//!   hours and pruned on insert and at most once a minute on lookup.

use std::time::Duration;

use log::{debug, info};
use optiondesk_broker::MarketDataType;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::MarketDataConfig;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Market data class in use for a data class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementMode {
    Live,
    Delayed,
    DelayedFrozen,
}

impl EntitlementMode {
    pub fn market_data_type(self) -> MarketDataType {
        match self {
            EntitlementMode::Live => MarketDataType::Live,
            EntitlementMode::Delayed => MarketDataType::Delayed,
            EntitlementMode::DelayedFrozen => MarketDataType::DelayedFrozen,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            EntitlementMode::Live => Some(EntitlementMode::Delayed),
            EntitlementMode::Delayed => Some(EntitlementMode::DelayedFrozen),
            EntitlementMode::DelayedFrozen => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    Quote,
    Option,
}

#[derive(Clone, Debug)]
struct Block {
    until: Instant,
    reason: String,
}

impl Block {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        (self.until > now).then(|| self.until - now)
    }
}

/// Resolved limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntitlementSettings {
    pub symbol_backoff: Duration,
    pub option_global_backoff: Duration,
    pub invalid_contract_ttl: Duration,
    pub invalid_contract_max: usize,
}

impl From<&MarketDataConfig> for EntitlementSettings {
    fn from(config: &MarketDataConfig) -> Self {
        Self {
            symbol_backoff: Duration::from_millis(config.symbol_backoff_ms),
            option_global_backoff: Duration::from_millis(config.option_global_backoff_ms),
            invalid_contract_ttl: Duration::from_millis(config.invalid_contract_ttl_ms),
            invalid_contract_max: config.invalid_contract_max.max(1),
        }
    }
}

struct Inner {
    settings: EntitlementSettings,
    quote_mode: EntitlementMode,
    option_mode: EntitlementMode,
    symbols: FxHashMap<String, Block>,
    options_blocked: Option<Block>,
    invalid_contracts: FxHashMap<String, Block>,
    last_prune: Option<Instant>,
}

impl Inner {
    fn mode_mut(&mut self, class: DataClass) -> &mut EntitlementMode {
        match class {
            DataClass::Quote => &mut self.quote_mode,
            DataClass::Option => &mut self.option_mode,
        }
    }

    fn prune_invalid(&mut self, now: Instant) {
        self.invalid_contracts.retain(|_, block| block.until > now);
        let max = self.settings.invalid_contract_max;
        if self.invalid_contracts.len() > max {
            let mut by_expiry: Vec<(Instant, String)> = self
                .invalid_contracts
                .iter()
                .map(|(key, block)| (block.until, key.clone()))
                .collect();
            by_expiry.sort();
            let excess = self.invalid_contracts.len() - max;
            for (_, key) in by_expiry.into_iter().take(excess) {
                self.invalid_contracts.remove(&key);
            }
        }
        self.last_prune = Some(now);
    }
}

/// A symbol currently in quote backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedSymbol {
    pub symbol: String,
    pub remaining_ms: u64,
    pub reason: String,
}

/// Serializable view of the entitlement state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSnapshot {
    pub quote_mode: EntitlementMode,
    pub option_mode: EntitlementMode,
    pub market_data_delayed_only: bool,
    pub blocked_symbols: Vec<BlockedSymbol>,
    pub option_global_blocked_ms: Option<u64>,
    pub option_global_block_reason: Option<String>,
    pub invalid_option_contracts: usize,
}

pub struct EntitlementState {
    inner: Mutex<Inner>,
}

impl EntitlementState {
    pub fn new(settings: EntitlementSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                settings,
                quote_mode: EntitlementMode::Live,
                option_mode: EntitlementMode::Live,
                symbols: FxHashMap::default(),
                options_blocked: None,
                invalid_contracts: FxHashMap::default(),
                last_prune: None,
            }),
        }
    }

    pub fn mode(&self, class: DataClass) -> EntitlementMode {
        let mut inner = self.inner.lock();
        *inner.mode_mut(class)
    }

    /// The quote class is no longer live.
    pub fn market_data_delayed_only(&self) -> bool {
        self.inner.lock().quote_mode != EntitlementMode::Live
    }

    /// Record that `class` was denied while requesting in mode `tried`.
    ///
    /// Returns the mode to retry with, or `None` when there is nothing left to
    /// degrade to. If another request already degraded past `tried`, its mode
    /// is returned unchanged.
    pub fn downgrade(&self, class: DataClass, tried: EntitlementMode) -> Option<EntitlementMode> {
        let mut inner = self.inner.lock();
        let mode = inner.mode_mut(class);
        if *mode > tried {
            return Some(*mode);
        }
        let next = tried.next()?;
        *mode = next;
        info!("market data for {class:?} degraded from {tried:?} to {next:?}");
        Some(next)
    }

    /// Start a quote backoff for `symbol`. Expired blocks are swept here.
    pub fn block_symbol(&self, symbol: &str, reason: impl Into<String>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.symbols.retain(|_, block| block.until > now);
        let until = now + inner.settings.symbol_backoff;
        let reason = reason.into();
        debug!("quote backoff for {symbol}: {reason}");
        inner.symbols.insert(symbol.to_string(), Block { until, reason });
    }

    /// Remaining backoff and reason for `symbol`, if blocked.
    pub fn symbol_blocked(&self, symbol: &str) -> Option<(Duration, String)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let block = inner.symbols.get(symbol)?;
        match block.remaining(now) {
            Some(remaining) => Some((remaining, block.reason.clone())),
            None => {
                inner.symbols.remove(symbol);
                None
            }
        }
    }

    pub fn block_options(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        let until = Instant::now() + inner.settings.option_global_backoff;
        let reason = reason.into();
        info!("all option quotes blocked: {reason}");
        inner.options_blocked = Some(Block { until, reason });
    }

    pub fn options_blocked(&self) -> Option<(Duration, String)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let block = inner.options_blocked.as_ref()?;
        match block.remaining(now) {
            Some(remaining) => Some((remaining, block.reason.clone())),
            None => {
                inner.options_blocked = None;
                None
            }
        }
    }

    /// Remember that the broker has no definition for `contract_key`.
    pub fn mark_invalid(&self, contract_key: &str, reason: impl Into<String>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let until = now + inner.settings.invalid_contract_ttl;
        inner.invalid_contracts.insert(
            contract_key.to_string(),
            Block {
                until,
                reason: reason.into(),
            },
        );
        inner.prune_invalid(now);
    }

    /// Reason the contract is known invalid, if it is.
    pub fn invalid_reason(&self, contract_key: &str) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner
            .last_prune
            .is_none_or(|at| now.duration_since(at) >= PRUNE_INTERVAL)
        {
            inner.prune_invalid(now);
        }
        inner
            .invalid_contracts
            .get(contract_key)
            .filter(|block| block.until > now)
            .map(|block| block.reason.clone())
    }

    pub fn invalid_count(&self) -> usize {
        self.inner.lock().invalid_contracts.len()
    }

    pub fn set_settings(&self, settings: EntitlementSettings) {
        self.inner.lock().settings = settings;
    }

    /// Back to live with every block forgotten.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.quote_mode = EntitlementMode::Live;
        inner.option_mode = EntitlementMode::Live;
        inner.symbols.clear();
        inner.options_blocked = None;
        inner.invalid_contracts.clear();
        inner.last_prune = None;
    }

    pub fn snapshot(&self) -> EntitlementSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut blocked_symbols: Vec<BlockedSymbol> = inner
            .symbols
            .iter()
            .filter_map(|(symbol, block)| {
                block.remaining(now).map(|remaining| BlockedSymbol {
                    symbol: symbol.clone(),
                    remaining_ms: remaining.as_millis() as u64,
                    reason: block.reason.clone(),
                })
            })
            .collect();
        blocked_symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let option_block = inner
            .options_blocked
            .as_ref()
            .and_then(|b| b.remaining(now).map(|r| (r, b.reason.clone())));
        EntitlementSnapshot {
            quote_mode: inner.quote_mode,
            option_mode: inner.option_mode,
            market_data_delayed_only: inner.quote_mode != EntitlementMode::Live,
            blocked_symbols,
            option_global_blocked_ms: option_block.as_ref().map(|(r, _)| r.as_millis() as u64),
            option_global_block_reason: option_block.map(|(_, reason)| reason),
            invalid_option_contracts: inner
                .invalid_contracts
                .values()
                .filter(|b| b.until > now)
                .count(),
        }
    }
}
