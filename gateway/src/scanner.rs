//! Market scanner: multi-code fan-out with cache, in-flight sharing, failure
//! backoff and a fallback provider.
//!
//! Order of precedence for one request:
//!
//! 1. fresh cache for the same request key;
//! 2. when the broker is backed off or not ready, the fallback chain;
//! 3. an identical request already in flight;
//! 4. a sequential broker run over the scan codes.
//!
//! The fallback chain is stale cache, then the [`ScannerFallback`] provider,
//! then an empty result. Every non-broker result carries a reason.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use optiondesk::Symbol;
use optiondesk_broker::{ErrorKind, ScannerRow, ScannerSubscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ScannerConfig;
use crate::error::{Fetched, GatewayError, Unavailable};
use crate::inflight::InFlight;

/// A scanner request as callers send it. Empty fields take config defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanRequest {
    pub instrument: Option<String>,
    pub location_code: Option<String>,
    pub scan_codes: Vec<String>,
    pub filters: BTreeMap<String, String>,
    pub limit: Option<usize>,
}

impl ScanRequest {
    pub fn normalize(&self, config: &ScannerConfig) -> NormalizedScan {
        let pick = |value: &Option<String>, default: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_ascii_uppercase()
        };
        let instrument = pick(&self.instrument, &config.instrument);
        let location_code = pick(&self.location_code, &config.location_code);

        let raw_codes = if self.scan_codes.is_empty() {
            &config.scan_codes
        } else {
            &self.scan_codes
        };
        let mut scan_codes: Vec<String> = Vec::with_capacity(raw_codes.len());
        for code in raw_codes {
            let code = code.trim().to_ascii_uppercase();
            if !code.is_empty() && !scan_codes.contains(&code) {
                scan_codes.push(code);
            }
        }

        let filters = if self.filters.is_empty() {
            config.filters.clone()
        } else {
            self.filters.clone()
        };
        let limit = self.limit.unwrap_or(config.default_limit).max(1);

        let filter_key: Vec<String> = filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let key = format!(
            "{instrument}|{location_code}|{}|{}|{limit}",
            scan_codes.join(","),
            filter_key.join("&")
        );
        NormalizedScan {
            key,
            instrument,
            location_code,
            scan_codes,
            filters,
            limit,
        }
    }
}

/// A request with defaults applied and a stable cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedScan {
    pub key: String,
    pub instrument: String,
    pub location_code: String,
    /// Uppercase, de-duplicated, in request order.
    pub scan_codes: Vec<String>,
    /// Sorted by name.
    pub filters: BTreeMap<String, String>,
    pub limit: usize,
}

impl NormalizedScan {
    fn subscription(&self, scan_code: &str) -> ScannerSubscription {
        ScannerSubscription {
            instrument: self.instrument.clone(),
            location_code: self.location_code.clone(),
            scan_code: scan_code.to_string(),
            number_of_rows: self.limit,
            filters: self
                .filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Broker,
    Cache,
    StaleCache,
    Fallback,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub symbols: Vec<Symbol>,
    pub source: ScanSource,
    pub fallback_reason: Option<String>,
}

impl ScanResult {
    fn none(reason: String) -> Self {
        Self {
            symbols: Vec::new(),
            source: ScanSource::None,
            fallback_reason: Some(reason),
        }
    }
}

/// Secondary symbol source used when the broker scanner cannot answer.
#[async_trait]
pub trait ScannerFallback: Send + Sync {
    fn name(&self) -> &str;

    async fn symbols(&self, request: &NormalizedScan) -> Fetched<Vec<Symbol>>;
}

/// A fixed watchlist.
pub struct StaticScannerFallback {
    name: String,
    symbols: Vec<Symbol>,
}

impl StaticScannerFallback {
    pub fn new(name: impl Into<String>, symbols: Vec<Symbol>) -> Self {
        Self {
            name: name.into(),
            symbols,
        }
    }
}

#[async_trait]
impl ScannerFallback for StaticScannerFallback {
    fn name(&self) -> &str {
        &self.name
    }

    async fn symbols(&self, request: &NormalizedScan) -> Fetched<Vec<Symbol>> {
        Ok(self.symbols.iter().take(request.limit).copied().collect())
    }
}

/// What the scanner needs from the gateway.
#[async_trait]
pub trait ScanBroker: Send + Sync {
    /// Whether broker scans may run now.
    fn ready(&self) -> Result<(), Unavailable>;

    async fn scan_code(&self, subscription: ScannerSubscription) -> Result<Vec<ScannerRow>, GatewayError>;

    /// Tear down and reconnect the session (clears broker-side subscriptions).
    async fn recycle(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannerSettings {
    pub cache_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl From<&ScannerConfig> for ScannerSettings {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            cache_ttl: Duration::from_millis(config.cache_ttl_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

impl ScannerSettings {
    /// Backoff after the `streak`-th consecutive failure: `min(cap, base * 2^(streak-1))`.
    pub fn backoff_for(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_cap)
    }
}

struct CacheEntry {
    key: String,
    symbols: Vec<Symbol>,
    expires_at: Instant,
}

#[derive(Default)]
struct ScanState {
    cache: Option<CacheEntry>,
    failure_streak: u32,
    backoff_until: Option<Instant>,
    last_failure: Option<String>,
}

/// Serializable scanner health.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerStatus {
    pub failure_streak: u32,
    pub backoff_remaining_ms: Option<u64>,
    pub last_failure: Option<String>,
    pub cached_key: Option<String>,
}

pub struct Scanner {
    state: Mutex<ScanState>,
    inflight: Arc<InFlight<String, ScanResult>>,
    fallback: Option<Arc<dyn ScannerFallback>>,
}

impl Scanner {
    pub fn new(fallback: Option<Arc<dyn ScannerFallback>>) -> Self {
        Self {
            state: Mutex::new(ScanState::default()),
            inflight: InFlight::new(),
            fallback,
        }
    }

    pub async fn scan(
        self: &Arc<Self>,
        broker: Arc<dyn ScanBroker>,
        settings: ScannerSettings,
        request: NormalizedScan,
    ) -> ScanResult {
        if request.scan_codes.is_empty() {
            return ScanResult::none("no scan codes requested".to_string());
        }
        if let Some(symbols) = self.fresh(&request.key) {
            return ScanResult {
                symbols,
                source: ScanSource::Cache,
                fallback_reason: None,
            };
        }
        if let Some(remaining) = self.backoff_remaining() {
            let last = self.state.lock().last_failure.clone().unwrap_or_default();
            let reason = format!(
                "scanner backing off for {}ms after: {last}",
                remaining.as_millis()
            );
            return self.fall_back(&request, reason).await;
        }
        if let Err(unavailable) = broker.ready() {
            return self.fall_back(&request, unavailable.to_string()).await;
        }

        let this = Arc::clone(self);
        let key = request.key.clone();
        let shared = self
            .inflight
            .run(key, move || async move {
                Ok(this.run_broker(broker, settings, request).await)
            })
            .await;
        shared.unwrap_or_else(|e| ScanResult::none(e.to_string()))
    }

    async fn run_broker(
        &self,
        broker: Arc<dyn ScanBroker>,
        settings: ScannerSettings,
        request: NormalizedScan,
    ) -> ScanResult {
        let mut symbols: Vec<Symbol> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        let mut no_items = false;

        for code in &request.scan_codes {
            if symbols.len() >= request.limit {
                break;
            }
            let subscription = request.subscription(code);
            let mut result = broker.scan_code(subscription.clone()).await;
            if matches!(&result, Err(e) if e.kind() == Some(ErrorKind::DuplicateScannerSubscription))
            {
                warn!("scanner {code}: duplicate subscription, recycling session");
                broker.recycle().await;
                result = broker.scan_code(subscription).await;
            }
            match result {
                Ok(rows) => {
                    for row in rows {
                        let Some(symbol) = Symbol::normalize(&row.symbol) else {
                            continue;
                        };
                        if !symbols.contains(&symbol) {
                            symbols.push(symbol);
                            if symbols.len() >= request.limit {
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == Some(ErrorKind::NoScannerItems) => {
                    debug!("scanner {code}: no items retrieved");
                    no_items = true;
                }
                Err(e) => {
                    debug!("scanner {code} failed: {e}");
                    let stop = e.is_connectivity() || matches!(e, GatewayError::CoolingDown(_));
                    last_error = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        if !symbols.is_empty() {
            self.record_success(&request.key, &symbols, settings.cache_ttl);
            return ScanResult {
                symbols,
                source: ScanSource::Broker,
                fallback_reason: None,
            };
        }

        let reason = match &last_error {
            Some(e) => format!("scanner failed: {e}"),
            None if no_items => "scanner returned no items".to_string(),
            None => "scanner returned no usable symbols".to_string(),
        };
        if last_error.is_some() || !no_items {
            self.record_failure(&settings, &reason);
        }
        self.fall_back(&request, reason).await
    }

    async fn fall_back(&self, request: &NormalizedScan, reason: String) -> ScanResult {
        if let Some(symbols) = self.stale(&request.key) {
            return ScanResult {
                symbols,
                source: ScanSource::StaleCache,
                fallback_reason: Some(reason),
            };
        }
        let Some(provider) = &self.fallback else {
            return ScanResult::none(reason);
        };
        match provider.symbols(request).await {
            Ok(mut symbols) if !symbols.is_empty() => {
                symbols.truncate(request.limit);
                ScanResult {
                    symbols,
                    source: ScanSource::Fallback,
                    fallback_reason: Some(format!("{reason} (served by {})", provider.name())),
                }
            }
            Ok(_) => ScanResult::none(format!("{reason}; {} returned nothing", provider.name())),
            Err(e) => ScanResult::none(format!("{reason}; {} failed: {e}", provider.name())),
        }
    }

    fn fresh(&self, key: &str) -> Option<Vec<Symbol>> {
        let state = self.state.lock();
        state
            .cache
            .as_ref()
            .filter(|c| c.key == key && c.expires_at > Instant::now())
            .map(|c| c.symbols.clone())
    }

    /// Cached symbols for `key`, expired or not.
    fn stale(&self, key: &str) -> Option<Vec<Symbol>> {
        let state = self.state.lock();
        state
            .cache
            .as_ref()
            .filter(|c| c.key == key && !c.symbols.is_empty())
            .map(|c| c.symbols.clone())
    }

    fn record_success(&self, key: &str, symbols: &[Symbol], ttl: Duration) {
        let mut state = self.state.lock();
        if state.failure_streak > 0 {
            info!("scanner recovered after {} failures", state.failure_streak);
        }
        state.failure_streak = 0;
        state.backoff_until = None;
        state.last_failure = None;
        state.cache = Some(CacheEntry {
            key: key.to_string(),
            symbols: symbols.to_vec(),
            expires_at: Instant::now() + ttl,
        });
    }

    fn record_failure(&self, settings: &ScannerSettings, reason: &str) {
        let mut state = self.state.lock();
        state.failure_streak += 1;
        let backoff = settings.backoff_for(state.failure_streak);
        state.backoff_until = Some(Instant::now() + backoff);
        state.last_failure = Some(reason.to_string());
        debug!(
            "scanner failure #{}, backing off {}ms: {reason}",
            state.failure_streak,
            backoff.as_millis()
        );
    }

    pub fn failure_streak(&self) -> u32 {
        self.state.lock().failure_streak
    }

    pub fn backoff_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn status(&self) -> ScannerStatus {
        let remaining = self.backoff_remaining();
        let state = self.state.lock();
        ScannerStatus {
            failure_streak: state.failure_streak,
            backoff_remaining_ms: remaining.map(|r| r.as_millis() as u64),
            last_failure: state.last_failure.clone(),
            cached_key: state.cache.as_ref().map(|c| c.key.clone()),
        }
    }

    /// Drop cache, streak and in-flight sharing.
    pub fn clear(&self) {
        *self.state.lock() = ScanState::default();
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use optiondesk_broker::TransportError;
    use rustc_hash::FxHashMap;

    use super::*;
    use crate::error::UnavailableReason;

    type Scripted = Result<Vec<ScannerRow>, GatewayError>;

    #[derive(Default)]
    struct FakeBroker {
        rows: Mutex<FxHashMap<String, Vec<&'static str>>>,
        scripted: Mutex<FxHashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
        recycles: AtomicUsize,
        not_ready: Mutex<Option<Unavailable>>,
        latency: Duration,
    }

    impl FakeBroker {
        fn with_rows(self, code: &str, symbols: &[&'static str]) -> Self {
            self.rows.lock().insert(code.to_string(), symbols.to_vec());
            self
        }

        fn fail(&self, code: &str, error: GatewayError) {
            self.scripted
                .lock()
                .entry(code.to_string())
                .or_default()
                .push_back(Err(error));
        }

        fn calls_for(&self, code: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == code).count()
        }
    }

    #[async_trait]
    impl ScanBroker for FakeBroker {
        fn ready(&self) -> Result<(), Unavailable> {
            match self.not_ready.lock().clone() {
                Some(reason) => Err(reason),
                None => Ok(()),
            }
        }

        async fn scan_code(&self, subscription: ScannerSubscription) -> Scripted {
            let code = subscription.scan_code.clone();
            self.calls.lock().push(code.clone());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if let Some(result) = self.scripted.lock().get_mut(&code).and_then(|q| q.pop_front()) {
                return result;
            }
            let symbols = self.rows.lock().get(&code).cloned().unwrap_or_default();
            Ok(symbols
                .iter()
                .enumerate()
                .map(|(rank, symbol)| ScannerRow {
                    rank: rank as i32,
                    symbol: symbol.to_string(),
                    sec_type: "STK".to_string(),
                    con_id: rank as i64 + 1,
                })
                .collect())
        }

        async fn recycle(&self) {
            self.recycles.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings() -> ScannerSettings {
        ScannerSettings {
            cache_ttl: Duration::from_secs(60),
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(600),
        }
    }

    fn request(codes: &[&str]) -> NormalizedScan {
        ScanRequest {
            scan_codes: codes.iter().map(|c| c.to_string()).collect(),
            limit: Some(10),
            ..ScanRequest::default()
        }
        .normalize(&ScannerConfig::default())
    }

    fn syms(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(|s| Symbol::new(s)).collect()
    }

    #[test]
    fn request_key_is_normalized() {
        let config = ScannerConfig::default();
        let a = ScanRequest {
            scan_codes: vec!["most_active".into(), "MOST_ACTIVE".into(), " top_perc_gain".into()],
            filters: BTreeMap::from([("b".into(), "2".into()), ("a".into(), "1".into())]),
            ..ScanRequest::default()
        }
        .normalize(&config);
        assert_eq!(a.scan_codes, vec!["MOST_ACTIVE", "TOP_PERC_GAIN"]);
        assert_eq!(a.key, "STK|STK.US.MAJOR|MOST_ACTIVE,TOP_PERC_GAIN|a=1&b=2|25");

        let defaults = ScanRequest::default().normalize(&config);
        assert_eq!(defaults.scan_codes, config.scan_codes);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let s = settings();
        assert_eq!(s.backoff_for(1), Duration::from_secs(30));
        assert_eq!(s.backoff_for(2), Duration::from_secs(60));
        assert_eq!(s.backoff_for(5), Duration::from_secs(480));
        assert_eq!(s.backoff_for(6), Duration::from_secs(600));
        assert_eq!(s.backoff_for(60), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn fans_out_dedupes_and_caches() {
        let broker = Arc::new(
            FakeBroker::default()
                .with_rows("MOST_ACTIVE", &["aapl", "msft", "bad$"])
                .with_rows("TOP_PERC_GAIN", &["MSFT", "nvda"]),
        );
        let scanner = Arc::new(Scanner::new(None));

        let result = scanner
            .scan(broker.clone(), settings(), request(&["MOST_ACTIVE", "TOP_PERC_GAIN"]))
            .await;
        assert_eq!(result.source, ScanSource::Broker);
        assert_eq!(result.symbols, syms(&["AAPL", "MSFT", "NVDA"]));

        let again = scanner
            .scan(broker.clone(), settings(), request(&["MOST_ACTIVE", "TOP_PERC_GAIN"]))
            .await;
        assert_eq!(again.source, ScanSource::Cache);
        assert_eq!(broker.calls_for("MOST_ACTIVE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_run() {
        let broker = Arc::new(FakeBroker {
            latency: Duration::from_millis(200),
            ..FakeBroker::default()
        }
        .with_rows("MOST_ACTIVE", &["AAPL"])
        .with_rows("HOT_BY_VOLUME", &["TSLA"]));
        let scanner = Arc::new(Scanner::new(None));
        let req = request(&["MOST_ACTIVE", "HOT_BY_VOLUME"]);

        let (a, b) = tokio::join!(
            scanner.scan(broker.clone(), settings(), req.clone()),
            scanner.scan(broker.clone(), settings(), req.clone()),
        );
        assert_eq!(a, b);
        assert_eq!(broker.calls_for("MOST_ACTIVE"), 1);
        assert_eq!(broker.calls_for("HOT_BY_VOLUME"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_backs_off_and_success_resets() {
        let broker = Arc::new(FakeBroker::default().with_rows("MOST_ACTIVE", &["AAPL"]));
        let scanner = Arc::new(Scanner::new(None));
        let req = request(&["MOST_ACTIVE"]);

        for streak in 1..=3u32 {
            broker.fail("MOST_ACTIVE", TransportError::from_broker(321, "bad scan").into());
            let result = scanner.scan(broker.clone(), settings(), req.clone()).await;
            assert_eq!(result.source, ScanSource::None);
            assert_eq!(scanner.failure_streak(), streak);
            let backoff = settings().backoff_for(streak);
            assert_eq!(scanner.backoff_remaining(), Some(backoff));

            // Backed off: the broker is not asked.
            let calls = broker.calls_for("MOST_ACTIVE");
            let skipped = scanner.scan(broker.clone(), settings(), req.clone()).await;
            assert!(skipped.fallback_reason.unwrap().contains("backing off"));
            assert_eq!(broker.calls_for("MOST_ACTIVE"), calls);
            tokio::time::advance(backoff).await;
        }

        let ok = scanner.scan(broker.clone(), settings(), req).await;
        assert_eq!(ok.source, ScanSource::Broker);
        assert_eq!(scanner.failure_streak(), 0);
        assert_eq!(scanner.backoff_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn no_items_is_lenient_and_prefers_stale_cache() {
        let broker = Arc::new(FakeBroker::default().with_rows("MOST_ACTIVE", &["AAPL"]));
        let scanner = Arc::new(Scanner::new(None));
        let req = request(&["MOST_ACTIVE"]);
        scanner.scan(broker.clone(), settings(), req.clone()).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        broker.fail(
            "MOST_ACTIVE",
            TransportError::from_broker(162, "API scanner subscription cancelled: no items retrieved")
                .into(),
        );
        let result = scanner.scan(broker.clone(), settings(), req).await;
        assert_eq!(result.source, ScanSource::StaleCache);
        assert_eq!(result.symbols, syms(&["AAPL"]));
        assert!(result.fallback_reason.is_some());
        assert_eq!(scanner.failure_streak(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscription_recycles_once() {
        let broker = Arc::new(FakeBroker::default().with_rows("MOST_ACTIVE", &["AAPL"]));
        broker.fail(
            "MOST_ACTIVE",
            TransportError::from_broker(324, "Duplicate scanner subscription").into(),
        );
        let scanner = Arc::new(Scanner::new(None));
        let result = scanner.scan(broker.clone(), settings(), request(&["MOST_ACTIVE"])).await;
        assert_eq!(result.source, ScanSource::Broker);
        assert_eq!(broker.recycles.load(Ordering::SeqCst), 1);
        assert_eq!(broker.calls_for("MOST_ACTIVE"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_uses_fallback_provider() {
        let broker = Arc::new(FakeBroker::default());
        *broker.not_ready.lock() = Some(Unavailable::new(UnavailableReason::CoolingDown, "refused"));
        let provider: Arc<dyn ScannerFallback> =
            Arc::new(StaticScannerFallback::new("watchlist", syms(&["SPY", "QQQ"])));
        let scanner = Arc::new(Scanner::new(Some(provider)));

        let result = scanner.scan(broker.clone(), settings(), request(&["MOST_ACTIVE"])).await;
        assert_eq!(result.source, ScanSource::Fallback);
        assert_eq!(result.symbols, syms(&["SPY", "QQQ"]));
        let reason = result.fallback_reason.unwrap();
        assert!(reason.contains("cooling_down"));
        assert!(reason.contains("watchlist"));
        assert!(broker.calls.lock().is_empty());
    }
}
