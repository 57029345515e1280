//! Cooldown circuit breaker, bounded exponential retry, and throttled logging.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceConfig;
use crate::error::GatewayError;
use optiondesk_broker::TransportError;

/// An open cooldown window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cooldown {
    pub until: Instant,
    pub reason: String,
}

/// Serializable view of an open cooldown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownStatus {
    pub remaining_ms: u64,
    pub reason: String,
}

/// Circuit breaker over connectivity failures.
///
/// Extending an open cooldown never shortens it: `until` only moves forward.
#[derive(Default)]
pub struct CircuitBreaker {
    cooldown: Mutex<Option<Cooldown>>,
    last_recovery_probe: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) the cooldown for `duration` from now.
    pub fn open(&self, duration: Duration, reason: impl Into<String>) -> Instant {
        let reason = reason.into();
        let candidate = Instant::now() + duration;
        let mut slot = self.cooldown.lock();
        let until = match slot.as_ref() {
            Some(existing) if existing.until >= candidate => existing.until,
            _ => candidate,
        };
        *slot = Some(Cooldown { until, reason });
        until
    }

    /// The open cooldown, if any. Expired windows are cleared on read.
    pub fn active(&self) -> Option<Cooldown> {
        let mut slot = self.cooldown.lock();
        match slot.as_ref() {
            Some(c) if c.until > Instant::now() => Some(c.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn status(&self) -> Option<CooldownStatus> {
        self.active().map(|c| CooldownStatus {
            remaining_ms: c.until.saturating_duration_since(Instant::now()).as_millis() as u64,
            reason: c.reason,
        })
    }

    /// `Err(CoolingDown)` while a cooldown is open.
    pub fn check(&self) -> Result<(), GatewayError> {
        match self.active() {
            Some(c) => Err(GatewayError::CoolingDown(c.reason)),
            None => Ok(()),
        }
    }

    pub fn clear(&self) {
        *self.cooldown.lock() = None;
    }

    /// Claim the right to run a background recovery probe. At most one claim
    /// succeeds per `throttle` window.
    pub fn claim_recovery_probe(&self, throttle: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.last_recovery_probe.lock();
        match *last {
            Some(at) if now.duration_since(at) < throttle => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// One attempt, no retries. Used for order placement.
    pub const ONCE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Delay before retry number `retry` (0-based): `min(max, base * 2^retry)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// Run `run` until it succeeds, fails with a non-transient error, or the
/// policy is exhausted.
///
/// `gate` is consulted before every retry (after the backoff sleep): when it
/// returns an error (backlogged queue, open cooldown) the retry is abandoned.
/// A backlog at failure time stops retries before sleeping.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    transient: impl Fn(&GatewayError) -> bool,
    gate: impl Fn() -> Result<(), GatewayError>,
    mut run: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match run().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;
        if attempt >= policy.max_attempts || !transient(&err) {
            return Err(err);
        }
        if let Err(stop) = gate() {
            debug!("{operation}: not retrying ({stop}) after: {err}");
            return Err(err);
        }
        let delay = policy.delay_for(attempt - 1);
        debug!(
            "{operation}: attempt {attempt} failed ({err}), retrying in {}ms",
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        gate()?;
    }
}

/// Await a transport call with a deadline. Expiry becomes a `Timeout` error.
pub async fn rpc<T>(
    timeout: Duration,
    operation: &str,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(GatewayError::from),
        Err(_) => Err(TransportError::timeout(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))
        .into()),
    }
}

/// Logs a given cause at most once per window.
pub struct LogThrottle {
    window: Mutex<Duration>,
    last: Mutex<FxHashMap<String, Instant>>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window: Mutex::new(window),
            last: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn set_window(&self, window: Duration) {
        *self.window.lock() = window;
    }

    /// Whether `key` may log now. Claims the window when it returns true.
    pub fn allow(&self, key: &str) -> bool {
        let window = *self.window.lock();
        let now = Instant::now();
        let mut last = self.last.lock();
        match last.get(key) {
            Some(at) if now.duration_since(*at) < window => false,
            _ => {
                last.retain(|_, at| now.duration_since(*at) < window);
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn warn(&self, key: &str, message: impl FnOnce() -> String) {
        if self.allow(key) {
            warn!("{}", message());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_monotonic() {
        let breaker = CircuitBreaker::new();
        let long = breaker.open(Duration::from_secs(30), "refused");
        let short = breaker.open(Duration::from_secs(5), "timeout");
        assert_eq!(long, short);
        let active = breaker.active().unwrap();
        assert_eq!(active.until, long);
        assert_eq!(active.reason, "timeout");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.active().is_none());
        assert!(breaker.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_probe_is_throttled() {
        let breaker = CircuitBreaker::new();
        let throttle = Duration::from_secs(30);
        assert!(breaker.claim_recovery_probe(throttle));
        assert!(!breaker.claim_recovery_probe(throttle));
        tokio::time::advance(throttle).await;
        assert!(breaker.claim_recovery_probe(throttle));
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(
            &policy(3),
            "probe",
            GatewayError::is_connectivity,
            || Ok(()),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::timeout("slow").into())
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(
            &policy(3),
            "quote",
            GatewayError::is_connectivity,
            || Ok(()),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::subscription("not entitled").into())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_stops_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(
            &policy(5),
            "quote",
            GatewayError::is_connectivity,
            || Err(GatewayError::Backlogged),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::refused("down").into())
            },
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_deadline_becomes_timeout() {
        let result: Result<(), _> = rpc(Duration::from_millis(50), "current_time", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("current_time timed out after 50ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn log_throttle_per_key() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.allow("quote:AAPL"));
        assert!(!throttle.allow("quote:AAPL"));
        assert!(throttle.allow("quote:MSFT"));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(throttle.allow("quote:AAPL"));
    }

    #[tokio::test(start_paused = true)]
    async fn log_throttle_forgets_expired_keys() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        for key in ["scan:a", "scan:b", "scan:c"] {
            assert!(throttle.allow(key));
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(throttle.allow("scan:d"));
        let last = throttle.last.lock();
        assert_eq!(last.len(), 1);
        assert!(last.contains_key("scan:d"));
    }
}
