//! TOML configuration loading and validation.
//!
//! Every field has a default, so an empty file (or no file) yields a usable
//! paper-trading setup against a local IB Gateway.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::Channel;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub scheduler: SchedulerConfig,
    pub resilience: ResilienceConfig,
    pub market_data: MarketDataConfig,
    pub scanner: ScannerConfig,
    pub orders: OrdersConfig,
    pub account: AccountConfig,
    pub options: OptionsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: i32,
    /// Probed after the active and configured ports, in order.
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<u16>,
    /// Account for account/portfolio updates. Empty means the session default.
    #[serde(default)]
    pub account_code: String,
    #[serde(default = "default_tcp_probe_timeout")]
    pub tcp_probe_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_connectivity_ttl")]
    pub connectivity_cache_ttl_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7497
}
fn default_client_id() -> i32 {
    17
}
fn default_candidate_ports() -> Vec<u16> {
    vec![7497, 4002, 7496, 4001]
}
fn default_tcp_probe_timeout() -> u64 {
    750
}
fn default_rpc_timeout() -> u64 {
    8_000
}
fn default_connectivity_ttl() -> u64 {
    5_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            candidate_ports: default_candidate_ports(),
            account_code: String::new(),
            tcp_probe_timeout_ms: default_tcp_probe_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            connectivity_cache_ttl_ms: default_connectivity_ttl(),
        }
    }
}

impl ConnectionConfig {
    pub fn tcp_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_probe_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connectivity_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.connectivity_cache_ttl_ms)
    }

    /// Whether switching from `self` to `other` invalidates open sessions.
    pub fn requires_reset(&self, other: &ConnectionConfig) -> bool {
        self.enabled != other.enabled
            || self.host != other.host
            || self.port != other.port
            || self.client_id != other.client_id
            || self.candidate_ports != other.candidate_ports
            || self.account_code != other.account_code
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_global_interval")]
    pub global_min_interval_ms: u64,
    #[serde(default = "default_queue_max")]
    pub queue_max_size: usize,
    /// Depth + active at or above this counts as backlogged.
    #[serde(default = "default_backlog")]
    pub backlog_threshold: usize,
    /// Minimum spacing between starts on one channel. Missing channels use 0.
    #[serde(default = "default_channel_intervals")]
    pub channel_intervals_ms: BTreeMap<Channel, u64>,
}

fn default_workers() -> usize {
    2
}
fn default_global_interval() -> u64 {
    25
}
fn default_queue_max() -> usize {
    200
}
fn default_backlog() -> usize {
    40
}
fn default_channel_intervals() -> BTreeMap<Channel, u64> {
    BTreeMap::from([
        (Channel::Quote, 60),
        (Channel::Historical, 500),
        (Channel::OptionChain, 250),
        (Channel::Positions, 500),
        (Channel::Account, 500),
        (Channel::Order, 100),
        (Channel::Scanner, 1_000),
        (Channel::Connectivity, 0),
    ])
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_workers(),
            global_min_interval_ms: default_global_interval(),
            queue_max_size: default_queue_max(),
            backlog_threshold: default_backlog(),
            channel_intervals_ms: default_channel_intervals(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default = "default_recovery_throttle")]
    pub recovery_throttle_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_log_throttle")]
    pub log_throttle_ms: u64,
}

fn default_cooldown() -> u64 {
    15_000
}
fn default_recovery_throttle() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    2_000
}
fn default_log_throttle() -> u64 {
    60_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown(),
            recovery_throttle_ms: default_recovery_throttle(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            log_throttle_ms: default_log_throttle(),
        }
    }
}

impl ResilienceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn recovery_throttle(&self) -> Duration {
        Duration::from_millis(self.recovery_throttle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_symbol_backoff")]
    pub symbol_backoff_ms: u64,
    #[serde(default = "default_option_backoff")]
    pub option_global_backoff_ms: u64,
    #[serde(default = "default_invalid_ttl")]
    pub invalid_contract_ttl_ms: u64,
    #[serde(default = "default_invalid_max")]
    pub invalid_contract_max: usize,
}

fn default_symbol_backoff() -> u64 {
    5 * 60_000
}
fn default_option_backoff() -> u64 {
    10 * 60_000
}
fn default_invalid_ttl() -> u64 {
    6 * 60 * 60_000
}
fn default_invalid_max() -> usize {
    5_000
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            symbol_backoff_ms: default_symbol_backoff(),
            option_global_backoff_ms: default_option_backoff(),
            invalid_contract_ttl_ms: default_invalid_ttl(),
            invalid_contract_max: default_invalid_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_ttl")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_scanner_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_scanner_backoff_cap")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_scanner_limit")]
    pub default_limit: usize,
    #[serde(default = "default_scanner_instrument")]
    pub instrument: String,
    #[serde(default = "default_scanner_location")]
    pub location_code: String,
    #[serde(default = "default_scan_codes")]
    pub scan_codes: Vec<String>,
    /// Filters applied when a request names none.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

fn default_scanner_ttl() -> u64 {
    2 * 60_000
}
fn default_scanner_backoff_base() -> u64 {
    30_000
}
fn default_scanner_backoff_cap() -> u64 {
    10 * 60_000
}
fn default_scanner_limit() -> usize {
    25
}
fn default_scanner_instrument() -> String {
    "STK".into()
}
fn default_scanner_location() -> String {
    "STK.US.MAJOR".into()
}
fn default_scan_codes() -> Vec<String> {
    vec!["MOST_ACTIVE".into(), "TOP_PERC_GAIN".into()]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_scanner_ttl(),
            backoff_base_ms: default_scanner_backoff_base(),
            backoff_cap_ms: default_scanner_backoff_cap(),
            default_limit: default_scanner_limit(),
            instrument: default_scanner_instrument(),
            location_code: default_scanner_location(),
            scan_codes: default_scan_codes(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrdersConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_min_interval_ms: u64,
    /// Refuse submissions unless the active port is a paper port.
    #[serde(default = "default_true")]
    pub paper_only: bool,
}

fn default_poll_interval() -> u64 {
    5_000
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            poll_min_interval_ms: default_poll_interval(),
            paper_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountConfig {
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_ms: u64,
    #[serde(default = "default_download_wait")]
    pub download_wait_ms: u64,
}

fn default_snapshot_ttl() -> u64 {
    10_000
}
fn default_download_wait() -> u64 {
    3_000
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_ms: default_snapshot_ttl(),
            download_wait_ms: default_download_wait(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OptionsConfig {
    /// Strikes kept on each side of the reference price.
    #[serde(default = "default_strike_window")]
    pub strike_window: usize,
    #[serde(default = "default_chain_ttl")]
    pub chain_cache_ttl_ms: u64,
    #[serde(default = "default_option_exchange")]
    pub exchange: String,
}

fn default_strike_window() -> usize {
    4
}
fn default_chain_ttl() -> u64 {
    60 * 60_000
}
fn default_option_exchange() -> String {
    "SMART".into()
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            strike_window: default_strike_window(),
            chain_cache_ttl_ms: default_chain_ttl(),
            exchange: default_option_exchange(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.port == 0 || self.connection.candidate_ports.contains(&0) {
            return Err(ConfigError::Invalid("port must be > 0".into()));
        }
        if self.connection.enabled && self.connection.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.scheduler.max_concurrent_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_workers must be > 0".into(),
            ));
        }
        if self.scheduler.queue_max_size == 0 {
            return Err(ConfigError::Invalid("queue_max_size must be > 0".into()));
        }
        if self.resilience.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".into()));
        }
        if self.resilience.base_delay_ms > self.resilience.max_delay_ms {
            return Err(ConfigError::Invalid(
                "base_delay_ms must be <= max_delay_ms".into(),
            ));
        }
        if self.scanner.backoff_base_ms > self.scanner.backoff_cap_ms {
            return Err(ConfigError::Invalid(
                "scanner backoff_base_ms must be <= backoff_cap_ms".into(),
            ));
        }
        if self.market_data.invalid_contract_max == 0 {
            return Err(ConfigError::Invalid(
                "invalid_contract_max must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Gateway address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.connection.host, self.connection.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_toml() -> &'static str {
        r#"
[connection]
host = "127.0.0.1"
port = 4002
client_id = 100
candidate_ports = [4002, 7497]
account_code = "DU123456"

[scheduler]
max_concurrent_workers = 3
global_min_interval_ms = 20

[scheduler.channel_intervals_ms]
quote = 100
scanner = 2000

[resilience]
cooldown_ms = 10000
max_attempts = 2

[scanner]
scan_codes = ["HOT_BY_VOLUME"]

[orders]
paper_only = false
"#
    }

    #[test]
    fn parse_example_config() {
        let config = Config::from_toml(example_toml()).unwrap();
        assert_eq!(config.connection.port, 4002);
        assert_eq!(config.connection.client_id, 100);
        assert_eq!(config.connection.account_code, "DU123456");
        assert_eq!(config.scheduler.max_concurrent_workers, 3);
        assert_eq!(config.scheduler.channel_intervals_ms[&Channel::Quote], 100);
        assert_eq!(config.scheduler.channel_intervals_ms[&Channel::Scanner], 2000);
        assert!(!config.scheduler.channel_intervals_ms.contains_key(&Channel::Order));
        assert_eq!(config.resilience.max_attempts, 2);
        assert_eq!(config.resilience.base_delay_ms, 250);
        assert_eq!(config.scanner.scan_codes, vec!["HOT_BY_VOLUME"]);
        assert!(!config.orders.paper_only);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.connection.enabled);
        assert_eq!(config.connection.port, 7497);
        assert!(config.orders.paper_only);
    }

    #[test]
    fn validate_catches_bad_port() {
        let mut config = Config::default();
        config.connection.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_catches_zero_workers_and_queue() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.queue_max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_catches_inverted_delays() {
        let mut config = Config::default();
        config.resilience.base_delay_ms = 5_000;
        config.resilience.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_host_only_matters_when_enabled() {
        let mut config = Config::default();
        config.connection.host = String::new();
        assert!(config.validate().is_err());
        config.connection.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reset_detection() {
        let base = ConnectionConfig::default();
        let mut other = base.clone();
        other.rpc_timeout_ms = 1;
        assert!(!base.requires_reset(&other));
        other.client_id = 99;
        assert!(base.requires_reset(&other));
    }

    #[test]
    fn address_format() {
        let config = Config::from_toml(example_toml()).unwrap();
        assert_eq!(config.address(), "127.0.0.1:4002");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optiondesk.toml");
        std::fs::write(&path, example_toml()).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.connection.client_id, 100);

        let missing = Config::load(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
