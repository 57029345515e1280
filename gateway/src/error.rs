//! Error types for the gateway.
//!
//! Three layers:
//! - [`GatewayError`]: why one scheduled broker call failed (internal).
//! - [`Unavailable`]: what a read operation returns instead of data. Always
//!   carries a machine-readable [`UnavailableReason`].
//! - [`SubmitError`]: order submission, where bad input is a hard error.

use std::fmt;
use std::path::PathBuf;

use optiondesk::ValidationError;
use optiondesk_broker::{ErrorKind, TransportError};
use serde::Serialize;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure of one broker call on its way through scheduler, retry and transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("request queue overloaded ({depth} pending)")]
    QueueOverloaded { depth: usize },

    #[error("request queue cleared")]
    QueueCleared,

    #[error("request scheduler is shut down")]
    SchedulerClosed,

    #[error("request queue backlogged")]
    Backlogged,

    #[error("cooling down: {0}")]
    CoolingDown(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GatewayError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GatewayError::Transport(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Socket-level failures: these are retried and open the cooldown.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GatewayError::Transport(e) if e.is_connectivity())
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == Some(ErrorKind::Timeout)
    }
}

/// Why a read operation produced no data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Disabled,
    CoolingDown,
    Unreachable,
    Connectivity,
    QueueOverloaded,
    QueueCleared,
    QueueBacklogged,
    SymbolBackoff,
    OptionBackoff,
    InvalidContract,
    Entitlement,
    InvalidRequest,
    LiveAccountRefused,
    NoData,
    Unsupported,
    Broker,
}

impl UnavailableReason {
    pub fn label(self) -> &'static str {
        match self {
            UnavailableReason::Disabled => "disabled",
            UnavailableReason::CoolingDown => "cooling_down",
            UnavailableReason::Unreachable => "unreachable",
            UnavailableReason::Connectivity => "connectivity",
            UnavailableReason::QueueOverloaded => "queue_overloaded",
            UnavailableReason::QueueCleared => "queue_cleared",
            UnavailableReason::QueueBacklogged => "queue_backlogged",
            UnavailableReason::SymbolBackoff => "symbol_backoff",
            UnavailableReason::OptionBackoff => "option_backoff",
            UnavailableReason::InvalidContract => "invalid_contract",
            UnavailableReason::Entitlement => "entitlement",
            UnavailableReason::InvalidRequest => "invalid_request",
            UnavailableReason::LiveAccountRefused => "live_account_refused",
            UnavailableReason::NoData => "no_data",
            UnavailableReason::Unsupported => "unsupported",
            UnavailableReason::Broker => "broker",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An expected absence of data, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct Unavailable {
    pub reason: UnavailableReason,
    pub message: String,
}

impl Unavailable {
    pub fn new(reason: UnavailableReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for Unavailable {
    fn from(err: GatewayError) -> Self {
        let reason = match &err {
            GatewayError::QueueOverloaded { .. } => UnavailableReason::QueueOverloaded,
            GatewayError::QueueCleared | GatewayError::SchedulerClosed => {
                UnavailableReason::QueueCleared
            }
            GatewayError::Backlogged => UnavailableReason::QueueBacklogged,
            GatewayError::CoolingDown(_) => UnavailableReason::CoolingDown,
            GatewayError::Unreachable(_) => UnavailableReason::Unreachable,
            GatewayError::Transport(e) => match e.kind {
                ErrorKind::Timeout | ErrorKind::ConnectionRefused | ErrorKind::Disconnected => {
                    UnavailableReason::Connectivity
                }
                ErrorKind::Subscription => UnavailableReason::Entitlement,
                ErrorKind::NoSecurityDefinition => UnavailableReason::InvalidContract,
                ErrorKind::NoScannerItems => UnavailableReason::NoData,
                ErrorKind::Unsupported => UnavailableReason::Unsupported,
                ErrorKind::DuplicateScannerSubscription
                | ErrorKind::Rejected
                | ErrorKind::Other => UnavailableReason::Broker,
            },
        };
        Unavailable::new(reason, err.to_string())
    }
}

/// Result of a read operation.
pub type Fetched<T> = Result<T, Unavailable>;

/// Why an order was not submitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    /// Bad order parameters. Never retried.
    #[error("invalid order: {0}")]
    Invalid(#[from] ValidationError),

    #[error("order not submitted: {0}")]
    Unavailable(#[from] Unavailable),
}
