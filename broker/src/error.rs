//! Transport error types.
//!
//! Broker failures are classified into an [`ErrorKind`] here, at the boundary,
//! so nothing above the transport has to inspect message text.

use std::fmt;

use serde::Serialize;

/// What kind of failure the broker (or the socket under it) reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call or the socket did not answer in time.
    Timeout,
    /// Nothing is listening on the port.
    ConnectionRefused,
    /// The session dropped or was never established.
    Disconnected,
    /// The account is not entitled to the requested market data class.
    Subscription,
    /// The broker has no contract matching the request.
    NoSecurityDefinition,
    /// A scanner subscription with the same id is still open broker-side.
    DuplicateScannerSubscription,
    /// The scan ran but the market window produced no rows.
    NoScannerItems,
    /// The session does not implement the call.
    Unsupported,
    /// The broker refused the request (order rejects, bad parameters).
    Rejected,
    Other,
}

impl ErrorKind {
    /// Socket-level failures that retry and cooldown apply to.
    pub fn is_connectivity(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ConnectionRefused | ErrorKind::Disconnected
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Subscription => "subscription",
            ErrorKind::NoSecurityDefinition => "no_security_definition",
            ErrorKind::DuplicateScannerSubscription => "duplicate_scanner_subscription",
            ErrorKind::NoScannerItems => "no_scanner_items",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified transport failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}{}: {message}", .code.map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct TransportError {
    pub kind: ErrorKind,
    /// Broker error code, when the failure came from a broker error message.
    pub code: Option<i32>,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Build from a broker `(code, message)` error pair.
    pub fn from_broker(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(Some(code), &message),
            code: Some(code),
            message,
        }
    }

    /// Build from free-form text (client library errors without a code).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(None, &message),
            code: None,
            message,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionRefused, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Subscription, message)
    }

    pub fn no_security_definition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSecurityDefinition, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind.is_connectivity()
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::ConnectionRefused => ErrorKind::ConnectionRefused,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::NotConnected
            | Io::UnexpectedEof => ErrorKind::Disconnected,
            _ => ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Broker error codes that mean "not entitled to this market data".
const SUBSCRIPTION_CODES: &[i32] = &[354, 10089, 10090, 10167, 10168, 10197];
/// Broker error codes that mean the session to TWS/Gateway is gone.
const DISCONNECT_CODES: &[i32] = &[502, 504, 1100, 2110];

/// Classify a broker error. Codes win; message text is the fallback for
/// client-library errors that carry no code.
pub fn classify(code: Option<i32>, message: &str) -> ErrorKind {
    let text = message.to_ascii_lowercase();

    if let Some(code) = code {
        if SUBSCRIPTION_CODES.contains(&code) {
            return ErrorKind::Subscription;
        }
        if DISCONNECT_CODES.contains(&code) {
            return ErrorKind::Disconnected;
        }
        match code {
            200 => return ErrorKind::NoSecurityDefinition,
            162 if text.contains("no items retrieved") => return ErrorKind::NoScannerItems,
            162 if text.contains("historical market data") => return ErrorKind::Subscription,
            324 if text.contains("duplicate") => return ErrorKind::DuplicateScannerSubscription,
            201 | 202 | 203 => return ErrorKind::Rejected,
            _ => {}
        }
    }

    if text.contains("connection refused") {
        ErrorKind::ConnectionRefused
    } else if text.contains("timed out") || text.contains("timeout") {
        ErrorKind::Timeout
    } else if text.contains("not connected")
        || text.contains("socket")
        || text.contains("connection reset")
        || text.contains("broken pipe")
    {
        ErrorKind::Disconnected
    } else if text.contains("no security definition") {
        ErrorKind::NoSecurityDefinition
    } else if text.contains("duplicate") && text.contains("scan") {
        ErrorKind::DuplicateScannerSubscription
    } else if text.contains("no items retrieved") {
        ErrorKind::NoScannerItems
    } else if text.contains("requires additional subscription")
        || text.contains("not subscribed")
        || text.contains("delayed market data is not")
    {
        ErrorKind::Subscription
    } else if text.contains("not supported") || text.contains("not implemented") {
        ErrorKind::Unsupported
    } else {
        ErrorKind::Other
    }
}
