//! Error types and error categorization.
//!
//! Configuration errors are fatal at startup. Dial errors are per-connection
//! and never abort the run; they are classified into an [`ErrorCategory`] so
//! log lines and metrics can be grouped by failure type.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};

/// Errors raised while turning command line input into a run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid resolve override '{spec}': {reason}. Format: 'host:port:addr[,addr...]'")]
    InvalidResolve { spec: String, reason: String },

    #[error("Invalid header '{0}'. Expected 'Name: value'")]
    InvalidHeader(String),

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Failed to read payload file {path:?}: {source}")]
    PayloadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Field '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("TLS configuration failed: {0}")]
    Tls(String),
}

/// Errors from dialing a single WebSocket connection.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {timeout:?} during {phase}")]
    Timeout {
        timeout: Duration,
        phase: &'static str,
    },

    /// The server answered the upgrade request with a non-101 response.
    #[error("WebSocket upgrade rejected: {status}")]
    UpgradeRejected {
        status: StatusCode,
        headers: HeaderMap,
        body: String,
    },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("Invalid dial target '{0}'")]
    InvalidTarget(String),

    #[error("Dial cancelled by stop")]
    Cancelled,
}

impl DialError {
    /// Converts a handshake error, pulling the HTTP response out of failed upgrades.
    pub fn from_handshake(error: tungstenite::Error) -> Self {
        match error {
            tungstenite::Error::Http(response) => DialError::upgrade_rejected(
                response.status(),
                response.headers(),
                response.body().as_deref(),
            ),
            other => DialError::Handshake(other),
        }
    }

    /// Builds an [`DialError::UpgradeRejected`] from the parts of the HTTP response.
    pub fn upgrade_rejected(
        status: StatusCode,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Self {
        DialError::UpgradeRejected {
            status,
            headers: headers.clone(),
            body: body
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Categories of dial failures that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// TCP connectivity errors (refused, unreachable, DNS)
    NetworkError,

    /// Connect or handshake timeouts
    TimeoutError,

    /// TLS/SSL certificate and handshake errors
    TlsError,

    /// Server answered the upgrade with a non-101 status
    UpgradeRejected,

    /// WebSocket protocol violations during the handshake
    ProtocolError,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize a dial error.
    pub fn from_dial_error(error: &DialError) -> Self {
        match error {
            DialError::Connect { .. } => ErrorCategory::NetworkError,
            DialError::Timeout { .. } => ErrorCategory::TimeoutError,
            DialError::UpgradeRejected { .. } => ErrorCategory::UpgradeRejected,
            DialError::InvalidTarget(_) | DialError::Cancelled => ErrorCategory::OtherError,
            DialError::Handshake(e) => match e {
                tungstenite::Error::Tls(_) => ErrorCategory::TlsError,
                tungstenite::Error::Io(_) | tungstenite::Error::ConnectionClosed => {
                    ErrorCategory::NetworkError
                }
                tungstenite::Error::Protocol(_) | tungstenite::Error::Url(_) => {
                    ErrorCategory::ProtocolError
                }
                _ => {
                    let msg = e.to_string().to_lowercase();
                    if msg.contains("certificate") || msg.contains("tls") {
                        ErrorCategory::TlsError
                    } else {
                        ErrorCategory::OtherError
                    }
                }
            },
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::UpgradeRejected => "upgrade_rejected",
            ErrorCategory::ProtocolError => "protocol_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Dial Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Errors",
            ErrorCategory::UpgradeRejected => "WebSocket Upgrade Rejected",
            ErrorCategory::ProtocolError => "WebSocket Protocol Errors",
            ErrorCategory::OtherError => "Other Errors",
        }
    }

    /// Get all error categories.
    pub fn all() -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::NetworkError,
            ErrorCategory::TimeoutError,
            ErrorCategory::TlsError,
            ErrorCategory::UpgradeRejected,
            ErrorCategory::ProtocolError,
            ErrorCategory::OtherError,
        ]
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
