//! Error types and the failure taxonomy consumed by the retry policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Limiters themselves never fail; errors here surface only from
/// configuration validation and config-file loading.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// Classification of a downstream failure, independent of the concrete
/// error type the caller uses.
///
/// The retry policy only ever sees this kind, never the payload: the caller
/// owns the actual call semantics and maps its errors into this taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The downstream rejected the call because a rate limit was hit.
    RateLimit,
    /// Connection-level failure (refused, reset, DNS).
    Network,
    /// The call did not complete within its deadline.
    Timeout,
    /// The downstream reported itself unavailable (e.g. 503, overloaded).
    ServiceUnavailable,
    /// Credentials rejected; retrying cannot help.
    Authentication,
    /// The request itself was malformed; retrying cannot help.
    InvalidRequest,
    /// The addressed resource does not exist.
    NotFound,
    /// Unclassified failure. Treated as non-transient: retrying unknown
    /// failures risks masking programming errors.
    Unknown,
}

impl ErrorKind {
    /// Whether this kind is retried by the default policy configuration.
    pub fn transient_by_default(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServiceUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Authentication => "authentication",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Maps a caller's error type into the [`ErrorKind`] taxonomy.
///
/// Implemented by the error type of whatever performs the gated downstream
/// call, so [`crate::retry::RetryPolicy`] can classify failures without
/// knowing anything about the protocol.
pub trait Classify {
    /// The failure classification for this error.
    fn error_kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_defaults() {
        assert!(ErrorKind::RateLimit.transient_by_default());
        assert!(ErrorKind::Network.transient_by_default());
        assert!(ErrorKind::Timeout.transient_by_default());
        assert!(ErrorKind::ServiceUnavailable.transient_by_default());

        assert!(!ErrorKind::Authentication.transient_by_default());
        assert!(!ErrorKind::InvalidRequest.transient_by_default());
        assert!(!ErrorKind::NotFound.transient_by_default());
        assert!(!ErrorKind::Unknown.transient_by_default());
    }

    #[test]
    fn kind_serde_round_trip() {
        let yaml = serde_yaml::to_string(&ErrorKind::ServiceUnavailable).unwrap();
        assert_eq!(yaml.trim(), "service_unavailable");

        let kind: ErrorKind = serde_yaml::from_str("rate_limit").unwrap();
        assert_eq!(kind, ErrorKind::RateLimit);
    }
}
