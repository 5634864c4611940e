//! Unified error handling for the trip-tracker library.
//!
//! Every failure in this crate degrades to a fallback state at the session
//! level; these variants exist so the individual components can report what
//! went wrong and callers can log or surface it.

use thiserror::Error;

/// Unified error type for trip-tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Stream connect/subscribe failure
    #[error("Transport error on channel '{channel}': {message}")]
    Transport { channel: String, message: String },

    /// Every geocoding query variant for an endpoint came back empty
    #[error("Geocoding failed for {endpoint} after {attempted} queries")]
    GeocodeFailure { endpoint: String, attempted: usize },

    /// Route provider failed or reported no route
    #[error("Route fetch failed: {message}")]
    RouteFetch { message: String },

    /// Inbound point without usable coordinates
    #[error("Malformed point: {reason}")]
    MalformedPoint { reason: String },

    /// HTTP/API error
    #[error("{}", format_http_error(.message, .status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Async work finished after its session was torn down
    #[error("Operation cancelled: session is no longer live")]
    Cancelled,
}

impl TrackerError {
    /// Whether the user can meaningfully retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::GeocodeFailure { .. }
                | TrackerError::RouteFetch { .. }
                | TrackerError::Http { .. }
                | TrackerError::Transport { .. }
        )
    }
}

fn format_http_error(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("HTTP error ({}): {}", code, message),
        None => format!("HTTP error: {}", message),
    }
}

/// Result type alias for trip-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::GeocodeFailure {
            endpoint: "pickup".to_string(),
            attempted: 3,
        };
        assert!(err.to_string().contains("pickup"));
        assert!(err.to_string().contains("3 queries"));
    }

    #[test]
    fn test_http_display_with_and_without_status() {
        let with_code = TrackerError::Http {
            message: "Too Many Requests".to_string(),
            status_code: Some(429),
        };
        assert_eq!(with_code.to_string(), "HTTP error (429): Too Many Requests");

        let without = TrackerError::Http {
            message: "connection reset".to_string(),
            status_code: None,
        };
        assert_eq!(without.to_string(), "HTTP error: connection reset");
    }

    #[test]
    fn test_retryable() {
        assert!(TrackerError::RouteFetch {
            message: "NoRoute".into()
        }
        .is_retryable());
        assert!(!TrackerError::Cancelled.is_retryable());
        assert!(!TrackerError::MalformedPoint {
            reason: "missing lat".into()
        }
        .is_retryable());
    }
}
