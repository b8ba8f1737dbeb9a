//! Failure classification: upstream unavailability vs. our own mistakes
//!
//! Only connectivity-style failures should count toward tripping a breaker.
//! Auth and bad-request failures mean the API is reachable and the problem
//! is on our side.

use std::error::Error;
use std::io;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure reported by an upstream API client
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl UpstreamError {
    /// Map a non-success HTTP status to an upstream error
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                UpstreamError::Authentication(message)
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                UpstreamError::Timeout(message)
            }
            s if s.is_server_error() => UpstreamError::Server {
                status: s.as_u16(),
                message,
            },
            _ => UpstreamError::BadRequest(message),
        }
    }

    /// Whether this failure means the upstream is unavailable
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Connection(_)
            | UpstreamError::Timeout(_)
            | UpstreamError::Server { .. }
            | UpstreamError::RateLimited(_) => true,
            UpstreamError::Authentication(_) | UpstreamError::BadRequest(_) => false,
        }
    }
}

/// Whether an HTTP status means the upstream is unavailable (5xx or 429)
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Returns `true` iff `error` represents upstream unavailability
///
/// Walks the error's source chain and decides on the first recognised
/// error: [`UpstreamError`], `reqwest::Error`, or a connectivity-kind
/// `std::io::Error`. Anything unrecognised is not transient.
pub fn classify(error: &(dyn Error + 'static)) -> bool {
    let mut current = Some(error);

    while let Some(err) = current {
        if let Some(upstream) = err.downcast_ref::<UpstreamError>() {
            return upstream.is_transient();
        }
        if let Some(http) = err.downcast_ref::<reqwest::Error>() {
            return classify_http(http);
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_transient_io(io_err.kind()) {
                return true;
            }
        }
        current = err.source();
    }

    false
}

fn classify_http(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() {
        return true;
    }
    error.status().map(is_transient_status).unwrap_or(false)
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "call failed")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_connectivity_failures_are_transient() {
        let cases = [
            UpstreamError::Connection("refused".to_string()),
            UpstreamError::Timeout("read timeout".to_string()),
            UpstreamError::Server {
                status: 500,
                message: "internal".to_string(),
            },
            UpstreamError::RateLimited("slow down".to_string()),
        ];
        for err in &cases {
            assert!(classify(err), "{} should be transient", err);
        }
    }

    #[test]
    fn test_client_failures_are_not_transient() {
        let cases = [
            UpstreamError::Authentication("invalid key".to_string()),
            UpstreamError::BadRequest("missing field".to_string()),
        ];
        for err in &cases {
            assert!(!classify(err), "{} should not be transient", err);
        }
    }

    #[test]
    fn test_unrelated_errors_are_not_transient() {
        let parse = "x".parse::<u32>().unwrap_err();
        assert!(!classify(&parse));

        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(!classify(&missing));
    }

    #[test]
    fn test_io_connectivity_in_source_chain() {
        let refused = Wrapped(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(classify(&refused));

        let denied = Wrapped(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!classify(&denied));
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(UpstreamError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(UpstreamError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(UpstreamError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!UpstreamError::from_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!UpstreamError::from_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!UpstreamError::from_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_transient_status() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
        assert!(!is_transient_status(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_reqwest_connect_error_is_transient() {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        // Port 9 (discard) is not served on loopback in test environments
        let err = client
            .get("http://127.0.0.1:9/health")
            .send()
            .await
            .unwrap_err();
        assert!(classify(&err));
    }
}
