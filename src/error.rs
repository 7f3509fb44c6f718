//! Error taxonomy shared by every provider-facing sub-session.
//!
//! Providers fail in vendor-specific ways (HTTP status codes, WebSocket
//! close codes, transport errors). `classify` maps all of that down to a
//! fixed, small taxonomy so the rest of the core only has to reason about
//! `ErrorKind` and a `retryable` flag.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    InvalidRequest,
    RateLimit,
    Timeout,
    Network,
    Server,
    Fatal,
    Unknown,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Auth | ErrorKind::InvalidRequest | ErrorKind::Fatal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "AUTH",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Server => "SERVER",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// A classified error: the stable taxonomy kind plus the original message
/// and, where it came from an HTTP response, the status code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ClassifiedError {
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
            status_code: None,
        }
    }
}

/// Typed construction-site error for the gateway itself (config, capacity,
/// queue discipline). Distinct from [`ClassifiedError`], which classifies
/// errors *received from* a provider.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("queue full")]
    QueueFull,
    #[error("shutting down")]
    ShuttingDown,
    #[error("session capacity exceeded")]
    Capacity,
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Provider(#[from] ClassifiedError),
}

/// Classify a provider/network error by inspecting its rendered message
/// and, if present, an explicit HTTP status code. Pure and infallible:
/// never panics, always returns a `ClassifiedError`.
pub fn classify(message: &str, status_code: Option<u16>) -> ClassifiedError {
    let kind = classify_kind(message, status_code);
    ClassifiedError {
        kind,
        message: message.to_string(),
        status_code,
    }
}

fn classify_kind(message: &str, status_code: Option<u16>) -> ErrorKind {
    if let Some(code) = status_code {
        match code {
            401 | 403 => return ErrorKind::Auth,
            400 | 404 | 422 => return ErrorKind::InvalidRequest,
            429 => return ErrorKind::RateLimit,
            500..=599 => return ErrorKind::Server,
            _ => {}
        }
    }

    let lower = message.to_lowercase();

    if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
        ErrorKind::Auth
    } else if lower.contains("context_length_exceeded")
        || lower.contains("context length")
        || lower.contains("400")
        || lower.contains("404")
        || lower.contains("422")
        || lower.contains("invalid request")
    {
        ErrorKind::InvalidRequest
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorKind::RateLimit
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("econnrefused")
        || lower.contains("etimedout")
        || lower.contains("ehostunreach")
    {
        ErrorKind::Timeout
    } else if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("server error")
        || lower.contains("service unavailable")
        || lower.contains("overloaded")
    {
        ErrorKind::Server
    } else if lower.contains("protocol violation") || lower.contains("parse error") || lower.contains("malformed") {
        ErrorKind::Fatal
    } else if lower.contains("connection")
        || lower.contains("closed")
        || lower.contains("reset")
        || lower.contains("unreachable")
    {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status_code() {
        assert_eq!(classify("denied", Some(401)).kind, ErrorKind::Auth);
        assert_eq!(classify("bad body", Some(400)).kind, ErrorKind::InvalidRequest);
        assert_eq!(classify("slow down", Some(429)).kind, ErrorKind::RateLimit);
        assert_eq!(classify("oops", Some(503)).kind, ErrorKind::Server);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(classify("429 Too Many Requests", None).kind, ErrorKind::RateLimit);
        assert_eq!(classify("503 Service Unavailable", None).kind, ErrorKind::Server);
        assert_eq!(classify("401 Unauthorized", None).kind, ErrorKind::Auth);
        assert_eq!(
            classify("context_length_exceeded", None).kind,
            ErrorKind::InvalidRequest
        );
        assert_eq!(classify("connection timed out", None).kind, ErrorKind::Timeout);
        assert_eq!(classify("something strange", None).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_retryable() {
        assert!(!ErrorKind::Auth.retryable());
        assert!(!ErrorKind::InvalidRequest.retryable());
        assert!(!ErrorKind::Fatal.retryable());
        assert!(ErrorKind::RateLimit.retryable());
        assert!(ErrorKind::Timeout.retryable());
        assert!(ErrorKind::Network.retryable());
        assert!(ErrorKind::Server.retryable());
        assert!(ErrorKind::Unknown.retryable());
    }

    #[test]
    fn test_never_panics_on_empty_message() {
        let c = classify("", None);
        assert_eq!(c.kind, ErrorKind::Unknown);
    }
}
