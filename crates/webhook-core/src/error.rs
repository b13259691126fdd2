//! Error taxonomy (spec.md §7), as `thiserror` enums. Each kind records
//! enough to build the `error_message` stored on a `CallbackExecution`.

use thiserror::Error;

/// Why the domain authorizer denied a URL.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DenyReason {
    #[error("malformed")]
    Malformed,
    #[error("unknown_domain")]
    UnknownDomain,
    #[error("inactive")]
    Inactive,
    #[error("unverified")]
    Unverified,
    #[error("expired")]
    Expired,
    #[error("https_required")]
    HttpsRequired,
    #[error("path_disallowed")]
    PathDisallowed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthorizeError {
    #[error("denied: {0}")]
    Denied(DenyReason),
}

/// Outcome of a single HTTP attempt, classified per spec.md §4.4.
#[derive(Clone, Debug, Error)]
pub enum AttemptError {
    #[error("transport_error: {0}")]
    Transport(String),
    #[error("attempt_timeout")]
    Timeout,
    #[error("server_error: status {0}")]
    ServerError(u16),
    #[error("client_error: status {0}")]
    ClientError(u16),
}

impl AttemptError {
    /// Retryable per spec.md §4.4: transport error, timeout, or status in
    /// {408, 429, 5xx}.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Transport(_) | AttemptError::Timeout | AttemptError::ServerError(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            AttemptError::ServerError(c) | AttemptError::ClientError(c) => Some(*c),
            _ => None,
        }
    }
}

/// Store-originated failure. Always logged and swallowed by the caller —
/// never changes an already-produced HTTP outcome (spec.md §4.1).
#[derive(Clone, Debug, Error)]
#[error("store_error: {0}")]
pub struct StoreError(pub String);

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        StoreError(s)
    }
}

/// Terminal dispatch result, recorded as one or more `CallbackExecution`
/// rows by the caller.
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    #[error("not_authorized: {0}")]
    NotAuthorized(DenyReason),
    #[error("circuit_open")]
    CircuitOpen,
    #[error("payload_serialization: {0}")]
    PayloadSerialization(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Attempt(#[from] AttemptError),
}

#[derive(Clone, Debug, Error)]
pub enum ConsumerError {
    #[error("deserialization_error: {0}")]
    Deserialization(String),
    #[error("broker_error: {0}")]
    Broker(String),
}
