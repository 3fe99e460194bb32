//! Error types for the remote API and the record log.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for remote API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Remote API errors. Callers branch on these, so the variants follow the
/// response status rather than the transport.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 404, also returned for reaction lookups with a badly encoded emoji
    #[error("not found: {0}")]
    NotFound(String),

    /// 403, usually a channel without read-history permission
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 401, bad or expired token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 429 persisted past the retry budget
    #[error("rate limited on {0}")]
    RateLimited(String),

    /// Any other non-2xx response
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// Connection failure, timeout
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body did not match the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether one resource cannot be read while the credentials still work.
    /// A rejected token is not: it fails every later request too.
    pub fn is_inaccessible(&self) -> bool {
        matches!(self, ApiError::NotFound(_) | ApiError::Forbidden(_))
    }
}

/// Errors decoding one record log line.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing ',' between record kind and payload")]
    MissingSeparator,

    #[error("unknown record kind '{0}'")]
    UnknownKind(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
